// src/rdconfig.rs
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use redis::{aio::ConnectionManager, Client};
use tracing::{info, warn};

use crate::config::RedisConfig;
use crate::error::{DispatchError, Result};
use crate::readiness::{ReadyListener, Readiness};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Shared Redis connection with a readiness signal.
///
/// The connection is established in the background; until the first PING
/// succeeds every command fails with `BrokerUnavailable`. The underlying
/// `ConnectionManager` reconnects on its own afterwards.
#[derive(Clone)]
pub struct RedisConnection {
    inner: Arc<Inner>,
}

struct Inner {
    url: String,
    manager: OnceLock<ConnectionManager>,
    readiness: Readiness,
}

impl RedisConnection {
    /// Starts connecting in the background and returns immediately.
    pub fn connect(config: &RedisConfig) -> Result<Self> {
        let url = config.url();
        // Client::open will auto-handle rediss:// if TLS feature is enabled
        let client = Client::open(url.as_str())?;
        let conn = Self {
            inner: Arc::new(Inner {
                url,
                manager: OnceLock::new(),
                readiness: Readiness::new(),
            }),
        };

        let background = conn.clone();
        tokio::spawn(async move { background.establish(client).await });
        Ok(conn)
    }

    async fn establish(&self, client: Client) {
        loop {
            match Self::open_manager(&client).await {
                Ok(manager) => {
                    let _ = self.inner.manager.set(manager);
                    self.inner.readiness.mark_ready();
                    info!(url = %redacted(&self.inner.url), "Redis connection ready");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Redis not reachable yet, retrying");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    async fn open_manager(client: &Client) -> redis::RedisResult<ConnectionManager> {
        let mut manager = client.get_connection_manager().await?;
        redis::cmd("PING").query_async::<_, String>(&mut manager).await?;
        Ok(manager)
    }

    pub fn is_ready(&self) -> bool {
        self.inner.readiness.is_ready()
    }

    pub fn listener(&self) -> ReadyListener {
        self.inner.readiness.listener()
    }

    /// A handle on the shared multiplexed connection.
    pub fn manager(&self) -> Result<ConnectionManager> {
        self.inner
            .manager
            .get()
            .cloned()
            .ok_or_else(|| DispatchError::BrokerUnavailable("Redis connection is not established".to_string()))
    }
}

/// Strips credentials from a Redis URL for logging.
fn redacted(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => format!("{}://***{}", &url[..scheme], &url[at..]),
        _ => url.to_string(),
    }
}
