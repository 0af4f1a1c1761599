// src/bin/commands/mod.rs
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::ArgMatches;
use colored::*;
use tokio::signal;

use notifyq::config::{EngineConfig, QueueConfig, RedisConfig};
use notifyq::handlers::{MessageHandler, TaskHandler};
use notifyq::notifier::{LogNotifier, Notifier};
use notifyq::payload::RecipientKind;
use notifyq::producer::Broadcaster;
use notifyq::rdconfig::RedisConnection;
use notifyq::store::{DynCounterStore, RedisCounterStore};
use notifyq::utils::constants::TASKS_QUEUE;
use notifyq::{CloseReport, DispatchEngine, RedisBroker};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

struct Runtime {
    broker: Arc<RedisBroker>,
    store: DynCounterStore,
    engine: DispatchEngine,
}

fn connect(config: EngineConfig) -> Result<Runtime> {
    let redis = RedisConfig::from_env().context("invalid Redis configuration")?;
    let conn = RedisConnection::connect(&redis).context("failed to open Redis client")?;
    let broker = Arc::new(RedisBroker::new(conn.clone()));
    let store: DynCounterStore = Arc::new(RedisCounterStore::new(conn));
    let engine = DispatchEngine::new(broker.clone(), store.clone(), config);
    Ok(Runtime { broker, store, engine })
}

async fn wait_ready(engine: &DispatchEngine) -> Result<()> {
    tokio::time::timeout(CONNECT_TIMEOUT, engine.ready())
        .await
        .context("Redis did not become ready in time")
}

fn print_report(report: &CloseReport) {
    if report.is_clean() {
        println!("{} {} resources closed", "✅".green(), report.closed);
    } else {
        println!(
            "{} {} resources closed, {} failed",
            "⚠️ ".yellow(),
            report.closed,
            report.failures.len()
        );
        for failure in &report.failures {
            eprintln!("  {}", failure.to_string().red());
        }
    }
}

// Run workers until Ctrl+C
pub async fn start_command(matches: &ArgMatches) -> Result<()> {
    let list = matches.get_one::<String>("queues").map(String::as_str).unwrap_or_default();
    let concurrency = matches.get_one::<usize>("concurrency").copied().unwrap_or(5);
    let queues = QueueConfig::from_list(list, concurrency);
    if queues.is_empty() {
        bail!("no queues given");
    }

    println!("{}", "🚀 Starting notifyq workers...".green().bold());
    println!("Queues: {}", queues.iter().map(|q| q.name.as_str()).collect::<Vec<_>>().join(", "));
    println!("Concurrency: {}", concurrency);

    let runtime = connect(EngineConfig::default().concurrency(concurrency))?;
    println!("{}", "⏳ Waiting for Redis...".blue());

    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier::new());
    for queue in &queues {
        let registered = if queue.name == TASKS_QUEUE {
            let handler = TaskHandler::new(notifier.clone(), runtime.store.clone());
            runtime.engine.register_handler(&queue.name, handler, Some(queue.concurrency)).await
        } else {
            let handler = MessageHandler::new(notifier.clone());
            runtime.engine.register_handler(&queue.name, handler, Some(queue.concurrency)).await
        };
        registered.with_context(|| format!("failed to start worker for '{}'", queue.name))?;
    }

    println!("{}", "✅ Workers started. Press Ctrl+C to stop.".green());
    signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;

    println!("\n{}", "🛑 Shutting down workers...".yellow());
    let report = runtime.engine.close().await;
    print_report(&report);
    Ok(())
}

// Enqueue a broadcast
pub async fn broadcast_command(matches: &ArgMatches) -> Result<()> {
    let chat_ids: Vec<i64> = matches
        .get_many::<i64>("chat_id")
        .map(|ids| ids.copied().collect())
        .unwrap_or_default();
    let count = matches.get_one::<usize>("count").copied().unwrap_or(200);
    let kind: RecipientKind = matches
        .get_one::<String>("kind")
        .map(|kind| serde_json::from_value(serde_json::Value::String(kind.clone())))
        .transpose()
        .context("invalid recipient kind")?
        .unwrap_or(RecipientKind::Group);
    let queue = matches
        .get_one::<String>("queue")
        .cloned()
        .unwrap_or_else(|| "message-group".to_string());

    let runtime = connect(EngineConfig::default())?;
    wait_ready(&runtime.engine).await?;

    let broadcaster = Broadcaster::new(runtime.engine.clone()).queue(&queue).kind(kind);
    let ids = broadcaster.broadcast(&chat_ids, count).await;
    let requested = chat_ids.len() * count;

    if ids.len() == requested {
        println!("{} Enqueued {} jobs on '{}'", "✅".green(), ids.len(), queue);
    } else {
        println!(
            "{} Enqueued {} of {} jobs on '{}'",
            "⚠️ ".yellow(),
            ids.len(),
            requested,
            queue
        );
    }
    runtime.engine.close().await;
    Ok(())
}

// Show queue statistics
pub async fn stats_command(matches: &ArgMatches) -> Result<()> {
    let runtime = connect(EngineConfig::default())?;
    wait_ready(&runtime.engine).await?;

    println!("{} {}", "📊".blue(), format!("notifyq statistics - {}", Utc::now().format("%H:%M:%S")).blue().bold());
    println!("{}", "=".repeat(60).blue());

    let queues: Vec<String> = match matches.get_one::<String>("queue") {
        Some(q) => vec![q.clone()],
        None => runtime.broker.known_queues().await?,
    };

    if queues.is_empty() {
        println!("{}", "No queues found.".yellow());
        return Ok(());
    }

    println!("{:<15} {:<8} {:<8} {:<8} {:<8} {:<8}",
        "Queue".bold(),
        "Waiting".yellow().bold(),
        "Delayed".blue().bold(),
        "Active".cyan().bold(),
        "Failed".red().bold(),
        "Done".green().bold()
    );
    println!("{}", "-".repeat(60));

    for queue in queues {
        let counts = runtime
            .broker
            .queue_counts(&queue)
            .await
            .with_context(|| format!("failed to read counts for '{queue}'"))?;
        println!("{:<15} {:<8} {:<8} {:<8} {:<8} {:<8}",
            queue,
            counts.waiting.to_string().yellow(),
            counts.delayed.to_string().blue(),
            counts.active.to_string().cyan(),
            counts.failed.to_string().red(),
            counts.completed.to_string().green()
        );
    }

    Ok(())
}
