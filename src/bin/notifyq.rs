// src/bin/notifyq.rs
use anyhow::Result;
use clap::{Arg, ArgAction, Command};
use tracing_subscriber::EnvFilter;

mod commands;
use commands::*;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let app = Command::new("notifyq")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Rate-limited notification dispatch")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("start")
                .about("Run workers for the given queues until Ctrl+C")
                .arg(Arg::new("queues")
                    .short('q')
                    .long("queues")
                    .value_name("QUEUE1,QUEUE2")
                    .help("Comma-separated list of queues to process")
                    .default_value("message-group,tasks"))
                .arg(Arg::new("concurrency")
                    .short('c')
                    .long("concurrency")
                    .value_name("NUMBER")
                    .help("Jobs processed in parallel per queue")
                    .value_parser(clap::value_parser!(usize))
                    .default_value("5"))
        )
        .subcommand(
            Command::new("broadcast")
                .about("Enqueue numbered messages for one or more chats")
                .arg(Arg::new("chat_id")
                    .long("chat-id")
                    .value_name("ID")
                    .help("Target chat id, repeatable")
                    .value_parser(clap::value_parser!(i64))
                    .allow_negative_numbers(true)
                    .action(ArgAction::Append)
                    .required(true))
                .arg(Arg::new("count")
                    .short('n')
                    .long("count")
                    .value_name("NUMBER")
                    .help("Messages per chat")
                    .value_parser(clap::value_parser!(usize))
                    .default_value("200"))
                .arg(Arg::new("kind")
                    .short('k')
                    .long("kind")
                    .value_name("KIND")
                    .help("Recipient kind")
                    .value_parser(["group", "supergroup", "channel", "direct"])
                    .default_value("group"))
                .arg(Arg::new("queue")
                    .short('q')
                    .long("queue")
                    .value_name("QUEUE")
                    .help("Queue to enqueue into")
                    .default_value("message-group"))
        )
        .subcommand(
            Command::new("stats")
                .about("Show queue statistics")
                .arg(Arg::new("queue")
                    .short('q')
                    .long("queue")
                    .value_name("QUEUE")
                    .help("Show stats for specific queue"))
        );

    let matches = app.get_matches();

    match matches.subcommand() {
        Some(("start", sub_matches)) => start_command(sub_matches).await,
        Some(("broadcast", sub_matches)) => broadcast_command(sub_matches).await,
        Some(("stats", sub_matches)) => stats_command(sub_matches).await,
        _ => unreachable!("subcommand is required"),
    }
}
