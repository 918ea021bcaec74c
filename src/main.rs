use chrono::{DateTime, Local};
use clap::Parser;
use dotenvy::dotenv;
use tokio::io::{AsyncBufReadExt, BufReader};

use p2p_direct_chat::ChatNode;
use p2p_direct_chat::common::commands::USAGE;
use p2p_direct_chat::common::{MessageEnvelope, ShellCommand};
use p2p_direct_chat::config::{self, AppConfig};
use p2p_direct_chat::storage::MessageRecord;

#[derive(Parser)]
#[command(
    name = "p2p_direct_chat",
    version,
    about = "Serverless peer-to-peer chat with store-and-forward delivery"
)]
struct Cli {
    /// Path to JSON config file
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH, value_name = "FILE")]
    config: String,
    /// TCP address to accept peer connections on
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,
    /// SQLite database file (":memory:" for a throwaway node)
    #[arg(long, value_name = "FILE")]
    database: Option<String>,
    /// UDP port for LAN announcements
    #[arg(long, value_name = "PORT")]
    discovery_port: Option<u16>,
    /// Do not announce or listen for peers on the LAN
    #[arg(long)]
    no_discovery: bool,
    /// Write the effective configuration to the config file and exit
    #[arg(long)]
    save_config: bool,
}

impl Cli {
    fn apply(&self, mut config: AppConfig) -> AppConfig {
        if let Some(listen) = &self.listen {
            config.listen_addr = listen.clone();
        }
        if let Some(database) = &self.database {
            config.database_path = database.clone();
        }
        if let Some(port) = self.discovery_port {
            config.discovery_port = port;
        }
        if self.no_discovery {
            config.discovery_enabled = false;
        }
        config
    }
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let app_config = cli.apply(config::load_config(&cli.config));

    if cli.save_config {
        if let Err(err) = config::save_config(&cli.config, &app_config) {
            log::error!("Failed to write {}: {err}", cli.config);
            std::process::exit(1);
        }
        return;
    }

    let history_limit = app_config.history_limit;
    let node = match ChatNode::start(app_config).await {
        Ok(node) => node,
        Err(err) => {
            log::error!("Failed to start chat node: {err}");
            std::process::exit(1);
        }
    };

    println!(
        "Peer {} listening on {}",
        node.local_peer_id(),
        node.listen_addr()
    );
    println!("{USAGE}");

    let mut incoming = node.subscribe();
    tokio::spawn(async move {
        while let Some(envelope) = incoming.recv().await {
            print_incoming(&envelope);
        }
    });

    run_shell(&node, history_limit).await;
    node.shutdown();
}

async fn run_shell(node: &ChatNode, history_limit: usize) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                log::error!("Failed to read stdin: {err}");
                break;
            }
        };

        match ShellCommand::parse(&line) {
            Ok(Some(ShellCommand::Exit)) => break,
            Ok(Some(command)) => execute(node, command, history_limit).await,
            Ok(None) => {}
            Err(hint) => println!("{hint}"),
        }
    }
}

async fn execute(node: &ChatNode, command: ShellCommand, history_limit: usize) {
    match command {
        ShellCommand::Peers => {
            let peers = node.peers();
            if peers.is_empty() {
                println!("No known peers");
            }
            for peer in peers {
                let state = if peer.online { "online" } else { "offline" };
                println!("  {} @ {} ({state})", peer.peer_id, peer.address);
            }
        }
        ShellCommand::Connect { peer_id, address } => match node.connect(&peer_id, address).await {
            Ok(()) => println!("Connected to {peer_id}"),
            Err(err) => println!("Could not connect to {peer_id}: {err}"),
        },
        ShellCommand::Send { peer_id, content } => {
            match node.send_message(&peer_id, &content).await {
                Ok(true) => println!("Sent to {peer_id}"),
                Ok(false) => println!("{peer_id} is offline; message queued"),
                Err(err) => log::error!("Failed to store message for {peer_id}: {err}"),
            }
        }
        ShellCommand::History { peer_id, limit } => {
            let limit = limit.unwrap_or(history_limit);
            match node.get_conversation(&peer_id, limit).await {
                Ok(records) if records.is_empty() => println!("No messages with {peer_id}"),
                // Stored newest first; print oldest at the top.
                Ok(records) => records.iter().rev().for_each(print_record),
                Err(err) => log::error!("Failed to load history with {peer_id}: {err}"),
            }
        }
        ShellCommand::Flush { peer_id } => match node.flush_pending(&peer_id).await {
            Ok(count) => println!("Flushed {count} message(s) to {peer_id}"),
            Err(err) => log::error!("Flush for {peer_id} failed: {err}"),
        },
        ShellCommand::WhoAmI => {
            println!("{} @ {}", node.local_peer_id(), node.listen_addr());
        }
        ShellCommand::Help => println!("{USAGE}"),
        ShellCommand::Exit => {}
    }
}

fn format_time(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|time| time.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn print_incoming(envelope: &MessageEnvelope) {
    println!(
        "[{}] {}: {}",
        format_time(envelope.timestamp),
        envelope.sender_id,
        envelope.content
    );
}

fn print_record(record: &MessageRecord) {
    let status = if record.delivered {
        "delivered"
    } else if record.sent {
        "sent"
    } else {
        "pending"
    };
    println!(
        "[{}] {} -> {}: {} ({status})",
        format_time(record.timestamp),
        record.sender_id,
        record.recipient_id,
        record.content
    );
}
