// meshrelay: desktop CLI for the store-and-forward mesh
//
// Cross-platform (macOS, Linux, Windows) command-line interface. Peer links
// are plain TCP to configured addresses.

mod config;
mod tcp;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use meshrelay_core::{
    DeliveryStatus, DeviceIdentity, MeshNode, NodeDelegate, OutboxRecord, ReceivedContent,
    SledStorage, StorageBackend,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meshrelay")]
#[command(about = "meshrelay: store-and-forward encrypted mesh messaging", long_about = None)]
#[command(version)]
struct Cli {
    /// Log routing decisions (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config and device identity
    Init,
    /// Show this device's identifier
    Identity,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Manage static peer addresses
    Peer {
        #[command(subcommand)]
        action: PeerAction,
    },
    /// Queue a message without starting the node
    Send { recipient: String, message: String },
    /// Show originated messages and their delivery status
    Outbox {
        /// Remove failed messages
        #[arg(long)]
        dismiss_failed: bool,
    },
    /// Start the mesh node
    Start {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Show node status
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[derive(Subcommand)]
enum PeerAction {
    Add { address: String },
    Remove { address: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;
    let _log_guard = init_logging(cli.verbose, config.log_file.as_deref())?;

    match cli.command {
        Commands::Init => cmd_init(config).await,
        Commands::Identity => cmd_identity(config).await,
        Commands::Config { action } => cmd_config(config, action).await,
        Commands::Peer { action } => cmd_peer(config, action).await,
        Commands::Send { recipient, message } => cmd_send_offline(config, recipient, message).await,
        Commands::Outbox { dismiss_failed } => cmd_outbox(config, dismiss_failed).await,
        Commands::Start { port } => cmd_start(config, port).await,
        Commands::Status => cmd_status(config).await,
    }
}

/// Console logging filtered by RUST_LOG (default `warn`, `--verbose` for
/// `debug`), plus an optional JSON log file.
fn init_logging(
    verbose: bool,
    log_file: Option<&str>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));
    let console = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match log_file {
        Some(path) => {
            let path = std::path::Path::new(path);
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let name = path.file_name().context("log_file has no file name")?;
            std::fs::create_dir_all(dir).context("Failed to create log directory")?;

            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
            Ok(None)
        }
    }
}

fn open_storage(config: &config::Config) -> Result<Arc<dyn StorageBackend>> {
    let path = config.storage_dir()?;
    let storage = SledStorage::open(&path).with_context(|| {
        format!(
            "Failed to open storage at {} (is another meshrelay running?)",
            path.display()
        )
    })?;
    Ok(Arc::new(storage))
}

async fn open_node(config: &config::Config) -> Result<MeshNode> {
    let passphrase = config.resolve_passphrase()?;
    let backend = open_storage(config)?;
    MeshNode::new(config.node.clone(), &passphrase, backend)
        .await
        .context("Failed to open mesh node")
}

async fn cmd_init(config: config::Config) -> Result<()> {
    println!("{}", "Initializing meshrelay...".bold());
    println!();

    println!(
        "  {} Configuration: {}",
        "✓".green(),
        config::Config::config_file()?.display()
    );

    let storage_dir = config.storage_dir()?;
    let backend = open_storage(&config)?;
    println!("  {} Storage: {}", "✓".green(), storage_dir.display());

    let identity = DeviceIdentity::load_or_create(backend, config.node.device_id.as_deref())
        .context("Failed to initialize identity")?;
    println!("  {} Device ID: {}", "✓".green(), identity.device_id().bright_cyan());
    println!();

    println!("{}", "Next steps:".bold());
    if config.passphrase.is_none() {
        println!(
            "  • Set the network passphrase: {}",
            "meshrelay config set passphrase <secret>".bright_green()
        );
    }
    println!("  • Add a peer:   {}", "meshrelay peer add <host:port>".bright_green());
    println!("  • Start node:   {}", "meshrelay start".bright_green());

    Ok(())
}

async fn cmd_identity(config: config::Config) -> Result<()> {
    let backend = open_storage(&config)?;
    let identity = DeviceIdentity::load_or_create(backend, config.node.device_id.as_deref())
        .context("Failed to load identity")?;

    println!("{}", "Identity".bold());
    println!("  Device ID: {}", identity.device_id().bright_cyan());
    Ok(())
}

async fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            let shown = if key == "passphrase" { "(set)".to_string() } else { value };
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), shown);
        }

        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{} = {}", key.bright_cyan(), value),
            None => anyhow::bail!("Unknown or unset config key: {}", key),
        },

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<26} {}", key.bright_cyan(), value);
            }
        }
    }

    Ok(())
}

async fn cmd_peer(mut config: config::Config, action: PeerAction) -> Result<()> {
    match action {
        PeerAction::Add { address } => {
            let valid_port = address
                .rsplit_once(':')
                .filter(|(host, _)| !host.is_empty())
                .and_then(|(_, port)| port.parse::<u16>().ok())
                .is_some();
            if !valid_port {
                anyhow::bail!("Invalid peer address {} (expected host:port)", address);
            }

            if config.add_peer(address.clone()) {
                config.save()?;
                println!("{} Added peer: {}", "✓".green(), address);
            } else {
                println!("{} Already configured: {}", "•".dimmed(), address);
            }
        }

        PeerAction::Remove { address } => {
            if config.remove_peer(&address) {
                config.save()?;
                println!("{} Removed peer: {}", "✓".green(), address);
            } else {
                anyhow::bail!("Peer not configured: {}", address);
            }
        }

        PeerAction::List => {
            println!("{}", "Peers".bold());
            if config.peers.is_empty() {
                println!("  {}", "(none configured)".dimmed());
            } else {
                for (i, peer) in config.peers.iter().enumerate() {
                    println!("  {}. {}", i + 1, peer);
                }
            }
        }
    }

    Ok(())
}

async fn cmd_send_offline(config: config::Config, recipient: String, message: String) -> Result<()> {
    let node = open_node(&config).await?;
    let message_id = node
        .send_message(&recipient, &message)
        .await
        .context("Failed to queue message")?;

    println!("{} Queued {} for {}", "✓".green(), message_id.bright_cyan(), recipient);
    println!("  It goes out the next time {} runs.", "meshrelay start".bright_green());
    Ok(())
}

async fn cmd_outbox(config: config::Config, dismiss_failed: bool) -> Result<()> {
    let node = open_node(&config).await?;

    if dismiss_failed {
        let removed = node.dismiss_failed()?;
        println!("{} Dismissed {} failed message(s)", "✓".green(), removed);
        return Ok(());
    }

    let records = node.outbox()?;
    if records.is_empty() {
        println!("{}", "Outbox is empty.".dimmed());
        return Ok(());
    }

    println!("{} ({} messages)", "Outbox".bold(), records.len());
    println!();
    for record in &records {
        print_record(record);
    }
    Ok(())
}

async fn cmd_status(config: config::Config) -> Result<()> {
    let node = open_node(&config).await?;
    let records = node.outbox()?;
    let count = |status: DeliveryStatus| records.iter().filter(|r| r.status == status).count();

    println!("{}", "meshrelay Status".bold());
    println!();
    println!("Device ID:  {}", node.device_id().bright_cyan());
    println!("Peers:      {} configured", config.peers.len());
    println!(
        "Outbox:     {} (sent: {}, delivered: {}, failed: {})",
        records.len(),
        count(DeliveryStatus::Sent),
        count(DeliveryStatus::Delivered),
        count(DeliveryStatus::Failed)
    );
    Ok(())
}

/// Prints node callbacks between prompts
struct ConsoleDelegate;

impl NodeDelegate for ConsoleDelegate {
    fn on_message_received(&self, from: String, envelope_id: String, content: ReceivedContent) {
        let text = match &content {
            ReceivedContent::Text(text) => text.normal(),
            ReceivedContent::Undecryptable => content.to_string().red(),
        };
        println!("\n{} {}: {}", "←".bright_blue(), from.bright_cyan(), text);
        println!("  {}", envelope_id.dimmed());
        prompt();
    }

    fn on_status_changed(&self, message_id: String, status: DeliveryStatus) {
        let label = match status {
            DeliveryStatus::Sent => status.to_string().normal(),
            DeliveryStatus::Delivered => status.to_string().yellow(),
            DeliveryStatus::Read => status.to_string().green(),
            DeliveryStatus::Failed => status.to_string().red(),
        };
        println!("\n{} {} {}", "•".dimmed(), message_id.dimmed(), label);
        prompt();
    }

    fn on_peer_connected(&self, peer_id: String) {
        println!("\n{} Peer: {}", "✓".green(), peer_id);
        prompt();
    }

    fn on_peer_disconnected(&self, peer_id: String) {
        println!("\n{} Peer left: {}", "✗".red(), peer_id);
        prompt();
    }
}

fn prompt() {
    print!("> ");
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

async fn cmd_start(config: config::Config, port: Option<u16>) -> Result<()> {
    let port = port.unwrap_or(config.listen_port);
    let node = open_node(&config).await?;
    node.set_delegate(Some(Arc::new(ConsoleDelegate)));

    println!("{}", "Starting meshrelay...".bold());
    println!();
    println!("Device ID: {}", node.device_id().bright_cyan());

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
    let transport = tcp::TcpTransport::new(node.device_id(), node.inbound());
    let bound = transport.listen(listen_addr).await?;
    println!("{} Listening on {}", "✓".green(), bound);

    for address in &config.peers {
        match transport.dial(address).await {
            Ok(peer_id) => println!("{} Linked {} ({})", "✓".green(), address, peer_id),
            Err(e) => println!("{} {}: {:#}", "✗".red(), address, e),
        }
    }

    println!();
    println!("{}", "Commands:".bold());
    println!("  {} <device-id> <message>", "send".bright_green());
    println!("  {} <message-id>", "read".bright_green());
    println!("  {} <host:port>", "connect".bright_green());
    println!("  {}", "peers".bright_green());
    println!("  {}", "outbox".bright_green());
    println!("  {}", "status".bright_green());
    println!("  {}", "quit".bright_green());
    println!();

    let runner = node.clone();
    let node_task = tokio::spawn(async move { runner.run().await });

    let stdin_node = node.clone();
    let stdin_task = tokio::spawn(async move {
        use tokio::io::AsyncBufReadExt;

        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();
        prompt();

        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line == "quit" || line == "exit" {
                println!("Shutting down...");
                break;
            }
            if !line.is_empty() {
                handle_command(&stdin_node, &transport, line).await;
            }
            prompt();
        }
    });

    tokio::select! {
        result = node_task => {
            result.context("Node task panicked")??;
        }
        _ = stdin_task => {
            node.shutdown();
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
            node.shutdown();
        }
    }

    Ok(())
}

async fn handle_command(node: &MeshNode, transport: &tcp::TcpTransport, line: &str) {
    let mut parts = line.splitn(3, ' ');
    let command = parts.next().unwrap_or_default();

    match command {
        "send" => match (parts.next(), parts.next()) {
            (Some(to), Some(text)) => match node.send_message(to, text).await {
                Ok(id) => println!("{} Sent {}", "✓".green(), id.dimmed()),
                Err(e) => println!("{} {}", "✗".red(), e),
            },
            _ => println!("Usage: send <device-id> <message>"),
        },

        "read" => match parts.next() {
            Some(id) => match node.mark_read(id).await {
                Ok(true) => println!("{} Marked read", "✓".green()),
                Ok(false) => println!("{} Nothing unread with that id", "•".dimmed()),
                Err(e) => println!("{} {}", "✗".red(), e),
            },
            None => {
                let unread = node.unread();
                if unread.is_empty() {
                    println!("No unread messages.");
                }
                for id in unread {
                    println!("  • {}", id);
                }
            }
        },

        "connect" => match parts.next() {
            Some(address) => {
                match transport.dial(address).await {
                    Ok(peer_id) => println!("{} Linked {}", "✓".green(), peer_id),
                    Err(e) => println!("{} {:#}", "✗".red(), e),
                }
            }
            None => println!("Usage: connect <host:port>"),
        },

        "peers" => {
            let peers = node.connected_peers();
            if peers.is_empty() {
                println!("No peers.");
            }
            for peer in peers {
                println!("  • {}", peer.bright_cyan());
            }
        }

        "outbox" => match node.outbox() {
            Ok(records) if records.is_empty() => println!("Outbox is empty."),
            Ok(records) => records.iter().for_each(print_record),
            Err(e) => println!("{} {}", "✗".red(), e),
        },

        "status" => {
            let stats = node.router_stats();
            println!("Peers:      {}", node.connected_peers().len());
            println!("Delivered:  {}", stats.delivered);
            println!("Forwarded:  {}", stats.forwarded);
            println!(
                "Dropped:    {} duplicate, {} other",
                stats.dropped_duplicate, stats.dropped_other
            );
        }

        _ => println!("Try: send, read, connect, peers, outbox, status, quit"),
    }
}

fn print_record(record: &OutboxRecord) {
    let status = match record.status {
        DeliveryStatus::Sent => "sent".normal(),
        DeliveryStatus::Delivered => "delivered".yellow(),
        DeliveryStatus::Read => "read".green(),
        DeliveryStatus::Failed => "failed".red(),
    };
    println!(
        "  {} → {} [{}] {}",
        record.id().dimmed(),
        record.recipient().bright_cyan(),
        format_timestamp(record.created_at()),
        status
    );
    println!("    attempts: {}", record.attempts);
}

fn format_timestamp(timestamp_ms: u64) -> String {
    use chrono::{DateTime, Local, Utc};

    let dt = DateTime::from_timestamp_millis(timestamp_ms as i64).unwrap_or_else(Utc::now);
    let local: DateTime<Local> = dt.into();

    local.format("%Y-%m-%d %H:%M:%S").to_string()
}
