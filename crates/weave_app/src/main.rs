mod commands;
mod logging;
mod paths;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use weave_network::payload::chat_text;
use weave_network::{
    Bookmark, HistoryEntry, Message, MessageBody, MessageKind, NetworkConfig, NodeIdentity,
    PeerId, SharedPage, WeaveNode, listener,
};

use crate::commands::{Command, HELP, split_host_port};

#[derive(Parser, Debug)]
#[command(author, version, about = "Weave peer-to-peer browsing node")]
struct Cli {
    /// Display name announced to peers (saved with the identity).
    #[arg(long)]
    name: Option<String>,

    /// Address to listen on (overrides the config file).
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Peer to connect to at startup; may be repeated.
    #[arg(long = "connect", value_name = "IP:PORT")]
    connect: Vec<String>,

    /// Path to the network config (default `~/.weave/network.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level for weave crates when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = logging::init_logging(&paths::logs_dir()?, &cli.log_level)?;

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => paths::config_path()?,
    };
    let mut config = NetworkConfig::load_or_default(&config_path);
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    let identity = load_identity(cli.name.as_deref())?;
    info!("Weave v{} as '{}' ({})", env!("CARGO_PKG_VERSION"), identity.name, identity.peer_id);

    let node = WeaveNode::new(identity, config);
    node.add_message_listener(listener(|message| {
        print_incoming(message);
        Ok(())
    }));

    node.start()
        .await
        .context("Failed to start the network node")?;
    if let Some(addr) = node.local_addr() {
        println!("Listening on {addr} as {} ({})", node.node_name(), node.node_id());
    }

    for addr in &cli.connect {
        match split_host_port(addr) {
            Ok((host, port)) => {
                node.connect_to_peer(&host, port).await;
            }
            Err(e) => warn!("Ignoring --connect {addr}: {e}"),
        }
    }

    println!("{HELP}");
    run_console(&node).await?;

    node.stop().await;
    info!("Goodbye");
    Ok(())
}

/// Load the persisted identity, renaming it if `--name` differs.
fn load_identity(name: Option<&str>) -> Result<NodeIdentity> {
    let path = paths::identity_path()?;
    let default_name = name.unwrap_or("weave-node");
    let mut identity = NodeIdentity::load_or_generate(&path, default_name);

    match name {
        Some(name) if identity.name != name => {
            identity.name = name.to_string();
            identity.save_to_file(&path)?;
        }
        _ => {}
    }
    Ok(identity)
}

/// Read commands from stdin until `/quit`, end of input or Ctrl-C.
async fn run_console(node: &WeaveNode) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        match Command::parse(&line) {
            Ok(Some(Command::Quit)) => break,
            Ok(Some(command)) => {
                if let Err(e) = execute(node, command).await {
                    println!("error: {e:#}");
                }
            }
            Ok(None) => {}
            Err(e) => println!("{e}"),
        }
    }
    Ok(())
}

async fn execute(node: &WeaveNode, command: Command) -> Result<()> {
    match command {
        Command::Peers => {
            let peers = node.connected_peers();
            if peers.is_empty() {
                println!("No connected peers");
            }
            for peer in peers {
                println!(
                    "{}  {:<16} {}  last seen {}",
                    peer.peer_id,
                    peer.peer_name,
                    peer.addr(),
                    peer.last_seen.format("%H:%M:%S")
                );
            }
        }
        Command::Connect { host, port } => {
            if node.connect_to_peer(&host, port).await {
                println!("Connected to {host}:{port}");
            } else {
                println!("Could not connect to {host}:{port}");
            }
        }
        Command::Share { url, title } => {
            let message = SharedPage::new(url, title).into_message(node.identity())?;
            report_broadcast(node, &message).await?;
        }
        Command::History { url, title } => {
            let message = HistoryEntry::now(node.identity(), url, title).into_message(node.identity())?;
            report_broadcast(node, &message).await?;
        }
        Command::Bookmark { url, title } => {
            let message = Bookmark::new(url, title).into_message(node.identity())?;
            report_broadcast(node, &message).await?;
        }
        Command::Msg { peer_id, text } => {
            let message = Message::chat(node.identity(), text);
            let delivered = node
                .send_to_peer(&PeerId::from_string(peer_id), &message)
                .await?;
            if !delivered {
                println!("Delivery failed; peer dropped");
            }
        }
        Command::Chat(text) => {
            report_broadcast(node, &Message::chat(node.identity(), text)).await?;
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
    Ok(())
}

async fn report_broadcast(node: &WeaveNode, message: &Message) -> Result<()> {
    let sent = node.broadcast(message).await?;
    if sent == 0 {
        println!("(no peers received {})", message.kind());
    }
    Ok(())
}

fn print_incoming(message: &Message) {
    let from = &message.sender_name;
    match &message.body {
        MessageBody::ChatMessage(_) => {
            println!("<{from}> {}", chat_text(message).unwrap_or_default());
        }
        MessageBody::Connect(info) => println!("* {} joined from {}", info.peer_name, info.addr()),
        MessageBody::Disconnect => println!("* {from} left"),
        _ => match message.kind() {
            MessageKind::SharePage => match message.payload_as::<SharedPage>() {
                Ok(page) => println!("* {from} shared {} <{}>", page.title, page.url),
                Err(_) => println!("{message}"),
            },
            MessageKind::ShareHistory => match message.payload_as::<HistoryEntry>() {
                Ok(entry) => println!("* {entry}"),
                Err(_) => println!("{message}"),
            },
            MessageKind::ShareBookmark => match message.payload_as::<Bookmark>() {
                Ok(mark) => println!("* {from} bookmarked {} <{}>", mark.title, mark.url),
                Err(_) => println!("{message}"),
            },
            _ => println!("{message}"),
        },
    }
}
