// ZRE node: joins groups, prints network events, shouts stdin lines.

use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zre_node::{config, Event, Node};

#[derive(Debug, Parser)]
#[command(name = "zre-node", version, about = "ZRE proximity group messaging node")]
struct Cli {
    /// Display name announced to peers.
    #[arg(long)]
    name: Option<String>,
    /// Group to join on start (repeatable). Stdin lines are shouted to these groups.
    #[arg(long = "group", value_name = "GROUP")]
    groups: Vec<String>,
    /// Header announced in HELLO, as KEY=VALUE (repeatable).
    #[arg(long = "header", value_name = "KEY=VALUE")]
    headers: Vec<String>,
    /// UDP discovery port.
    #[arg(long)]
    discovery_port: Option<u16>,
    /// TCP data port; 0 picks a random dynamic port.
    #[arg(long)]
    port: Option<u16>,
    /// Send a unicast beacon to this discovery address (repeatable).
    #[arg(long = "connect", value_name = "ADDR")]
    connect: Vec<SocketAddr>,
    /// UDP collector for LOG records.
    #[arg(long)]
    log_endpoint: Option<SocketAddr>,
    /// Do not broadcast beacons.
    #[arg(long)]
    no_beacons: bool,
    /// Debug-level logging (RUST_LOG takes precedence).
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let mut cfg = config::load();
    if let Some(name) = cli.name {
        cfg.name = Some(name);
    }
    for header in &cli.headers {
        let Some((key, value)) = header.split_once('=') else {
            bail!("header {header:?} is not KEY=VALUE");
        };
        cfg.headers.insert(key.to_string(), value.to_string());
    }
    if let Some(p) = cli.discovery_port {
        cfg.discovery_port = p;
    }
    if let Some(p) = cli.port {
        cfg.port = p;
    }
    if cli.log_endpoint.is_some() {
        cfg.log_endpoint = cli.log_endpoint;
    }
    if cli.no_beacons {
        cfg.beacons_enabled = false;
    }

    let mut node = Node::new(cfg).await.context("starting node")?;
    node.start()?;
    for group in &cli.groups {
        node.join(group.as_str())?;
    }
    for addr in &cli.connect {
        if let Err(e) = node.connect(*addr).await {
            warn!(%addr, error = %e, "connect failed");
        }
    }
    info!(
        id = %node.identity(),
        name = %node.name().await?,
        endpoint = %node.endpoint().await?,
        "node up"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                break;
            }
            event = node.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) if !line.trim().is_empty() => {
                    for group in &cli.groups {
                        node.shout(group.as_str(), line.as_bytes())?;
                    }
                }
                Some(_) => {}
                None => stdin_open = false,
            },
        }
    }

    info!("shutting down");
    node.stop().await?;
    Ok(())
}

fn print_event(event: &Event) {
    match event {
        Event::Enter {
            peer,
            name,
            endpoint,
            headers,
        } => println!("ENTER {name} ({peer}) at {endpoint} {headers:?}"),
        Event::Exit { peer, name } => println!("EXIT {name} ({peer})"),
        Event::Evasive { peer, name } => println!("EVASIVE {name} ({peer})"),
        Event::Join { name, group, .. } => println!("JOIN {name} -> {group}"),
        Event::Leave { name, group, .. } => println!("LEAVE {name} <- {group}"),
        Event::Whisper { name, content, .. } => {
            println!("WHISPER {name}: {}", String::from_utf8_lossy(content))
        }
        Event::Shout {
            name,
            group,
            content,
            ..
        } => println!("SHOUT {name} [{group}]: {}", String::from_utf8_lossy(content)),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
