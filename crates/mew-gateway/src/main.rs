//! MEW Gateway - single authoritative process of a space

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mew_core::config::{TransportKind, load_space_config};
use mew_gateway::space::{self, EVENT_QUEUE_CAPACITY, GatewayCore, TokenTable};
use mew_gateway::{shutdown, transport};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// MEW Gateway - single authoritative process of a space
#[derive(Parser, Debug)]
#[command(name = "mew-gateway")]
#[command(about = "Gateway process hosting one MEW space")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the gateway for a space
    Start(StartArgs),
}

#[derive(Args, Debug)]
struct StartArgs {
    /// Path to the space descriptor (space.yaml)
    #[arg(long, value_name = "PATH")]
    space_config: PathBuf,

    /// Directory for FIFO pairs (default: <spaceDir>/.mew/fifos)
    #[arg(long, value_name = "PATH")]
    fifo_dir: Option<PathBuf>,

    /// Log verbosity: error, warn, info, or debug
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Start(args) => start(args).await,
    }
}

async fn start(args: StartArgs) -> Result<()> {
    mew_core::logging::init(args.log_level.as_deref());
    info!("MEW gateway starting...");

    let config =
        load_space_config(&args.space_config).context("Failed to load space config")?;
    let space_dir = args
        .space_config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    info!("Serving space {:?} from {}", config.space.id, space_dir.display());

    // Resolve a token for every configured participant up front so join
    // handling never touches the filesystem.
    let mut tokens = TokenTable::new();
    for (participant_id, participant) in &config.participants {
        let token = mew_core::tokens::resolve_token(&space_dir, participant_id, &participant.tokens)
            .with_context(|| format!("Failed to resolve token for participant {participant_id}"))?;
        tokens.insert(participant_id.clone(), token);
    }
    info!("Resolved tokens for {} participant(s)", config.participants.len());

    let stdio_participants: Vec<String> = config
        .participants
        .keys()
        .filter(|id| config.transport_for(id) == TransportKind::Stdio)
        .cloned()
        .collect();
    let listen = config.gateway.websocket.listen.clone();

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let cancel = CancellationToken::new();

    // Set up signal handlers
    let cancel_for_signals = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to create SIGTERM handler");

            tokio::select! {
                _ = ctrl_c => {
                    info!("Received SIGINT (Ctrl+C)");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                }
            }
        }

        #[cfg(not(unix))]
        {
            ctrl_c.await.expect("Failed to listen for Ctrl+C");
            info!("Received Ctrl+C");
        }

        cancel_for_signals.cancel();
    });

    // Bind before spawning anything so a port collision is a startup
    // failure (exit 1), not a background log line.
    let listener = transport::websocket::bind(&listen).await?;

    let core = GatewayCore::new(config, tokens);
    let core_task = tokio::spawn(space::run(core, events_rx, cancel.clone()));

    let ws_events = events_tx.clone();
    let ws_cancel = cancel.clone();
    let ws_task = tokio::spawn(async move {
        transport::websocket::run_listener(listener, ws_events, ws_cancel).await;
    });

    let fifo_dir = args
        .fifo_dir
        .unwrap_or_else(|| transport::fifo::default_fifo_dir(&space_dir));
    transport::fifo::spawn_fifo_channels(
        &fifo_dir,
        &stdio_participants,
        events_tx.clone(),
        cancel.clone(),
    )
    .context("Failed to set up FIFO transport")?;
    if !stdio_participants.is_empty() {
        info!(
            "FIFO transport serving {} participant(s) under {}",
            stdio_participants.len(),
            fifo_dir.display()
        );
    }

    drop(events_tx);

    info!("MEW gateway ready");
    cancel.cancelled().await;

    shutdown::graceful_shutdown(
        vec![("space-core", core_task), ("websocket-listener", ws_task)],
        Duration::from_secs(5),
    )
    .await;

    info!("MEW gateway shutdown complete");
    Ok(())
}
