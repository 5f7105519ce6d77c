//! Homescreen hub binary - runs the IPC hub on a WebSocket listener.
//!
//! This is the main binary entry point. See the `homescreen_hub` library
//! for the core functionality.

use anyhow::{Context, Result};
use homescreen_hub::handlers::{CommandChannel, CommandExecutor, CommandOutcome, SessionChannel};
use homescreen_hub::hub::poll_loop::PollLoop;
use homescreen_hub::hub::trim_text;
use homescreen_hub::transport::websocket::WsTransport;
use homescreen_hub::{ChannelTag, ConnectionInfo, HubBuilder, HubConfig};
use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Global flag for signal-triggered shutdown (as Arc for signal-hook compatibility)
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

/// Shape of a command-channel request.
#[derive(Debug, Deserialize)]
struct CommandRequest {
    command: String,
    #[serde(default)]
    args: serde_json::Value,
}

fn parse_request(payload: &[u8]) -> Option<CommandRequest> {
    serde_json::from_slice(trim_text(payload)).ok()
}

/// Validates and logs commands. Window-manager integration lives in the
/// embedding shell, not here.
#[derive(Debug, Default)]
struct LoggingExecutor;

impl CommandExecutor for LoggingExecutor {
    fn execute(&mut self, connection: &ConnectionInfo, payload: &[u8]) -> CommandOutcome {
        match parse_request(payload) {
            Some(request) => {
                log::info!(
                    "[Hub] Command '{}' from {} args={}",
                    request.command,
                    connection.id,
                    request.args
                );
                CommandOutcome::Done
            }
            None => {
                log::warn!("[Hub] Malformed command from {} ({} bytes)", connection.id, payload.len());
                CommandOutcome::Failed
            }
        }
    }

    fn label(&self, payload: &[u8]) -> String {
        parse_request(payload).map_or_else(|| "COMMAND".to_string(), |r| r.command.to_uppercase())
    }
}

/// Run the hub until SIGINT/SIGTERM/SIGHUP.
fn run(config: HubConfig) -> Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;

    let names = &config.channels;
    let builder = HubBuilder::new()
        .channel(
            ChannelTag::COMMAND,
            names.command.as_str(),
            Box::new(CommandChannel::new(LoggingExecutor)),
        )
        .channel(ChannelTag::STATUS, names.status.as_str(), SessionChannel::new(&names.status).boxed())
        .channel(ChannelTag::DIALOG, names.dialog.as_str(), SessionChannel::new(&names.dialog).boxed())
        .channel(
            ChannelTag::APPLICATION,
            names.application.as_str(),
            SessionChannel::new(&names.application).boxed(),
        )
        .reject_duplicates(config.reject_duplicate_connections);

    let transport = WsTransport::bind(config.listen_addr(), builder.protocols())?;
    let mut hub = builder
        .build(transport, PollLoop::new())
        .context("Invalid channel configuration")?;

    log::info!("Homescreen hub v{} started on {}", VERSION, config.listen_addr());

    let idle_wait = config.idle_wait();
    let service_timeout = config.service_timeout();
    while !SHUTDOWN_FLAG.load(Ordering::Relaxed) {
        hub.event_loop_mut().wait(idle_wait).context("Event loop wait failed")?;
        let report = hub.service_once(service_timeout)?;
        if report.events > 0 {
            log::trace!("[Hub] {report:?}");
        }
    }

    log::info!("Shutting down...");
    hub.shutdown();
    Ok(())
}

// CLI
#[derive(Parser)]
#[command(name = "homescreen-hub")]
#[command(version = VERSION)]
#[command(about = "IPC hub for the homescreen control channels")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub
    Start {
        /// Address to bind (overrides config)
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    // HOMESCREEN_HUB_LOG_FILE sends the log to a file instead of stderr
    if let Ok(path) = std::env::var("HOMESCREEN_HUB_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.init();

    let cli = Cli::parse();
    let mut config = HubConfig::load()?;

    match cli.command {
        Commands::Start { bind, port } => {
            if let Some(bind) = bind {
                config.bind_address = bind;
            }
            if let Some(port) = port {
                config.port = port;
            }
            run(config)?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
