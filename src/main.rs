//! Courier CLI entry point.
//!
//! Provides `serve` for the HTTP front end, one-shot `send-*` commands, and
//! `check-config` for inspecting the effective configuration.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use courier::config::{config_dir, load_config, Config};
use courier::pipeline::{DeliveryOutcome, DeliveryPipeline};
use courier::server::{self, AppState};
use courier::whatsapp::client::BridgeConnection;
use courier::whatsapp::{Connection, ConnectionFactory};

/// Config file looked up in the working directory before `~/.courier`.
const LOCAL_CONFIG: &str = "courier.toml";

/// Courier: outbound WhatsApp delivery service.
#[derive(Parser)]
#[command(name = "courier", version, about)]
struct Cli {
    /// Config file (default: ./courier.toml, then ~/.courier/courier.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the HTTP front end.
    Serve,
    /// Send one text message and exit.
    SendText {
        /// Recipient phone number.
        #[arg(long)]
        to: String,
        /// Message body.
        #[arg(long)]
        message: String,
    },
    /// Send one video file and exit.
    SendVideo {
        /// Recipient phone number.
        #[arg(long)]
        to: String,
        /// Path to the video.
        #[arg(long)]
        file: PathBuf,
        /// Caption; defaults to the configured video caption.
        #[arg(long)]
        caption: Option<String>,
    },
    /// Send one image file and exit.
    SendImage {
        /// Recipient phone number.
        #[arg(long)]
        to: String,
        /// Path to the image.
        #[arg(long)]
        file: PathBuf,
        /// Caption; defaults to the configured image caption.
        #[arg(long)]
        caption: Option<String>,
    },
    /// Print the effective configuration and exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // A missing .env is normal.
    let _ = dotenvy::dotenv();

    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let config = load_config(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    match cli.command {
        Command::Serve => handle_serve(config).await,
        Command::SendText { to, message } => {
            handle_one_shot(config, move |pipeline| pipeline.send_text(&to, &message)).await
        }
        Command::SendVideo { to, file, caption } => {
            let caption = caption.unwrap_or_else(|| config.captions.video().to_owned());
            handle_one_shot(config, move |pipeline| {
                pipeline.send_video(&to, &file, &caption)
            })
            .await
        }
        Command::SendImage { to, file, caption } => {
            let caption = caption.unwrap_or_else(|| config.captions.image().to_owned());
            handle_one_shot(config, move |pipeline| {
                pipeline.send_image(&to, &file, &caption)
            })
            .await
        }
        Command::CheckConfig => handle_check_config(&config, &config_path),
    }
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    let local = PathBuf::from(LOCAL_CONFIG);
    if local.exists() {
        return Ok(local);
    }
    Ok(config_dir()?.join(LOCAL_CONFIG))
}

/// Connection factory speaking to the configured bridge sidecar.
fn bridge_factory(config: &Config) -> Arc<dyn ConnectionFactory> {
    let base_url = config.bridge.base_url.clone();
    let request_timeout = Duration::from_secs(config.bridge.request_timeout_secs);
    Arc::new(move || -> Box<dyn Connection> {
        Box::new(BridgeConnection::new(base_url.clone(), request_timeout))
    })
}

/// Run the HTTP front end until Ctrl-C, then shut the bridge down.
async fn handle_serve(config: Config) -> anyhow::Result<()> {
    let _logging_guard = courier::logging::init_production(config.logging.dir.as_deref())?;

    let pipeline = Arc::new(DeliveryPipeline::from_config(
        &config,
        bridge_factory(&config),
    ));
    let state = AppState::new(Arc::clone(&pipeline), &config);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    info!(
        bind = %config.server.bind,
        bridge = %config.bridge.base_url,
        fallback = %config.fallback.path.display(),
        "courier starting"
    );

    let result = server::serve(listener, state, async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received shutdown signal, initiating graceful shutdown"),
            Err(e) => tracing::warn!(error = %e, "failed to listen for shutdown signal"),
        }
    })
    .await;

    tokio::task::spawn_blocking(move || pipeline.shutdown())
        .await
        .context("bridge shutdown task failed")?;
    info!("courier stopped");
    result
}

/// Initialize, run one pipeline call, print the outcome as JSON.
async fn handle_one_shot<F>(config: Config, call: F) -> anyhow::Result<()>
where
    F: FnOnce(&DeliveryPipeline) -> DeliveryOutcome + Send + 'static,
{
    courier::logging::init_cli();

    let pipeline = DeliveryPipeline::from_config(&config, bridge_factory(&config));
    let outcome = tokio::task::spawn_blocking(move || {
        let init = pipeline.initialize();
        let outcome = if init.success {
            debug!("connection initialized");
            call(&pipeline)
        } else {
            init
        };
        pipeline.shutdown();
        outcome
    })
    .await
    .context("send task failed")?;

    let json = serde_json::to_string_pretty(&outcome).context("failed to serialize outcome")?;
    println!("{json}");
    if !outcome.success {
        anyhow::bail!("{}", outcome.message);
    }
    Ok(())
}

/// Print the effective configuration as TOML.
fn handle_check_config(config: &Config, path: &Path) -> anyhow::Result<()> {
    let source = if path.exists() {
        path.display().to_string()
    } else {
        format!("{} (not found, using defaults)", path.display())
    };
    let rendered = toml::to_string_pretty(config).context("failed to render config")?;
    println!("# source: {source}");
    print!("{rendered}");
    Ok(())
}
