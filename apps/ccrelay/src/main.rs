use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ccrelay_core::config::{Config, LogFormat, LoggingConfig};
use ccrelay_core::state::AppState;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading config file {}", args.config.display()))?;
    let mut config = Config::from_json(&raw).context("parsing config file")?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    init_logging(&config.logging);

    let listen = config.server.listen.clone();
    let state = AppState::new(config).context("building relay state")?;
    spawn_reload_on_sighup(state.clone(), args.config.clone());

    let app = ccrelay_router::relay_router(state);
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(event = "listening", addr = %listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Console if config.pretty => builder.pretty().init(),
        LogFormat::Console => builder.init(),
    }
}

/// Re-read and swap the configuration on SIGHUP. A config that fails to
/// parse or validate leaves the running one untouched.
fn spawn_reload_on_sighup(state: Arc<AppState>, path: PathBuf) {
    #[cfg(unix)]
    tokio::spawn(async move {
        let mut hangup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(signal) => signal,
                Err(err) => {
                    warn!(event = "reload_unavailable", error = %err);
                    return;
                }
            };
        while hangup.recv().await.is_some() {
            let result = std::fs::read_to_string(&path)
                .map_err(|err| err.to_string())
                .and_then(|raw| Config::from_json(&raw).map_err(|err| err.to_string()))
                .and_then(|config| state.reload(config).map_err(|err| err.to_string()));
            match result {
                Ok(()) => info!(event = "config_reload", path = %path.display()),
                Err(error) => {
                    warn!(event = "config_reload_failed", path = %path.display(), error = %error)
                }
            }
        }
    });
    #[cfg(not(unix))]
    let _ = (state, path);
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!(event = "shutdown_requested");
}
