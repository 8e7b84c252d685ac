use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use wa_relay::client::sidecar::DEFAULT_SIDECAR_URL;
use wa_relay::client::{ChatClient, SidecarClient, SidecarOptions};
use wa_relay::config::{self, ConfigStore};
use wa_relay::router::{Bridge, run_events};
use wa_relay::web::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.json"));
    let base_dir = match config_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };

    // Setup logging
    let log_dir = base_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("wa-relay.log"))
        .context("failed to open log file")?;
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("🚀 Starting wa-relay...");

    let store = Arc::new(ConfigStore::new(&config_path));
    let config = store.load();
    info!("Loaded config from {}", config_path.display());
    for warning in config::warnings(&config) {
        warn!("{warning}");
    }

    let sidecar_url = std::env::var("SIDECAR_URL").unwrap_or_else(|_| DEFAULT_SIDECAR_URL.to_string());
    let (client, events) = SidecarClient::spawn(SidecarOptions::from_config(&config, sidecar_url));
    let client: Arc<dyn ChatClient> = client;

    let bridge = Arc::new(Bridge::new(config));
    install_panic_hook(Arc::clone(&bridge));
    tokio::spawn(run_events(Arc::clone(&bridge), Arc::clone(&client), events));

    let state = AppState::new(bridge, client, store);
    web::serve(state, &base_dir.join("public")).await
}

/// Keep running after a panic in any task, but surface it on the dashboard.
fn install_panic_hook(bridge: Arc<Bridge>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        bridge.try_record_error(format!("panic: {info}"));
        previous(info);
    }));
}
