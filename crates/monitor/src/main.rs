use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hydro_monitor::api::http::HttpBackend;
use hydro_monitor::{config, web, Monitor};

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hydro_monitor=info")),
        )
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "monitor.toml".to_string());
    let cfg = config::load(&config_path)?;
    info!(
        path = %config_path,
        backend = %cfg.backend.base_url,
        interval_ms = cfg.polling.interval_ms,
        range = cfg.polling.time_range.as_str(),
        "config loaded"
    );

    // ── Backend + facade ────────────────────────────────────────────
    let backend = HttpBackend::new(&cfg.backend.base_url, cfg.backend.timeout())
        .context("failed to build backend client")?;
    let monitor = Arc::new(Monitor::new(Arc::new(backend), cfg.polling.settings()));
    monitor.mount().await;
    if let Some(e) = monitor.error().await {
        warn!(error = %e, "initial load incomplete");
    }

    if let Some(crop_id) = cfg.monitor.crop_id {
        if monitor.select_crop_by_id(crop_id).await {
            if cfg.monitor.auto_start {
                let outcome = monitor.start_monitoring().await;
                info!(crop = crop_id, ?outcome, "monitoring started at boot");
            }
        } else {
            warn!(crop = crop_id, "configured crop not found; starting without selection");
        }
    }

    // ── Web server ──────────────────────────────────────────────────
    if cfg.web.enabled {
        let web_monitor = Arc::clone(&monitor);
        let port = cfg.web.port;
        tokio::spawn(async move {
            if let Err(e) = web::serve(web_monitor, port).await {
                error!(error = %e, "status endpoint stopped");
            }
        });
    }

    // ── Run until interrupted ───────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    monitor.stop_monitoring().await;
    Ok(())
}
