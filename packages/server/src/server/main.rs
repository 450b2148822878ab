// Main entry point for the sidequest job server.

use std::sync::Arc;

use anyhow::{Context, Result};
use sidequest_core::kernel::cron::{register_repo_sweep, CronDriver};
use sidequest_core::kernel::secrets::{BreakerConfig, DopplerFetcher, SecretsBreaker};
use sidequest_core::server::app::build_app;
use sidequest_core::server::listener::{bind_with_fallback, shutdown_signal, BindOptions};
use sidequest_core::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!("{},sqlx=warn", config.log_level))
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(env = %config.app_env, "starting sidequest job server");

    // Secrets are consulted once at process start; a dead remote with a warm
    // cache is fine, and no remote at all only costs a warning.
    if let Some(token) = config.doppler.token.clone() {
        let breaker = SecretsBreaker::new(
            BreakerConfig::from_settings(&config.doppler),
            Arc::new(DopplerFetcher::new(token)),
        );
        match breaker.get_secrets().await {
            Ok(secrets) => tracing::info!(count = secrets.len(), "secrets loaded"),
            Err(e) => tracing::warn!(error = %e, "continuing without remote secrets"),
        }
    }

    let (app, state) = build_app(config.clone()).await?;
    tracing::info!(db = %config.db_path.display(), "job store initialised");

    let cron = CronDriver::new().await?;
    if let Some(repos_root) = config.repos_root.clone() {
        register_repo_sweep(
            &cron,
            Arc::clone(&state.registry),
            repos_root,
            &config.cron_schedule,
            config.run_on_startup,
        )
        .await?;
    } else {
        tracing::info!("no repos root configured; cron sweep disabled");
    }
    cron.start().await?;

    let bind = BindOptions::new(config.port, config.max_port).with_host(config.host.clone());
    let (listener, port) = bind_with_fallback(&bind).await?;
    tracing::info!(port, "listening");
    tracing::info!("health check: http://localhost:{port}/health");

    let registry = Arc::clone(&state.registry);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("shutting down");
            registry.shutdown().await;
            if let Err(e) = cron.shutdown().await {
                tracing::warn!(error = %e, "cron shutdown failed");
            }
        })
        .await
        .context("Server error")?;

    Ok(())
}
