mod bootstrap;
mod health;
mod query;

use std::time::Duration;

use anyhow::Result;
use axum::Router;
use opsdesk_core::config::{AppConfig, LoadOptions};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::query::QueryState;

fn init_logging(config: &AppConfig) {
    use opsdesk_core::config::LogFormat::*;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let shutdown = app.shutdown.clone();

    let refresh = app
        .config
        .settings
        .path
        .is_some()
        .then(|| bootstrap::spawn_settings_refresh(app.settings.clone(), shutdown.clone()));

    let routes = Router::new().merge(health::router(app.settings.clone())).merge(query::router(
        QueryState {
            pipeline: app.ide.clone(),
            metrics: app.metrics.clone(),
            shutdown: shutdown.clone(),
        },
    ));
    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.http.start",
        correlation_id = "bootstrap",
        thread_id = "unknown",
        bind_address = %address,
        "health, metrics and query endpoints started"
    );
    let http_shutdown = shutdown.clone();
    let http = tokio::spawn(async move {
        let served = axum::serve(listener, routes)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await;
        if let Err(error) = served {
            tracing::error!(
                event_name = "system.http.error",
                correlation_id = "bootstrap",
                thread_id = "unknown",
                error = %error,
                "http server terminated unexpectedly"
            );
        }
    });

    let slack = app.slack_runner.map(|runner| {
        let slack_shutdown = shutdown.clone();
        tokio::spawn(async move { runner.start(&slack_shutdown).await })
    });

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        thread_id = "unknown",
        slack_enabled = slack.is_some(),
        "opsdesk-server started"
    );
    wait_for_shutdown(&shutdown).await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        thread_id = "unknown",
        "opsdesk-server stopping"
    );

    shutdown.cancel();
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    let drained = tokio::time::timeout(grace, async {
        let _ = http.await;
        if let Some(slack) = slack {
            let _ = slack.await;
        }
        if let Some(refresh) = refresh {
            let _ = refresh.await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            thread_id = "unknown",
            grace_secs = grace.as_secs(),
            "tasks still running after graceful shutdown window"
        );
    }

    Ok(())
}

async fn wait_for_shutdown(shutdown: &CancellationToken) -> Result<()> {
    tokio::select! {
        signal = tokio::signal::ctrl_c() => signal?,
        _ = shutdown.cancelled() => {}
    }
    Ok(())
}
