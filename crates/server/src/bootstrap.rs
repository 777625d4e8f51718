use std::sync::Arc;
use std::time::Duration;

use opsdesk_agent::alerting::{AlertSink, Alerter, TracingAlertSink};
use opsdesk_agent::enhancer::ContextEnhancer;
use opsdesk_agent::llm::{AnthropicClient, PlannerError};
use opsdesk_agent::metrics::MetricsRecorder;
use opsdesk_agent::tools::SettingsCatalog;
use opsdesk_agent::RequestPipeline;
use opsdesk_core::config::{AppConfig, ConfigError, LoadOptions};
use opsdesk_core::settings::{
    FileSettingsSource, SettingsError, SettingsSource, SnapshotStore, StaticSettingsSource,
};
use opsdesk_slack::web::{SlackApi, SlackWebClient, WebApiError};
use opsdesk_slack::{
    thread_dispatcher, ReconnectPolicy, SlackAlertSink, SlackSocketTransport, SlackThreadService,
    SocketModeRunner,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const CHAT_PROFILE: &str = "chat";
pub const IDE_PROFILE: &str = "ide";

pub struct Application {
    pub config: AppConfig,
    pub settings: Arc<SnapshotStore>,
    pub metrics: Arc<MetricsRecorder>,
    pub ide: Arc<RequestPipeline>,
    pub slack_runner: Option<SocketModeRunner>,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("runtime settings failed to load: {0}")]
    Settings(#[from] SettingsError),
    #[error("model client setup failed: {0}")]
    Planner(#[from] PlannerError),
    #[error("slack client setup failed: {0}")]
    Slack(#[from] WebApiError),
    #[error("tool http client setup failed: {0}")]
    HttpClient(String),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        thread_id = "unknown",
        "starting application bootstrap"
    );

    let source: Arc<dyn SettingsSource> = match &config.settings.path {
        Some(path) => Arc::new(FileSettingsSource::new(path.clone())),
        None => Arc::new(StaticSettingsSource::default()),
    };
    let settings = Arc::new(
        SnapshotStore::load(source, Duration::from_secs(config.settings.refresh_ttl_secs)).await?,
    );
    let snapshot = settings.current().await;
    info!(
        event_name = "system.bootstrap.settings_loaded",
        correlation_id = "bootstrap",
        thread_id = "unknown",
        version = snapshot.version,
        tools = snapshot.settings.tools.len(),
        "runtime settings snapshot ready"
    );

    let (planner, auxiliary) = AnthropicClient::pair_from_config(&config.llm)?;
    let planner = Arc::new(planner);
    let enhancer = ContextEnhancer::new(Arc::new(auxiliary));
    let metrics = Arc::new(MetricsRecorder::new(snapshot.settings.rollup_interval));
    let http = reqwest::Client::builder()
        .build()
        .map_err(|error| BootstrapError::HttpClient(error.to_string()))?;

    let shutdown = CancellationToken::new();
    let slack_api: Option<Arc<dyn SlackApi>> = if config.slack.enabled {
        Some(Arc::new(SlackWebClient::from_config(&config.slack)?))
    } else {
        None
    };

    let alert_sink: Arc<dyn AlertSink> = match (&slack_api, &config.slack.alert_channel_id) {
        (Some(api), Some(channel_id)) => Arc::new(SlackAlertSink::new(Arc::clone(api), channel_id)),
        _ => Arc::new(TracingAlertSink),
    };
    let alerter = Alerter::new(alert_sink);

    let pipeline_for = |profile: &str| {
        Arc::new(RequestPipeline::new(
            Arc::clone(&settings),
            enhancer.clone(),
            planner.clone(),
            Arc::new(SettingsCatalog::new(profile, http.clone())),
            metrics.clone(),
            alerter.clone(),
        ))
    };
    let chat = pipeline_for(CHAT_PROFILE);
    let ide = pipeline_for(IDE_PROFILE);

    let slack_runner = slack_api.map(|api| {
        let service = SlackThreadService::new(
            Arc::clone(&api),
            Arc::clone(&chat),
            &config.slack.auto_reply_channels,
            shutdown.clone(),
        );
        SocketModeRunner::new(
            Arc::new(SlackSocketTransport::new(api)),
            thread_dispatcher(Arc::new(service)),
            ReconnectPolicy::default(),
        )
    });

    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        thread_id = "unknown",
        slack_enabled = slack_runner.is_some(),
        "application bootstrap complete"
    );

    Ok(Application { config, settings, metrics, ide, slack_runner, shutdown })
}

/// Reloads the settings snapshot every TTL until shutdown. Failed reloads keep
/// the previous snapshot.
pub fn spawn_settings_refresh(
    settings: Arc<SnapshotStore>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = settings.ttl();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown.cancelled() => return,
            }
            match settings.refresh().await {
                Ok(snapshot) => info!(
                    event_name = "system.settings.refreshed",
                    correlation_id = "settings-refresh",
                    thread_id = "unknown",
                    version = snapshot.version,
                    "runtime settings refreshed"
                ),
                Err(error) => warn!(
                    event_name = "system.settings.refresh_failed",
                    correlation_id = "settings-refresh",
                    thread_id = "unknown",
                    error = %error,
                    "runtime settings refresh failed"
                ),
            }
        }
    })
}
