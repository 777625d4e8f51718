use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use opsdesk_core::config::{AppConfig, LoadOptions};
use secrecy::{ExposeSecret, SecretString};
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str, env_keys: &[&str]| {
        field_source(key_path, env_keys, config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let entries = vec![
        entry("slack.enabled", config.slack.enabled.to_string(), &["OPSDESK_SLACK_ENABLED"]),
        entry("slack.app_token", redact_token(&config.slack.app_token), &["OPSDESK_SLACK_APP_TOKEN"]),
        entry("slack.bot_token", redact_token(&config.slack.bot_token), &["OPSDESK_SLACK_BOT_TOKEN"]),
        entry("slack.api_base_url", config.slack.api_base_url.clone(), &["OPSDESK_SLACK_API_BASE_URL"]),
        entry(
            "slack.alert_channel_id",
            config.slack.alert_channel_id.clone().unwrap_or_else(|| "<unset>".to_string()),
            &["OPSDESK_SLACK_ALERT_CHANNEL_ID"],
        ),
        entry(
            "slack.auto_reply_channels",
            format!("[{}]", config.slack.auto_reply_channels.join(", ")),
            &["OPSDESK_SLACK_AUTO_REPLY_CHANNELS"],
        ),
        entry("llm.provider", format!("{:?}", config.llm.provider), &["OPSDESK_LLM_PROVIDER"]),
        entry(
            "llm.api_key",
            config.llm.api_key.as_ref().map(redact_token).unwrap_or_else(|| "<unset>".to_string()),
            &["OPSDESK_LLM_API_KEY"],
        ),
        entry("llm.base_url", config.llm.base_url.clone(), &["OPSDESK_LLM_BASE_URL"]),
        entry("llm.planner_model", config.llm.planner_model.clone(), &["OPSDESK_LLM_PLANNER_MODEL"]),
        entry(
            "llm.auxiliary_model",
            config.llm.auxiliary_model.clone(),
            &["OPSDESK_LLM_AUXILIARY_MODEL"],
        ),
        entry("llm.timeout_secs", config.llm.timeout_secs.to_string(), &["OPSDESK_LLM_TIMEOUT_SECS"]),
        entry("llm.max_retries", config.llm.max_retries.to_string(), &["OPSDESK_LLM_MAX_RETRIES"]),
        entry(
            "server.bind_address",
            config.server.bind_address.clone(),
            &["OPSDESK_SERVER_BIND_ADDRESS"],
        ),
        entry("server.port", config.server.port.to_string(), &["OPSDESK_SERVER_PORT"]),
        entry(
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs.to_string(),
            &["OPSDESK_SERVER_GRACEFUL_SHUTDOWN_SECS"],
        ),
        entry(
            "settings.path",
            config
                .settings
                .path
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<built-in defaults>".to_string()),
            &["OPSDESK_SETTINGS_PATH"],
        ),
        entry(
            "settings.refresh_ttl_secs",
            config.settings.refresh_ttl_secs.to_string(),
            &["OPSDESK_SETTINGS_REFRESH_TTL_SECS"],
        ),
        entry(
            "logging.level",
            config.logging.level.clone(),
            &["OPSDESK_LOGGING_LEVEL", "OPSDESK_LOG_LEVEL"],
        ),
        entry(
            "logging.format",
            format!("{:?}", config.logging.format),
            &["OPSDESK_LOGGING_FORMAT", "OPSDESK_LOG_FORMAT"],
        ),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.extend(
        entries
            .into_iter()
            .map(|(key, value, env_keys)| render_line(key, &value, source(key, env_keys))),
    );
    lines.join("\n")
}

type Entry = (&'static str, String, &'static [&'static str]);

fn entry(key: &'static str, value: String, env_keys: &'static [&'static str]) -> Entry {
    (key, value, env_keys)
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("opsdesk.toml"), PathBuf::from("config/opsdesk.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps the token family prefix (`xapp-`, `xoxb-`, `sk-`) and hides the rest.
fn redact_token(token: &SecretString) -> String {
    let trimmed = token.expose_secret().trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}
