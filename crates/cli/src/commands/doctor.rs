use opsdesk_agent::tools::ToolCatalog;
use opsdesk_core::config::{AppConfig, LoadOptions};
use opsdesk_core::settings::RuntimeSettings;
use serde::Serialize;

use crate::commands::{load_settings, CommandResult};

const PROFILES: [&str; 2] = ["chat", "ide"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn skipped(name: &'static str, reason: &str) -> Self {
        Self { name, status: CheckStatus::Skipped, details: format!("skipped because {reason}") }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Fail { 5 } else { 0 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };
    CommandResult { exit_code, output }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_slack_tokens(&config));
            match load_settings(&config) {
                Ok(settings) => {
                    checks.push(DoctorCheck {
                        name: "settings_load",
                        status: CheckStatus::Pass,
                        details: settings_source(&config),
                    });
                    checks.push(check_catalogs(&settings));
                }
                Err(error) => {
                    checks.push(DoctorCheck {
                        name: "settings_load",
                        status: CheckStatus::Fail,
                        details: error,
                    });
                    checks.push(DoctorCheck::skipped("catalog_build", "runtime settings did not load"));
                }
            }
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            let reason = "configuration did not load";
            checks.push(DoctorCheck::skipped("slack_token_readiness", reason));
            checks.push(DoctorCheck::skipped("settings_load", reason));
            checks.push(DoctorCheck::skipped("catalog_build", reason));
        }
    }

    let failed = checks.iter().any(|check| check.status == CheckStatus::Fail);
    let overall_status = if failed { CheckStatus::Fail } else { CheckStatus::Pass };
    let summary = if failed {
        "doctor: one or more readiness checks failed".to_string()
    } else {
        "doctor: all readiness checks passed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_slack_tokens(config: &AppConfig) -> DoctorCheck {
    if !config.slack.enabled {
        return DoctorCheck::skipped("slack_token_readiness", "slack is disabled");
    }
    let alerts = match &config.slack.alert_channel_id {
        Some(channel) => format!("alerts post to {channel}"),
        None => "alerts go to the log only".to_string(),
    };
    DoctorCheck {
        name: "slack_token_readiness",
        status: CheckStatus::Pass,
        details: format!("token format validated by config contract; {alerts}"),
    }
}

fn settings_source(config: &AppConfig) -> String {
    match &config.settings.path {
        Some(path) => format!("loaded `{}`", path.display()),
        None => "no settings file configured; using built-in defaults".to_string(),
    }
}

fn check_catalogs(settings: &RuntimeSettings) -> DoctorCheck {
    let http = match reqwest::Client::builder().build() {
        Ok(http) => http,
        Err(error) => {
            return DoctorCheck {
                name: "catalog_build",
                status: CheckStatus::Fail,
                details: format!("failed to initialize http client: {error}"),
            };
        }
    };

    let mut counts = Vec::with_capacity(PROFILES.len());
    for profile in PROFILES {
        match ToolCatalog::from_settings(settings, profile, &http) {
            Ok(catalog) => counts.push(format!("{profile}: {} tools", catalog.len())),
            Err(error) => {
                return DoctorCheck {
                    name: "catalog_build",
                    status: CheckStatus::Fail,
                    details: format!("profile `{profile}`: {error}"),
                };
            }
        }
    }

    DoctorCheck { name: "catalog_build", status: CheckStatus::Pass, details: counts.join(", ") }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
