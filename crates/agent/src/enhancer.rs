//! Context enhancement for inbound requests.
//!
//! Appends structured hints (service, environment, time window, intent) to the
//! raw text before planning. Every path fails open: on a model error, a timeout
//! or an unparsable reply the caller gets the original text back, optionally
//! with rule-based hints.

use std::sync::{Arc, LazyLock};

use chrono::{Datelike, Duration as ChronoDuration, NaiveDateTime};
use opsdesk_core::errors::FailureKind;
use opsdesk_core::settings::RuntimeSettings;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::llm::LlmClient;

const EXTRACTION_MAX_TOKENS: u32 = 500;
const SERVICE_CONTEXT_LIMIT: usize = 30;

static SUSPICIOUS_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"\b(subpoena|court\s*order|legal\s*request|warrant|discovery)\b", "legal_request"),
        (r"\b(export|dump|extract|download)\b.*(customer|user|merchant|pii|data|records)", "data_export"),
        (r"\b(customer|user|merchant)\b.*(export|dump|extract|download|list|all)", "data_export"),
        (r"\b(all|bulk|mass|every)\b.*(customer|user|merchant|transaction|payment)", "bulk_access"),
        (r"\b(bypass|circumvent|override|skip)\b.*(auth|security|access|permission)", "security_bypass"),
        (r"(urgent|immediately|right\s*now|asap).*(access|data|export|credentials)", "urgency_pressure"),
        (r"(ceo|cfo|executive|boss)\s*(asked|wants|needs|said)", "authority_pressure"),
        (r"\b(database|db)\b.*(dump|export|backup|access|query)", "database_access"),
        (r"\b(ssn|social\s*security|credit\s*card|bank\s*account|password)", "pii_access"),
    ]
    .into_iter()
    .filter_map(|(pattern, category)| Regex::new(pattern).ok().map(|regex| (regex, category)))
    .collect()
});

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnhancementSource {
    Model,
    Rules,
    SecurityScreen,
    Unchanged,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Enhancement {
    pub text: String,
    pub source: EnhancementSource,
    /// Set when the model path failed and the enhancer fell back.
    pub failure: Option<String>,
}

impl Enhancement {
    fn unchanged(text: &str, failure: Option<String>) -> Self {
        Self { text: text.to_string(), source: EnhancementSource::Unchanged, failure }
    }
}

#[derive(Clone)]
pub struct ContextEnhancer {
    client: Option<Arc<dyn LlmClient>>,
}

impl ContextEnhancer {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client: Some(client) }
    }

    /// Rule-based only. Used when no auxiliary model is configured.
    pub fn rules_only() -> Self {
        Self { client: None }
    }

    pub async fn enhance(
        &self,
        message: &str,
        settings: &RuntimeSettings,
        now: NaiveDateTime,
    ) -> Enhancement {
        if let Some(category) = detect_suspicious_request(message) {
            warn!(
                event_name = "agent.enhancer.suspicious_request",
                category,
                "suspicious request detected; skipping extraction"
            );
            return Enhancement {
                text: format!(
                    "{message}\n\n---\nSECURITY: This request appears to involve {}. \
                     Escalate to the proper channels rather than assisting directly.",
                    category.replace('_', " ")
                ),
                source: EnhancementSource::SecurityScreen,
                failure: None,
            };
        }

        let mut failure = None;
        if let Some(client) = &self.client {
            let prompt = extraction_prompt(message, settings, now);
            let call = client.complete(&prompt, EXTRACTION_MAX_TOKENS);
            match tokio::time::timeout(settings.timeouts.enhancer(), call).await {
                Ok(Ok(reply)) => match parse_extraction(&reply) {
                    Some(extracted) => {
                        let parts = extracted.context_parts();
                        if !parts.is_empty() {
                            debug!(
                                event_name = "agent.enhancer.extracted",
                                items = parts.len(),
                                "model extraction added context"
                            );
                            return Enhancement {
                                text: format!(
                                    "{message}\n\n---\nExtracted context:\n{}",
                                    bullet_list(&parts)
                                ),
                                source: EnhancementSource::Model,
                                failure: None,
                            };
                        }
                    }
                    None => failure = Some("extraction reply was not valid JSON".to_string()),
                },
                Ok(Err(error)) => failure = Some(error.to_string()),
                Err(_) => {
                    failure = Some(format!(
                        "extraction exceeded {}ms",
                        settings.timeouts.enhancer_ms
                    ))
                }
            }
        }

        if let Some(reason) = &failure {
            warn!(
                event_name = "agent.enhancer.failed",
                failure_kind = %FailureKind::Enhancement,
                error = %reason,
                "context extraction failed; falling back to rules"
            );
        }

        let hints = rule_based_hints(message, settings, now);
        if hints.is_empty() {
            return Enhancement::unchanged(message, failure);
        }

        Enhancement {
            text: format!("{message}\n\n---\nContext:\n{}", bullet_list(&hints)),
            source: EnhancementSource::Rules,
            failure,
        }
    }
}

pub fn detect_suspicious_request(message: &str) -> Option<&'static str> {
    let lowered = message.to_lowercase();
    SUSPICIOUS_PATTERNS
        .iter()
        .find(|(pattern, _)| pattern.is_match(&lowered))
        .map(|(_, category)| *category)
}

fn extraction_prompt(message: &str, settings: &RuntimeSettings, now: NaiveDateTime) -> String {
    let environments = settings
        .environments
        .iter()
        .map(|(name, aliases)| {
            if aliases.is_empty() {
                name.clone()
            } else {
                format!("{name}/{}", aliases.join("/"))
            }
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"Extract structured information from this operations chat message.

Today is {date}. Current time: {time}.

Known services (with aliases):
{services}

Environments: {environments}

USER MESSAGE:
{message}

Respond with ONLY a JSON object (no markdown, no explanation):
{{
  "intent": "brief description of what user wants",
  "services": ["full-service-name"],
  "environment": "one of the environments above or null",
  "time_range": {{"description": "e.g. past 4 hours", "hours_back": null}},
  "urgency": "high|medium|low",
  "entities": {{"ticket_ids": [], "pr_ids": [], "incident_ids": []}},
  "clarifications_needed": []
}}"#,
        date = now.format("%A, %B %d, %Y"),
        time = now.format("%H:%M"),
        services = service_context(settings, SERVICE_CONTEXT_LIMIT),
    )
}

/// Services with the most aliases first, then by key.
fn service_context(settings: &RuntimeSettings, limit: usize) -> String {
    if settings.services.is_empty() {
        return "- (service registry unavailable)".to_string();
    }

    let mut services = settings.services.iter().collect::<Vec<_>>();
    services.sort_by(|(left_key, left), (right_key, right)| {
        right.aliases.len().cmp(&left.aliases.len()).then_with(|| left_key.cmp(right_key))
    });

    services
        .into_iter()
        .take(limit)
        .map(|(key, entry)| {
            if entry.aliases.is_empty() {
                format!("- {key}")
            } else {
                format!("- {key} (aliases: {})", entry.aliases.join(", "))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Extracted {
    intent: Option<String>,
    services: Vec<String>,
    environment: Option<String>,
    time_range: Option<TimeRange>,
    urgency: Option<String>,
    entities: Entities,
    clarifications_needed: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TimeRange {
    description: Option<String>,
    hours_back: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Entities {
    ticket_ids: Vec<String>,
    pr_ids: Vec<Value>,
    incident_ids: Vec<String>,
}

impl Extracted {
    fn context_parts(&self) -> Vec<String> {
        let mut parts = Vec::new();

        if let Some(intent) = non_blank(self.intent.as_deref()) {
            parts.push(format!("Intent: {intent}"));
        }
        if !self.services.is_empty() {
            parts.push(format!("Services: {}", self.services.join(", ")));
        }
        if let Some(environment) = non_blank(self.environment.as_deref()) {
            if !environment.eq_ignore_ascii_case("null") {
                parts.push(format!("Environment: {environment}"));
            }
        }
        if let Some(range) = &self.time_range {
            if let Some(description) = non_blank(range.description.as_deref()) {
                match range.hours_back {
                    Some(hours) if hours > 0.0 => {
                        parts.push(format!("Time range: {description} (~{hours} hours)"))
                    }
                    _ => parts.push(format!("Time range: {description}")),
                }
            }
        }
        if self.urgency.as_deref() == Some("high") {
            parts.push("Urgency: HIGH - prioritize speed".to_string());
        }
        if !self.entities.ticket_ids.is_empty() {
            parts.push(format!("Tickets: {}", self.entities.ticket_ids.join(", ")));
        }
        if !self.entities.pr_ids.is_empty() {
            let ids = self
                .entities
                .pr_ids
                .iter()
                .map(|id| match id {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>();
            parts.push(format!("PR IDs: {}", ids.join(", ")));
        }
        if !self.entities.incident_ids.is_empty() {
            parts.push(format!("Incidents: {}", self.entities.incident_ids.join(", ")));
        }
        if !self.clarifications_needed.is_empty() {
            parts.push(format!(
                "May need clarification: {}",
                self.clarifications_needed.join("; ")
            ));
        }

        parts
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn parse_extraction(reply: &str) -> Option<Extracted> {
    if let Ok(extracted) = serde_json::from_str::<Extracted>(reply.trim()) {
        return Some(extracted);
    }
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Extracted>(&reply[start..=end]).ok()
}

fn rule_based_hints(message: &str, settings: &RuntimeSettings, now: NaiveDateTime) -> Vec<String> {
    let lowered = message.to_lowercase();
    let mut hints = Vec::new();

    if lowered.contains("this week") {
        let monday = now.date() - ChronoDuration::days(i64::from(now.weekday().num_days_from_monday()));
        hints.push(format!("Time: 'this week' = since {}", monday.format("%Y-%m-%d")));
    } else if lowered.contains("today") {
        hints.push(format!("Time: 'today' = {}", now.date().format("%Y-%m-%d")));
    } else if lowered.contains("yesterday") {
        let yesterday = now.date() - ChronoDuration::days(1);
        hints.push(format!("Time: 'yesterday' = {}", yesterday.format("%Y-%m-%d")));
    }

    'services: for (key, entry) in &settings.services {
        for alias in std::iter::once(key).chain(entry.aliases.iter()) {
            if contains_word(&lowered, &alias.to_lowercase()) {
                hints.push(format!("Service: {alias} = {key}"));
                break 'services;
            }
        }
    }

    'environments: for (name, aliases) in &settings.environments {
        for alias in std::iter::once(name).chain(aliases.iter()) {
            if contains_word(&lowered, &alias.to_lowercase()) {
                hints.push(format!("Environment: {name}"));
                break 'environments;
            }
        }
    }

    hints
}

fn contains_word(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let is_word = |ch: char| ch.is_alphanumeric() || ch == '_';
    haystack.match_indices(needle).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !before.is_some_and(is_word) && !after.is_some_and(is_word)
    })
}

fn bullet_list(items: &[String]) -> String {
    items.iter().map(|item| format!("  - {item}")).collect::<Vec<_>>().join("\n")
}
