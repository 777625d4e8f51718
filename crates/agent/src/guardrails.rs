use opsdesk_core::settings::GuardrailSettings;
use serde_json::Value;

/// A tool call as the guardrail sees it.
#[derive(Clone, Debug, PartialEq)]
pub struct GuardrailIntent<'a> {
    pub tool: &'a str,
    pub write_access: bool,
    pub arguments: &'a Value,
}

impl GuardrailIntent<'_> {
    /// Every string in the argument payload joined by spaces.
    pub fn payload_text(&self) -> String {
        let mut parts = Vec::new();
        collect_strings(self.arguments, &mut parts);
        parts.join(" ")
    }

    /// The `command` argument of command-style tools.
    pub fn command(&self) -> Option<&str> {
        self.arguments.get("command").and_then(Value::as_str)
    }
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(text) => out.push(text),
        Value::Array(items) => items.iter().for_each(|item| collect_strings(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_strings(item, out)),
        _ => {}
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allow,
    Deny { reason_code: &'static str, user_message: String, fallback_path: &'static str },
}

impl GuardrailDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardrailPolicy {
    denylist: Vec<String>,
    allowlist: Vec<String>,
}

impl Default for GuardrailPolicy {
    fn default() -> Self {
        Self::from_settings(&GuardrailSettings::default())
    }
}

impl GuardrailPolicy {
    pub fn from_settings(settings: &GuardrailSettings) -> Self {
        let normalize = |items: &[String]| {
            items
                .iter()
                .map(|item| item.trim().to_lowercase())
                .filter(|item| !item.is_empty())
                .collect::<Vec<_>>()
        };
        Self { denylist: normalize(&settings.denylist), allowlist: normalize(&settings.allowlist) }
    }

    pub fn evaluate(&self, intent: &GuardrailIntent<'_>) -> GuardrailDecision {
        if !intent.write_access {
            return GuardrailDecision::Allow;
        }

        let payload = intent.payload_text().to_lowercase();
        if let Some(verb) = self.denylist.iter().find(|verb| payload.contains(verb.as_str())) {
            return GuardrailDecision::Deny {
                reason_code: "write_operation_blocked",
                user_message: format!(
                    "Refused to run `{}`: the request contains the blocked operation `{verb}`. Only read-only operations are permitted, and this action was not performed.",
                    intent.tool
                ),
                fallback_path: "use_read_only_operation",
            };
        }

        if let Some(command) = intent.command().filter(|_| !self.allowlist.is_empty()) {
            let command = command.to_lowercase();
            let trimmed = command.trim();
            let stripped = trimmed.strip_prefix("aws ").unwrap_or(trimmed);
            let allowed = self.allowlist.iter().any(|prefix| stripped.starts_with(prefix.as_str()));
            if !allowed {
                return GuardrailDecision::Deny {
                    reason_code: "command_not_allowlisted",
                    user_message: format!(
                        "Refused to run `{}`: the command is not on the read-only allowlist, so it was not performed.",
                        intent.tool
                    ),
                    fallback_path: "use_allowlisted_command",
                };
            }
        }

        GuardrailDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use opsdesk_core::settings::GuardrailSettings;
    use serde_json::json;

    use super::{GuardrailDecision, GuardrailIntent, GuardrailPolicy};

    #[test]
    fn read_only_tools_are_always_allowed() {
        let policy = GuardrailPolicy::default();
        let arguments = json!({ "query": "delete everything" });
        let decision = policy.evaluate(&GuardrailIntent {
            tool: "search_logs",
            write_access: false,
            arguments: &arguments,
        });
        assert_eq!(decision, GuardrailDecision::Allow);
    }

    #[test]
    fn denylisted_verb_is_refused() {
        let policy = GuardrailPolicy::default();
        let arguments = json!({ "command": "ec2 terminate-instances --instance-ids i-123" });
        let decision = policy.evaluate(&GuardrailIntent {
            tool: "aws_cli",
            write_access: true,
            arguments: &arguments,
        });

        let (reason_code, user_message, fallback_path) = match decision {
            GuardrailDecision::Deny { reason_code, user_message, fallback_path } => {
                (reason_code, user_message, fallback_path)
            }
            GuardrailDecision::Allow => ("", String::new(), ""),
        };

        assert_eq!(reason_code, "write_operation_blocked");
        assert!(user_message.contains("`terminate`"));
        assert!(user_message.contains("not performed"));
        assert_eq!(fallback_path, "use_read_only_operation");
    }

    #[test]
    fn nested_string_arguments_are_screened() {
        let policy = GuardrailPolicy::default();
        let arguments = json!({ "service": "billing", "options": ["--force", "Reboot-Now"] });
        let decision = policy.evaluate(&GuardrailIntent {
            tool: "ops_action",
            write_access: true,
            arguments: &arguments,
        });
        assert!(!decision.is_allowed());
    }

    #[test]
    fn blocked_verb_outside_the_command_argument_is_refused() {
        let policy = GuardrailPolicy::default();
        let arguments = json!({
            "command": "ec2 describe-instances",
            "extra_args": "ec2 terminate-instances --instance-ids i-1"
        });
        let decision = policy.evaluate(&GuardrailIntent {
            tool: "aws_cli",
            write_access: true,
            arguments: &arguments,
        });
        assert!(matches!(
            decision,
            GuardrailDecision::Deny { reason_code: "write_operation_blocked", .. }
        ));
    }

    #[test]
    fn default_allowlist_refuses_unknown_commands() {
        let policy = GuardrailPolicy::default();
        let listed = json!({ "command": "aws ecs describe-services --cluster prod" });
        let unlisted = json!({ "command": "sts get-caller-identity" });
        let no_command = json!({ "service": "billing" });

        let evaluate = |arguments: &serde_json::Value| {
            policy.evaluate(&GuardrailIntent { tool: "aws_cli", write_access: true, arguments })
        };
        assert!(evaluate(&listed).is_allowed());
        assert!(matches!(
            evaluate(&unlisted),
            GuardrailDecision::Deny { reason_code: "command_not_allowlisted", .. }
        ));
        assert!(evaluate(&no_command).is_allowed());
    }

    #[test]
    fn allowlist_restricts_commands_to_known_prefixes() {
        let policy = GuardrailPolicy::from_settings(&GuardrailSettings {
            allowlist: vec!["ecs describe-services".to_string(), "s3 ls".to_string()],
            ..GuardrailSettings::default()
        });

        let listed = json!({ "command": "aws ecs describe-services --cluster prod" });
        let unlisted = json!({ "command": "iam list-users" });

        assert!(policy
            .evaluate(&GuardrailIntent { tool: "aws_cli", write_access: true, arguments: &listed })
            .is_allowed());
        assert!(matches!(
            policy.evaluate(&GuardrailIntent {
                tool: "aws_cli",
                write_access: true,
                arguments: &unlisted
            }),
            GuardrailDecision::Deny { reason_code: "command_not_allowlisted", .. }
        ));
    }
}
