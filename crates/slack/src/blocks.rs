use opsdesk_agent::alerting::Alert;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TextObject {
    #[serde(rename = "plain_text")]
    Plain { text: String },
    Mrkdwn { text: String },
}

impl TextObject {
    pub fn plain(text: impl Into<String>) -> Self {
        Self::Plain { text: text.into() }
    }

    pub fn mrkdwn(text: impl Into<String>) -> Self {
        Self::Mrkdwn { text: text.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Section { block_id: String, text: TextObject },
    Context { block_id: String, elements: Vec<TextObject> },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MessageTemplate {
    pub fallback_text: String,
    pub blocks: Vec<Block>,
}

pub struct MessageBuilder {
    fallback_text: String,
    blocks: Vec<Block>,
}

impl MessageBuilder {
    pub fn new(fallback_text: impl Into<String>) -> Self {
        Self { fallback_text: fallback_text.into(), blocks: Vec::new() }
    }

    pub fn section<F>(mut self, block_id: impl Into<String>, build: F) -> Self
    where
        F: FnOnce(&mut SectionBuilder),
    {
        let mut builder = SectionBuilder::default();
        build(&mut builder);
        self.blocks.push(Block::Section { block_id: block_id.into(), text: builder.build() });
        self
    }

    pub fn context<F>(mut self, block_id: impl Into<String>, build: F) -> Self
    where
        F: FnOnce(&mut ContextBuilder),
    {
        let mut builder = ContextBuilder::default();
        build(&mut builder);
        self.blocks.push(Block::Context { block_id: block_id.into(), elements: builder.build() });
        self
    }

    pub fn build(self) -> MessageTemplate {
        MessageTemplate { fallback_text: self.fallback_text, blocks: self.blocks }
    }
}

#[derive(Default)]
pub struct SectionBuilder {
    text: Option<TextObject>,
}

impl SectionBuilder {
    pub fn plain(&mut self, text: impl Into<String>) -> &mut Self {
        self.text = Some(TextObject::plain(text));
        self
    }

    pub fn mrkdwn(&mut self, text: impl Into<String>) -> &mut Self {
        self.text = Some(TextObject::mrkdwn(text));
        self
    }

    fn build(self) -> TextObject {
        self.text.unwrap_or_else(|| TextObject::plain(""))
    }
}

#[derive(Default)]
pub struct ContextBuilder {
    elements: Vec<TextObject>,
}

impl ContextBuilder {
    pub fn plain(&mut self, text: impl Into<String>) -> &mut Self {
        self.elements.push(TextObject::plain(text));
        self
    }

    pub fn mrkdwn(&mut self, text: impl Into<String>) -> &mut Self {
        self.elements.push(TextObject::mrkdwn(text));
        self
    }

    fn build(self) -> Vec<TextObject> {
        self.elements
    }
}

/// Reply to a mention that carries no question.
pub fn greeting_message() -> MessageTemplate {
    MessageBuilder::new("Hi! I'm Opsdesk, your operations assistant.")
        .section("opsdesk.greeting.v1", |section| {
            section.mrkdwn(
                "Hi! I'm Opsdesk, your operations assistant. Try:\n• `search logs for errors in prod`\n• `check recent deploys for service-x`\n• `list alarms in ALARM state`",
            );
        })
        .build()
}

pub fn alert_message(alert: &Alert) -> MessageTemplate {
    let mut builder = MessageBuilder::new(format!(
        ":warning: Opsdesk error: {} - {}",
        alert.kind, alert.summary
    ))
    .section("opsdesk.alert.summary.v1", |section| {
        section.mrkdwn(format!(":warning: *Opsdesk error: {}*\n{}", alert.kind, alert.summary));
    });

    if !alert.context.is_empty() {
        builder = builder.section("opsdesk.alert.context.v1", |section| {
            section.mrkdwn(format!("```{}```", alert.context.replace("```", "'''")));
        });
    }

    builder
        .context("opsdesk.alert.ids.v1", |context| {
            context.plain(format!("Correlation ID: {}", alert.correlation_id));
            if let Some(thread_id) = &alert.thread_id {
                context.plain(format!("Thread: {thread_id}"));
            }
        })
        .build()
}

#[cfg(test)]
mod tests {
    use opsdesk_agent::alerting::Alert;
    use serde_json::json;

    use super::{alert_message, greeting_message, Block, MessageBuilder, TextObject};

    fn alert(context: &str, thread_id: Option<&str>) -> Alert {
        Alert {
            kind: "planner_call_failure",
            summary: "Planner retries exhausted".to_owned(),
            context: context.to_owned(),
            correlation_id: "req-42".to_owned(),
            thread_id: thread_id.map(str::to_owned),
        }
    }

    #[test]
    fn message_builder_creates_typed_block_structure() {
        let message = MessageBuilder::new("fallback")
            .section("summary.v1", |section| {
                section.mrkdwn("*Summary*");
            })
            .context("ids.v1", |context| {
                context.plain("a").plain("b");
            })
            .build();

        assert_eq!(message.blocks.len(), 2);
        assert!(matches!(
            &message.blocks[0],
            Block::Section { block_id, text: TextObject::Mrkdwn { .. } } if block_id == "summary.v1"
        ));
        assert!(matches!(
            &message.blocks[1],
            Block::Context { elements, .. } if elements.len() == 2
        ));
    }

    #[test]
    fn blocks_serialize_with_slack_type_tags() {
        let message = MessageBuilder::new("x")
            .section("s", |section| {
                section.plain("hello");
            })
            .build();

        let block = serde_json::to_value(&message.blocks[0]).expect("json");
        assert_eq!(
            block,
            json!({ "type": "section", "block_id": "s", "text": { "type": "plain_text", "text": "hello" } })
        );
    }

    #[test]
    fn alert_message_carries_ids_and_context() {
        let message = alert_message(&alert("model returned status 529", Some("1730000000.1")));

        assert!(message.fallback_text.contains("planner_call_failure"));
        assert_eq!(message.blocks.len(), 3);
        let Block::Context { elements, .. } = &message.blocks[2] else {
            panic!("expected context block");
        };
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0], TextObject::plain("Correlation ID: req-42"));
    }

    #[test]
    fn alert_without_context_skips_the_context_section() {
        let message = alert_message(&alert("", None));
        assert_eq!(message.blocks.len(), 2);
    }

    #[test]
    fn greeting_lists_example_questions() {
        let message = greeting_message();
        let Block::Section { text: TextObject::Mrkdwn { text }, .. } = &message.blocks[0] else {
            panic!("expected mrkdwn section");
        };
        assert!(text.contains("search logs"));
    }
}
