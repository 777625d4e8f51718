use std::sync::LazyLock;

use opsdesk_agent::format::{FormatError, MarkupConverter};
use regex::Regex;

pub const SLACK_FOOTER: &str = "---\n_Opsdesk replies once per thread. Mention me to continue the conversation._";

const FENCE: &str = "```";

static BOLD: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\*\*([^*\n]+)\*\*").ok());
static LINK: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\[([^\]\n]+)\]\((https?://[^)\s]+)\)").ok());

/// Markdown to Slack mrkdwn. Code blocks and inline code pass through untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct SlackMrkdwn;

impl MarkupConverter for SlackMrkdwn {
    fn convert(&self, text: &str) -> Result<String, FormatError> {
        let mut output = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find(FENCE) {
            let (prose, fenced) = rest.split_at(start);
            output.push_str(&convert_prose(prose)?);
            let Some(end) = fenced[FENCE.len()..].find(FENCE) else {
                return Err(FormatError::UnterminatedCodeFence);
            };
            let close = FENCE.len() + end + FENCE.len();
            output.push_str(&fenced[..close]);
            rest = &fenced[close..];
        }

        output.push_str(&convert_prose(rest)?);
        Ok(output)
    }

    fn footer(&self) -> Option<&str> {
        Some(SLACK_FOOTER)
    }
}

fn convert_prose(prose: &str) -> Result<String, FormatError> {
    let (Some(bold), Some(link)) = (BOLD.as_ref(), LINK.as_ref()) else {
        return Err(FormatError::Conversion("mrkdwn patterns failed to compile".to_owned()));
    };

    let mut output = String::with_capacity(prose.len());
    for (index, segment) in prose.split('`').enumerate() {
        if index > 0 {
            output.push('`');
        }
        if index % 2 == 1 {
            output.push_str(segment);
            continue;
        }
        let linked = link.replace_all(segment, "<$2|$1>");
        output.push_str(&bold.replace_all(&linked, "*$1*"));
    }
    Ok(output)
}
