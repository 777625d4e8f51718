use opsdesk_core::domain::Message;

pub const HISTORY_ENTRY_MAX_CHARS: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Speaker {
    User,
    Bot,
}

/// One prior message of the thread as the host channel reports it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    pub speaker: Speaker,
    pub text: String,
}

impl HistoryEntry {
    pub fn user(text: impl Into<String>) -> Self {
        Self { speaker: Speaker::User, text: text.into() }
    }

    pub fn bot(text: impl Into<String>) -> Self {
        Self { speaker: Speaker::Bot, text: text.into() }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelContext {
    pub channel_name: Option<String>,
    pub is_operations_channel: bool,
}

impl ChannelContext {
    pub fn note(&self) -> Option<String> {
        let name = self.channel_name.as_deref()?;
        if self.is_operations_channel {
            Some(format!(
                "[Context: User is in #{name} channel. This is the operations channel, so don't tell them to post here.]"
            ))
        } else {
            Some(format!("[Context: User is in #{name} channel.]"))
        }
    }
}

/// Builds the planner's message list from thread history and the current request.
///
/// Only the last `window` non-blank entries survive; older ones are dropped. The
/// current message, with the channel note appended, is always last.
pub fn build_messages(
    history: &[HistoryEntry],
    current: &str,
    channel: &ChannelContext,
    window: usize,
) -> Vec<Message> {
    let kept = history.iter().filter(|entry| !entry.text.trim().is_empty()).collect::<Vec<_>>();
    let skip = kept.len().saturating_sub(window);

    let mut messages = kept
        .into_iter()
        .skip(skip)
        .map(|entry| {
            let text = cap_chars(entry.text.trim(), HISTORY_ENTRY_MAX_CHARS);
            match entry.speaker {
                Speaker::User => Message::user(text),
                Speaker::Bot => Message::assistant(text),
            }
        })
        .collect::<Vec<_>>();

    let current = match channel.note() {
        Some(note) => format!("{current}\n\n{note}"),
        None => current.to_string(),
    };
    messages.push(Message::user(current));
    messages
}

/// Keyword match on the channel name, e.g. `#team-devops` or `#sre-oncall`.
pub fn is_operations_channel(channel_name: &str, keywords: &[String]) -> bool {
    let lowered = channel_name.to_lowercase();
    keywords.iter().any(|keyword| lowered.contains(&keyword.to_lowercase()))
}

fn cap_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => text[..index].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use opsdesk_core::domain::Role;

    use super::{
        build_messages, is_operations_channel, ChannelContext, HistoryEntry,
        HISTORY_ENTRY_MAX_CHARS,
    };

    #[test]
    fn keeps_only_the_recent_window_and_appends_current_last() {
        let history = (0..15)
            .map(|index| {
                if index % 2 == 0 {
                    HistoryEntry::user(format!("question {index}"))
                } else {
                    HistoryEntry::bot(format!("answer {index}"))
                }
            })
            .collect::<Vec<_>>();

        let messages = build_messages(&history, "latest", &ChannelContext::default(), 10);

        assert_eq!(messages.len(), 11);
        assert_eq!(messages[0].text(), "answer 5");
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[10].text(), "latest");
        assert_eq!(messages[10].role, Role::User);
    }

    #[test]
    fn blank_entries_are_skipped_and_long_entries_capped() {
        let history = vec![
            HistoryEntry::user("   "),
            HistoryEntry::bot("é".repeat(HISTORY_ENTRY_MAX_CHARS + 20)),
        ];

        let messages = build_messages(&history, "next", &ChannelContext::default(), 10);

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text().chars().count(), HISTORY_ENTRY_MAX_CHARS);
    }

    #[test]
    fn zero_window_keeps_only_current_message() {
        let messages =
            build_messages(&[HistoryEntry::user("old")], "now", &ChannelContext::default(), 0);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text(), "now");
    }

    #[test]
    fn operations_channel_note_discourages_redirecting() {
        let channel = ChannelContext {
            channel_name: Some("team-devops".to_string()),
            is_operations_channel: true,
        };

        let messages = build_messages(&[], "deploy status?", &channel, 10);

        let text = messages[0].text();
        assert!(text.starts_with("deploy status?\n\n[Context: User is in #team-devops channel."));
        assert!(text.contains("don't tell them to post here"));
    }

    #[test]
    fn detects_operations_channels_by_keyword() {
        let keywords = vec!["devops".to_string(), "sre".to_string()];
        assert!(is_operations_channel("Team-DevOps", &keywords));
        assert!(!is_operations_channel("random", &keywords));
    }
}
