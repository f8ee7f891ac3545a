//! Conversation history and context compaction.
//!
//! A [`History`] is the append-only message log of one session. Messages are
//! never reordered or removed; superseded messages are tagged
//! [`Tag::Outdated`] and read back in their short form by
//! [`History::get_messages`], which is the only mechanism that shrinks the
//! live context.
//!
//! # Transcript Format
//!
//! [`History::transcript`] renders the live view in a compact format:
//!
//! ```text
//! S> System message here
//!
//! U> User message here
//!
//! A> Assistant response here
//! ```

pub mod markup;
mod message;
mod tag;

pub use markup::MarkupError;
pub use message::{Message, Role, UnknownRole};
pub use tag::{Tag, UnknownTag};

/// Ordered, append-only message log owned by one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History {
    messages: Vec<Message>,
}

impl History {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message. `None` is ignored.
    pub fn add_message(&mut self, message: impl Into<Option<Message>>) {
        if let Some(message) = message.into() {
            self.messages.push(message);
        }
    }

    /// The live view of the history.
    ///
    /// Outdated messages are replaced by their short version, or dropped when
    /// their short content is empty. Order is preserved.
    pub fn get_messages(&self) -> Vec<Message> {
        self.messages
            .iter()
            .filter_map(|message| {
                if !message.is_outdated() {
                    Some(message.clone())
                } else if message.short_is_empty() {
                    None
                } else {
                    Some(message.short_version())
                }
            })
            .collect()
    }

    /// Flag every message carrying any of `tags` as outdated.
    ///
    /// Returns the number of messages that were newly flagged.
    pub fn mark_messages_outdated(&mut self, tags: &[Tag]) -> usize {
        let mut marked = 0;
        for message in &mut self.messages {
            if message.has_any_tag(tags) && !message.is_outdated() {
                message.tags.insert(Tag::Outdated);
                marked += 1;
            }
        }
        marked
    }

    /// Shallow copy of the message list.
    pub fn copy(&self) -> History {
        self.clone()
    }

    /// All messages with their full content, outdated ones included.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages, outdated ones included.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the history has no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Serialize the live view as the markup document for `step`.
    pub fn to_markup(&self, step: usize) -> Result<String, MarkupError> {
        markup::render(step, &self.get_messages())
    }

    /// Reconstruct a history from a step document.
    ///
    /// The result holds exactly the messages that were serialized, which is
    /// the live view at the time of writing.
    pub fn from_markup(xml: &str) -> Result<History, MarkupError> {
        let (_, messages) = markup::parse(xml)?;
        Ok(History { messages })
    }

    /// Render the live view in the compact transcript format.
    pub fn transcript(&self) -> String {
        let mut output = String::new();
        for message in self.get_messages() {
            let prefix = match message.role {
                Role::System => "S> ",
                Role::User => "U> ",
                Role::Assistant => "A> ",
            };
            output.push_str(prefix);
            for (i, line) in message.content.lines().enumerate() {
                if i > 0 {
                    output.push_str("\n   ");
                }
                output.push_str(line);
            }
            output.push_str("\n\n");
        }
        output
    }
}

impl FromIterator<Message> for History {
    fn from_iter<I: IntoIterator<Item = Message>>(iter: I) -> Self {
        Self {
            messages: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample() -> History {
        let mut history = History::new();
        history.add_message(Message::system("briefing").with_tag(Tag::Briefing));
        history.add_message(
            Message::user("think first")
                .with_tags([Tag::InstructionReminder, Tag::Reasoning]),
        );
        history.add_message(Message::assistant("I will list files").with_tag(Tag::Reasoning));
        history.add_message(
            Message::user("full observation text")
                .with_short("[observation elided]")
                .with_tag(Tag::Observation),
        );
        history
    }

    #[test]
    fn test_add_message_ignores_none() {
        let mut history = History::new();
        history.add_message(None);
        assert!(history.is_empty());
        history.add_message(Message::user("x"));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_get_messages_passthrough() {
        let history = sample();
        assert_eq!(history.get_messages(), history.messages());
    }

    #[test]
    fn test_outdated_with_empty_short_is_dropped() {
        let mut history = sample();
        let marked = history.mark_messages_outdated(&[Tag::InstructionReminder]);
        assert_eq!(marked, 1);

        let live = history.get_messages();
        assert_eq!(live.len(), 3);
        assert!(live.iter().all(|m| m.content != "think first"));
        // Full content is still there
        assert_eq!(history.messages()[1].content, "think first");
    }

    #[test]
    fn test_outdated_with_short_is_replaced() {
        let mut history = sample();
        history.mark_messages_outdated(&[Tag::Observation]);

        let live = history.get_messages();
        assert_eq!(live.len(), 4);
        let last = &live[3];
        assert_eq!(last.content, "[observation elided]");
        assert_eq!(last.role, Role::User);
        assert!(last.tags.contains(&Tag::Observation));
        assert!(last.tags.contains(&Tag::Outdated));
    }

    #[test]
    fn test_order_preserved() {
        let mut history = sample();
        history.mark_messages_outdated(&[Tag::Observation]);
        let contents: Vec<_> = history
            .get_messages()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(
            contents,
            [
                "briefing",
                "think first",
                "I will list files",
                "[observation elided]"
            ]
        );
    }

    #[test]
    fn test_mark_outdated_matching_nothing_is_noop() {
        let mut history = sample();
        let before = history.copy();
        assert_eq!(history.mark_messages_outdated(&[Tag::Status]), 0);
        assert_eq!(history.mark_messages_outdated(&[]), 0);
        assert_eq!(history, before);
    }

    #[test]
    fn test_mark_outdated_twice_counts_once() {
        let mut history = sample();
        assert_eq!(history.mark_messages_outdated(&[Tag::Reasoning]), 2);
        assert_eq!(history.mark_messages_outdated(&[Tag::Reasoning]), 0);
    }

    #[test]
    fn test_copy_is_independent() {
        let mut history = sample();
        let copy = history.copy();
        history.add_message(Message::user("more"));
        assert_eq!(copy.len(), 4);
        assert_eq!(history.len(), 5);
    }

    #[test]
    fn test_markup_roundtrip_of_live_view() {
        let mut history = sample();
        history.mark_messages_outdated(&[Tag::InstructionReminder, Tag::Observation]);

        let xml = history.to_markup(2).unwrap();
        let rebuilt = History::from_markup(&xml).unwrap();

        assert_eq!(rebuilt.messages(), history.get_messages().as_slice());
        // Reading the rebuilt history again changes nothing
        assert_eq!(rebuilt.get_messages(), history.get_messages());
    }

    #[test]
    fn test_transcript_format() {
        let history: History = [
            Message::system("Be brief"),
            Message::user("Line 1\nLine 2"),
            Message::assistant("Done"),
        ]
        .into_iter()
        .collect();

        assert_eq!(
            history.transcript(),
            "S> Be brief\n\nU> Line 1\n   Line 2\n\nA> Done\n\n"
        );
    }
}
