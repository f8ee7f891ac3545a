//! Conversation messages.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::tag::Tag;

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Instructions from the harness.
    System,
    /// Input to the model (status lines, observations, reminders).
    User,
    /// Model output.
    Assistant,
}

impl Role {
    /// The persisted name of this role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown role name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// A single conversation unit.
///
/// The full content is never modified once the message is in a history.
/// Compaction happens at read time by substituting [`Message::short_version`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Author of the message.
    pub role: Role,
    /// Full content.
    pub content: String,
    /// Compacted content used once the message is outdated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short: Option<String>,
    /// Structural tags.
    #[serde(default)]
    pub tags: BTreeSet<Tag>,
    /// Rendering hint for viewers (e.g. `"code"`, `"status"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl Message {
    /// Create a message with the given role and content.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            short: None,
            tags: BTreeSet::new(),
            display: None,
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Set the short content.
    pub fn with_short(mut self, short: impl Into<String>) -> Self {
        self.short = Some(short.into());
        self
    }

    /// Add a tag.
    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tags.insert(tag);
        self
    }

    /// Add several tags.
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
        self.tags.extend(tags);
        self
    }

    /// Set the display hint.
    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }

    /// Whether the message carries [`Tag::Outdated`].
    pub fn is_outdated(&self) -> bool {
        self.tags.contains(&Tag::Outdated)
    }

    /// Whether the message carries any of `tags`.
    pub fn has_any_tag(&self, tags: &[Tag]) -> bool {
        tags.iter().any(|tag| self.tags.contains(tag))
    }

    /// Whether the short content is absent or empty.
    pub fn short_is_empty(&self) -> bool {
        self.short.as_deref().is_none_or(str::is_empty)
    }

    /// A new message made of the short content, with the same role, tags and display hint.
    ///
    /// The result keeps the short content as its own short content, so
    /// compacting an already-compacted message is a no-op.
    pub fn short_version(&self) -> Message {
        let short = self.short.clone().unwrap_or_default();
        Message {
            role: self.role,
            content: short.clone(),
            short: Some(short),
            tags: self.tags.clone(),
            display: self.display.clone(),
        }
    }
}
