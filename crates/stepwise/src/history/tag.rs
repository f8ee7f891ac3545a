//! Structural tags attached to conversation messages.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Structural role of a message within a session.
///
/// The vocabulary is closed. Only [`Tag::Outdated`] changes behaviour: it
/// makes [`History::get_messages`](super::History::get_messages) substitute
/// the message's short content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tag {
    /// Task briefing given once at session start.
    Briefing,
    /// Standing guidelines.
    Guidelines,
    /// Documentation of the available tools.
    ToolDocs,
    /// Per-step status line.
    Status,
    /// Reasoning request or response.
    Reasoning,
    /// Action-proposal request or response.
    ActionProposal,
    /// Result of executing an action.
    Observation,
    /// Per-turn instruction reminder, superseded every turn.
    InstructionReminder,
    /// Superseded message; read back in its short form.
    Outdated,
}

impl Tag {
    /// Every tag, in declaration order.
    pub const ALL: [Tag; 9] = [
        Tag::Briefing,
        Tag::Guidelines,
        Tag::ToolDocs,
        Tag::Status,
        Tag::Reasoning,
        Tag::ActionProposal,
        Tag::Observation,
        Tag::InstructionReminder,
        Tag::Outdated,
    ];

    /// The persisted name of this tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::Briefing => "briefing",
            Tag::Guidelines => "guidelines",
            Tag::ToolDocs => "tool_docs",
            Tag::Status => "status",
            Tag::Reasoning => "reasoning",
            Tag::ActionProposal => "action_proposal",
            Tag::Observation => "observation",
            Tag::InstructionReminder => "instruction_reminder",
            Tag::Outdated => "outdated",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown tag name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown tag: {0}")]
pub struct UnknownTag(pub String);

impl FromStr for Tag {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tag::ALL
            .iter()
            .find(|tag| tag.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownTag(s.to_string()))
    }
}
