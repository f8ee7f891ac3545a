//! Model client contract, retry wrapper and usage accounting.
//!
//! The agent loop talks to a language model only through [`ModelClient`].
//! Concrete provider bindings live outside this crate; [`ScriptedClient`]
//! replays canned responses for tests and offline replays, and [`Bounded`]
//! caps the number of outstanding calls when many sessions share a client.

mod bounded;
pub mod pricing;
pub mod retry;
mod scripted;
pub mod stats;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use bounded::Bounded;
pub use pricing::{ModelPrice, PriceTable};
pub use retry::{Retried, RetryError};
pub use scripted::ScriptedClient;
pub use stats::{CallRecord, Cost, Stats, StatsSummary, Usage};

use crate::history::Message;

/// What shape of response a call asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseFormat {
    /// Unconstrained text (the reasoning call).
    FreeText,
    /// A response containing one action envelope with this tag.
    ActionEnvelope {
        /// Envelope tag name, without angle brackets.
        tag: String,
    },
}

/// Errors from a model call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    /// The provider rejected or failed the request.
    #[error("provider error: {0}")]
    Provider(String),
    /// The provider asked us to slow down.
    #[error("rate limited")]
    RateLimited,
    /// The client has nothing more to say (scripted clients).
    #[error("no response available")]
    Exhausted,
    /// The client has been shut down.
    #[error("client closed")]
    Closed,
}

/// A language model the agent loop can call.
///
/// Implementations record the token usage of every call in `stats` with
/// [`Stats::record_usage`]. Timing and retry counts are recorded by the
/// caller, which owns the retry policy.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Identifier used for pricing and logs.
    fn model_id(&self) -> &str;

    /// Send the messages and return the response text.
    async fn call(
        &self,
        messages: &[Message],
        stats: &Stats,
        format: ResponseFormat,
    ) -> Result<String, ModelError>;

    /// Count the input tokens the messages would use.
    fn count_tokens(&self, messages: &[Message]) -> usize;
}

#[async_trait]
impl<C: ModelClient + ?Sized> ModelClient for Arc<C> {
    fn model_id(&self) -> &str {
        (**self).model_id()
    }

    async fn call(
        &self,
        messages: &[Message],
        stats: &Stats,
        format: ResponseFormat,
    ) -> Result<String, ModelError> {
        (**self).call(messages, stats, format).await
    }

    fn count_tokens(&self, messages: &[Message]) -> usize {
        (**self).count_tokens(messages)
    }
}

/// Rough token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    messages
        .iter()
        .map(|m| m.content.chars().count().div_ceil(4))
        .sum()
}
