use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ModelClient, ModelError, ResponseFormat, Stats, Usage, estimate_tokens};
use crate::history::Message;

/// A deterministic client that replays queued responses in order.
///
/// Each entry is either a response or an error to return for that call.
/// Usage is recorded with the [`estimate_tokens`] heuristic.
#[derive(Debug)]
pub struct ScriptedClient {
    model: String,
    responses: Mutex<VecDeque<Result<String, ModelError>>>,
    seen: Mutex<Vec<(Vec<Message>, ResponseFormat)>>,
}

impl ScriptedClient {
    /// A client that answers with `responses`, one per call.
    pub fn new<S: Into<String>>(responses: impl IntoIterator<Item = S>) -> Self {
        Self::from_results(responses.into_iter().map(|r| Ok(r.into())))
    }

    /// A client whose calls return these results in order.
    pub fn from_results(results: impl IntoIterator<Item = Result<String, ModelError>>) -> Self {
        Self {
            model: "scripted".to_string(),
            responses: Mutex::new(results.into_iter().collect()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Report a different model id.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Queued results not yet returned.
    pub fn remaining(&self) -> usize {
        self.responses.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Messages and formats of every call so far.
    pub fn requests(&self) -> Vec<(Vec<Message>, ResponseFormat)> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn call(
        &self,
        messages: &[Message],
        stats: &Stats,
        format: ResponseFormat,
    ) -> Result<String, ModelError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push((messages.to_vec(), format));
        }

        let next = self
            .responses
            .lock()
            .map_err(|_| ModelError::Closed)?
            .pop_front()
            .unwrap_or(Err(ModelError::Exhausted));

        if let Ok(text) = &next {
            let input = estimate_tokens(messages) as u64;
            let output = text.chars().count().div_ceil(4) as u64;
            stats.record_usage(&self.model, Usage::new(input, output));
        }
        next
    }

    fn count_tokens(&self, messages: &[Message]) -> usize {
        estimate_tokens(messages)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replays_in_order() {
        let client = ScriptedClient::new(["first", "second"]).with_model("replay");
        let stats = Stats::new();

        let a = client
            .call(&[Message::user("hi")], &stats, ResponseFormat::FreeText)
            .await
            .unwrap();
        let b = client.call(&[], &stats, ResponseFormat::FreeText).await.unwrap();

        assert_eq!((a.as_str(), b.as_str()), ("first", "second"));
        assert_eq!(client.remaining(), 0);
        assert_eq!(
            client.call(&[], &stats, ResponseFormat::FreeText).await,
            Err(ModelError::Exhausted)
        );
        assert_eq!(client.requests().len(), 3);
        assert_eq!(stats.usage_for("replay"), Usage::new(1, 4));
    }

    #[tokio::test]
    async fn test_queued_errors() {
        let client = ScriptedClient::from_results([
            Err(ModelError::RateLimited),
            Ok("ok".to_string()),
        ]);
        let stats = Stats::new();
        assert_eq!(
            client.call(&[], &stats, ResponseFormat::FreeText).await,
            Err(ModelError::RateLimited)
        );
        assert_eq!(
            client.call(&[], &stats, ResponseFormat::FreeText).await.unwrap(),
            "ok"
        );
    }
}
