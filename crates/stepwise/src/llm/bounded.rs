use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::{ModelClient, ModelError, ResponseFormat, Stats};
use crate::history::Message;

/// A client wrapper that caps the number of outstanding calls.
///
/// Clones share the same permits, so one `Bounded` can be handed to many
/// concurrently running sessions.
pub struct Bounded<C> {
    inner: Arc<C>,
    max_concurrent: usize,
    semaphore: Arc<Semaphore>,
}

impl<C> Clone for Bounded<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            max_concurrent: self.max_concurrent,
            semaphore: Arc::clone(&self.semaphore),
        }
    }
}

impl<C> fmt::Debug for Bounded<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bounded")
            .field("max_concurrent", &self.max_concurrent)
            .field("available", &self.semaphore.available_permits())
            .finish_non_exhaustive()
    }
}

impl<C: ModelClient> Bounded<C> {
    /// Allow at most `max_concurrent` outstanding calls to `inner`.
    ///
    /// A limit of zero is raised to one; a client with no permits would wait forever.
    pub fn new(inner: C, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            inner: Arc::new(inner),
            max_concurrent,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    /// The wrapped client.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Permits not currently held by a call.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[async_trait]
impl<C: ModelClient> ModelClient for Bounded<C> {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    async fn call(
        &self,
        messages: &[Message],
        stats: &Stats,
        format: ResponseFormat,
    ) -> Result<String, ModelError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ModelError::Closed)?;

        self.inner.call(messages, stats, format).await
    }

    fn count_tokens(&self, messages: &[Message]) -> usize {
        self.inner.count_tokens(messages)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    /// Tracks the peak number of calls in flight.
    #[derive(Debug, Default)]
    struct Slow {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ModelClient for Slow {
        fn model_id(&self) -> &str {
            "slow"
        }

        async fn call(
            &self,
            _messages: &[Message],
            _stats: &Stats,
            _format: ResponseFormat,
        ) -> Result<String, ModelError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok("done".to_string())
        }

        fn count_tokens(&self, _messages: &[Message]) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn test_bounded_caps_concurrency() {
        let client = Bounded::new(Slow::default(), 2);
        let stats = Stats::new();

        let calls = (0..6).map(|_| {
            let client = client.clone();
            let stats = Arc::clone(&stats);
            async move { client.call(&[], &stats, ResponseFormat::FreeText).await }
        });
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(|r| r.as_deref() == Ok("done")));
        assert_eq!(client.inner().peak.load(Ordering::SeqCst), 2);
        assert_eq!(client.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_zero_limit_still_admits_calls() {
        let client = Bounded::new(Slow::default(), 0);
        assert_eq!(client.available_permits(), 1);

        let stats = Stats::new();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            client.call(&[], &stats, ResponseFormat::FreeText),
        )
        .await
        .unwrap();
        assert_eq!(result.as_deref(), Ok("done"));
    }
}
