//! Session configuration.
//!
//! One [`AgentConfig`] is built (or deserialized) up front and threaded
//! through the agent loop and its collaborators. Nothing in the crate reads
//! ambient globals.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while validating a configuration.
///
/// These are fatal: no session is started with an invalid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The retry wrapper needs at least one attempt.
    #[error("retry.max_attempts must be at least 1")]
    NoAttempts,
    /// The input-token budget must be positive.
    #[error("max_input_tokens must be positive")]
    NoTokenBudget,
    /// The observation truncation threshold must be positive.
    #[error("max_output_chars must be positive")]
    NoOutputBudget,
    /// The action envelope tag is empty or not a plain identifier.
    #[error("invalid action tag {0:?}")]
    InvalidActionTag(String),
    /// The configured model is not the one the client talks to.
    #[error("configured model {configured:?} does not match client model {client:?}")]
    ModelMismatch {
        /// Model named in the configuration.
        configured: String,
        /// Model reported by the client.
        client: String,
    },
    /// The configuration file could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Retry policy for external model calls.
///
/// Waits are fixed: no jitter and no exponential backoff, so the worst-case
/// latency of one call is `max_attempts * (timeout + wait)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Fixed wait between attempts.
    #[serde(with = "duration_ms")]
    pub wait: Duration,
    /// Timeout applied to each individual attempt.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            wait: Duration::from_secs(5),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Configuration for one agent session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Model the session must run against. When set, an agent built with a
    /// client reporting a different model id is rejected.
    pub model: Option<String>,
    /// Ceiling on model calls for the whole session.
    pub max_calls: u32,
    /// Input-token budget reported in the status line.
    pub max_input_tokens: u64,
    /// Whether each turn makes a separate reasoning call before the proposal.
    pub reasoning: bool,
    /// Observation sections longer than this are truncated.
    pub max_output_chars: usize,
    /// Name of the action envelope tag (`run_script` → `<run_script>..</run_script>`).
    pub action_tag: String,
    /// Directory for the per-step log and the trajectory. Nothing is written when unset.
    pub log_dir: Option<PathBuf>,
    /// Retry policy for model calls.
    pub retry: RetryConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_calls: 40,
            max_input_tokens: 128_000,
            reasoning: true,
            max_output_chars: 4_000,
            action_tag: "run_script".to_string(),
            log_dir: None,
            retry: RetryConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Parse a configuration from TOML text and validate it.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values that would make a session meaningless.
    ///
    /// A `max_calls` of zero is accepted: such a session ends immediately
    /// without calling the model.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        if self.max_input_tokens == 0 {
            return Err(ConfigError::NoTokenBudget);
        }
        if self.max_output_chars == 0 {
            return Err(ConfigError::NoOutputBudget);
        }
        let tag_ok = !self.action_tag.is_empty()
            && self
                .action_tag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !tag_ok {
            return Err(ConfigError::InvalidActionTag(self.action_tag.clone()));
        }
        Ok(())
    }
}

/// Helper for serializing Duration as milliseconds
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.action_tag, "run_script");
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = AgentConfig::default();
        config.retry.max_attempts = 0;
        assert_eq!(config.validate(), Err(ConfigError::NoAttempts));
    }

    #[test]
    fn test_zero_token_budget_rejected() {
        let config = AgentConfig {
            max_input_tokens: 0,
            ..AgentConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoTokenBudget));
    }

    #[test]
    fn test_zero_call_budget_accepted() {
        let config = AgentConfig {
            max_calls: 0,
            ..AgentConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_action_tag_rejected() {
        let config = AgentConfig {
            action_tag: "run script>".to_string(),
            ..AgentConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidActionTag(_))
        ));
    }

    #[test]
    fn test_from_toml() {
        let config = AgentConfig::from_toml(
            r#"
model = "claude-3-5-haiku-latest"
max_calls = 12
reasoning = false

[retry]
max_attempts = 5
wait = 250
timeout = 30000
"#,
        )
        .unwrap();

        assert_eq!(config.model.as_deref(), Some("claude-3-5-haiku-latest"));
        assert_eq!(config.max_calls, 12);
        assert!(!config.reasoning);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.wait, Duration::from_millis(250));
        assert_eq!(config.retry.timeout, Duration::from_secs(30));
        // Unset fields fall back to defaults
        assert_eq!(config.max_output_chars, 4_000);
    }

    #[test]
    fn test_from_toml_validates() {
        let err = AgentConfig::from_toml("max_input_tokens = 0").unwrap_err();
        assert_eq!(err, ConfigError::NoTokenBudget);
    }

    #[test]
    fn test_retry_serialization_format() {
        let retry = RetryConfig {
            max_attempts: 2,
            wait: Duration::from_millis(1500),
            timeout: Duration::from_secs(10),
        };

        let json = serde_json::to_string(&retry).unwrap();

        // Durations should be serialized as milliseconds
        assert!(json.contains("\"wait\":1500"));
        assert!(json.contains("\"timeout\":10000"));
    }
}
