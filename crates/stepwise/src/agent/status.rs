//! The status line added at the start of every turn.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local};

/// Budget and progress figures shown to the model each turn.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusLine {
    /// Wall-clock time of the turn.
    pub now: DateTime<Local>,
    /// Time since the session started.
    pub elapsed: Duration,
    /// Current turn.
    pub turn: usize,
    /// Model calls made so far.
    pub calls_used: usize,
    /// Call ceiling.
    pub max_calls: u32,
    /// Input-token budget minus the size of the live context. Negative when over budget.
    pub tokens_remaining: i64,
}

impl StatusLine {
    /// Remaining budget computed from the configured ceiling and a token count.
    pub fn tokens_remaining(max_input_tokens: u64, used: usize) -> i64 {
        let max = i64::try_from(max_input_tokens).unwrap_or(i64::MAX);
        let used = i64::try_from(used).unwrap_or(i64::MAX);
        max.saturating_sub(used)
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.elapsed.as_secs();
        write!(
            f,
            "[status] {} | elapsed {:02}:{:02}:{:02} | turn {} | model calls {}/{} | input tokens remaining {}",
            self.now.format("%Y-%m-%d %H:%M:%S"),
            secs / 3600,
            (secs % 3600) / 60,
            secs % 60,
            self.turn,
            self.calls_used,
            self.max_calls,
            self.tokens_remaining,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format() {
        let status = StatusLine {
            now: Local.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).single().unwrap_or_else(Local::now),
            elapsed: Duration::from_secs(3723),
            turn: 3,
            calls_used: 5,
            max_calls: 40,
            tokens_remaining: 1200,
        };
        let text = status.to_string();
        assert!(text.contains("elapsed 01:02:03"));
        assert!(text.contains("turn 3"));
        assert!(text.contains("model calls 5/40"));
        assert!(text.ends_with("input tokens remaining 1200"));
    }

    #[test]
    fn test_tokens_remaining_can_go_negative() {
        assert_eq!(StatusLine::tokens_remaining(100, 30), 70);
        assert_eq!(StatusLine::tokens_remaining(100, 130), -30);
    }
}
