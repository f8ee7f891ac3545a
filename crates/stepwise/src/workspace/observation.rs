//! Observation envelopes shown to the model after each step.
//!
//! ```text
//! <observation step="3">
//! <stdout_3>
//! 42
//! </stdout_3>
//! <exception_3>
//! line 2: name 'rows' is not defined
//! </exception_3>
//! </observation>
//! ```

use std::collections::HashMap;

use crate::tools::Completion;

/// Placeholder used when a step produced nothing at all.
pub const NO_OUTPUT: &str = "(no output)";

/// Text cut to a character budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limited {
    /// The text as shown to the model.
    pub text: String,
    /// Whether anything was cut.
    pub truncated: bool,
}

/// Cut `text` to at most `limit` characters.
///
/// When the text is cut, a marker naming `channel` is appended so the model
/// knows where to read the full text from.
pub fn limit_text(text: &str, limit: usize, channel: &str) -> Limited {
    match text.char_indices().nth(limit) {
        None => Limited {
            text: text.to_string(),
            truncated: false,
        },
        Some((cut, _)) => {
            let total = text.chars().count();
            Limited {
                text: format!(
                    "{}\n... [output truncated: showing {limit} of {total} characters; \
                     full text available via output(\"{channel}\")] ...",
                    &text[..cut]
                ),
                truncated: true,
            }
        }
    }
}

/// Inputs for one observation envelope.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ObservationParts<'a> {
    pub step: u64,
    pub stdout: &'a str,
    pub stderr: &'a str,
    pub exception: Option<&'a str>,
    pub completion: Option<&'a Completion>,
}

/// Render the envelope, parking the full text of every truncated section in
/// `outputs` under its channel name.
pub(crate) fn render(
    parts: ObservationParts<'_>,
    limit: usize,
    outputs: &mut HashMap<String, String>,
) -> String {
    let step = parts.step;
    let mut out = format!("<observation step=\"{step}\">\n");
    let mut empty = true;

    let sections = [
        ("stdout", parts.stdout),
        ("stderr", parts.stderr),
        ("exception", parts.exception.unwrap_or_default()),
    ];

    for (kind, text) in sections {
        let text = text.trim_end_matches('\n');
        if text.is_empty() {
            continue;
        }
        empty = false;

        let channel = format!("{kind}_{step}");
        let shown = park(text, limit, &channel, outputs);
        out.push_str(&format!("<{channel}>\n{shown}\n</{channel}>\n"));
    }

    if let Some(completion) = parts.completion {
        empty = false;
        let status = if completion.is_success() {
            "success"
        } else {
            "failure"
        };
        let report = park(&completion.report(), limit, &format!("completion_{step}"), outputs);
        out.push_str(&format!(
            "<completion status=\"{status}\">\n{report}\n</completion>\n"
        ));
    }

    if empty {
        out.push_str(NO_OUTPUT);
        out.push('\n');
    }

    out.push_str("</observation>");
    out
}

/// Limit `text`, keeping the full text under `channel` when it was cut.
///
/// A channel that fits is cleared so `output()` never returns text from an
/// earlier run that reused the step number.
fn park(text: &str, limit: usize, channel: &str, outputs: &mut HashMap<String, String>) -> String {
    let limited = limit_text(text, limit, channel);
    if limited.truncated {
        tracing::debug!(%channel, chars = text.chars().count(), "parking truncated output");
        outputs.insert(channel.to_string(), text.to_string());
    } else {
        outputs.remove(channel);
    }
    limited.text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts<'a>(stdout: &'a str, stderr: &'a str, exception: Option<&'a str>) -> ObservationParts<'a> {
        ObservationParts {
            step: 3,
            stdout,
            stderr,
            exception,
            completion: None,
        }
    }

    #[test]
    fn test_limit_text_under_limit() {
        let limited = limit_text("hello", 5, "stdout_1");
        assert_eq!(limited.text, "hello");
        assert!(!limited.truncated);
    }

    #[test]
    fn test_limit_text_over_limit_names_channel() {
        let limited = limit_text("hello world", 5, "stdout_1");
        assert!(limited.truncated);
        assert!(limited.text.starts_with("hello\n"));
        assert!(limited.text.contains("output(\"stdout_1\")"));
        assert!(limited.text.contains("5 of 11"));
    }

    #[test]
    fn test_limit_text_counts_characters_not_bytes() {
        let limited = limit_text("ééé", 3, "stdout_1");
        assert!(!limited.truncated);
        let limited = limit_text("éééé", 3, "stdout_1");
        assert!(limited.text.starts_with("ééé\n"));
    }

    #[test]
    fn test_render_omits_empty_sections() {
        let mut outputs = HashMap::new();
        let text = render(parts("42\n", "", None), 100, &mut outputs);
        assert_eq!(
            text,
            "<observation step=\"3\">\n<stdout_3>\n42\n</stdout_3>\n</observation>"
        );
        assert!(outputs.is_empty());
    }

    #[test]
    fn test_render_no_output() {
        let mut outputs = HashMap::new();
        let text = render(parts("", "", None), 100, &mut outputs);
        assert!(text.contains(NO_OUTPUT));
    }

    #[test]
    fn test_render_all_sections_in_order() {
        let mut outputs = HashMap::new();
        let text = render(parts("out", "err", Some("boom")), 100, &mut outputs);
        let stdout = text.find("<stdout_3>").unwrap_or(usize::MAX);
        let stderr = text.find("<stderr_3>").unwrap_or(usize::MAX);
        let exception = text.find("<exception_3>").unwrap_or(usize::MAX);
        assert!(stdout < stderr && stderr < exception && exception < text.len());
        assert!(!text.contains(NO_OUTPUT));
    }

    #[test]
    fn test_render_parks_truncated_text() {
        let mut outputs = HashMap::new();
        let long = "x".repeat(50);
        let text = render(parts(&long, "", None), 10, &mut outputs);
        assert!(!text.contains(&long));
        assert_eq!(outputs.get("stdout_3"), Some(&long));
    }

    #[test]
    fn test_render_completion() {
        let mut outputs = HashMap::new();
        let completion = Completion::failure("no data");
        let text = render(
            ObservationParts {
                completion: Some(&completion),
                ..parts("", "", None)
            },
            100,
            &mut outputs,
        );
        assert!(text.contains("<completion status=\"failure\">\nno data\n</completion>"));
        assert!(!text.contains(NO_OUTPUT));
        assert!(outputs.is_empty());

        let long = Completion::success("abcdefghijklmnopqrstuvwxyz");
        let text = render(
            ObservationParts {
                completion: Some(&long),
                ..parts("", "", None)
            },
            10,
            &mut outputs,
        );
        assert!(text.contains("output(\"completion_3\")"));
        assert_eq!(
            outputs.get("completion_3").map(String::as_str),
            Some("abcdefghijklmnopqrstuvwxyz")
        );
    }

    #[test]
    fn test_render_clears_stale_channel() {
        let mut outputs = HashMap::new();
        let long = "x".repeat(50);
        render(parts(&long, "", None), 10, &mut outputs);
        assert!(outputs.contains_key("stdout_3"));

        render(parts("short", "", None), 10, &mut outputs);
        assert!(!outputs.contains_key("stdout_3"));
    }
}
