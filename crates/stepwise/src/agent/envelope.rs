//! Extraction of the action envelope from a model response.
//!
//! A proposal must contain exactly one `<tag>...</tag>` block. Prose around
//! the block is ignored. A Markdown code fence directly inside the block is
//! stripped.

use thiserror::Error;

/// Why a proposal did not contain a usable action envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolParseError {
    /// Neither marker appears.
    #[error("no <{tag}> block found; reply with exactly one <{tag}>...</{tag}> block")]
    Missing {
        /// Envelope tag.
        tag: String,
    },
    /// The closing marker appears without an opening one.
    #[error("found </{tag}> without a matching <{tag}>")]
    MissingOpen {
        /// Envelope tag.
        tag: String,
    },
    /// The opening marker is never closed.
    #[error("<{tag}> is never closed; end the block with </{tag}>")]
    MissingClose {
        /// Envelope tag.
        tag: String,
    },
    /// A block is opened inside another one.
    #[error("<{tag}> blocks cannot be nested")]
    Nested {
        /// Envelope tag.
        tag: String,
    },
    /// More than one block.
    #[error("found {count} <{tag}> blocks; send exactly one per reply")]
    Repeated {
        /// Envelope tag.
        tag: String,
        /// Number of opening markers.
        count: usize,
    },
}

/// Extract the body of the single `<tag>...</tag>` block in `response`.
pub fn parse_action(response: &str, tag: &str) -> Result<String, ProtocolParseError> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let tag = tag.to_string();

    let opens: Vec<usize> = response.match_indices(&open).map(|(i, _)| i).collect();
    let closes: Vec<usize> = response.match_indices(&close).map(|(i, _)| i).collect();

    match (opens.as_slice(), closes.as_slice()) {
        ([], []) => Err(ProtocolParseError::Missing { tag }),
        ([], _) => Err(ProtocolParseError::MissingOpen { tag }),
        (_, []) => Err(ProtocolParseError::MissingClose { tag }),
        ([start], [end]) if end < start => Err(ProtocolParseError::MissingOpen { tag }),
        ([start], [end]) => {
            let body = &response[start + open.len()..*end];
            Ok(strip_code_fence(body).to_string())
        }
        ([_, second, ..], [first_end, ..]) if second < first_end => {
            Err(ProtocolParseError::Nested { tag })
        }
        ([_], _) => Err(ProtocolParseError::MissingOpen { tag }),
        (starts, _) => Err(ProtocolParseError::Repeated {
            tag,
            count: starts.len(),
        }),
    }
}

/// Remove surrounding blank lines and one enclosing code fence.
fn strip_code_fence(body: &str) -> &str {
    let trimmed = body.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(rest) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. ```script)
    match rest.split_once('\n') {
        Some((_, code)) => code.trim(),
        None => rest.trim(),
    }
}

/// Instructions describing the action protocol, shown once at session start.
pub fn protocol_instructions(tag: &str) -> String {
    format!(
        "Act by replying with exactly one <{tag}>...</{tag}> block containing an action script.\n\
         Text outside the block is ignored.\n\
         \n\
         Statements, one per line:\n\
         \x20 let NAME = EXPR     bind a variable (variables persist between steps)\n\
         \x20 print EXPR          write to stdout\n\
         \x20 warn EXPR           write to stderr\n\
         \x20 del NAME            remove a variable\n\
         \x20 raise EXPR          stop with an error\n\
         \x20 finish EXPR         end the task with this result\n\
         \x20 fail EXPR           give up on the task with this reason\n\
         \x20 EXPR                evaluate (e.g. call a tool)\n\
         \n\
         Expressions are JSON literals, variables, `.field` and `[index]` access, and\n\
         calls. Tools take keyword arguments: read_sheet(path=\"q3.csv\").\n\
         Built-ins: len(x), str(x), vars(), output(name) for truncated output.\n\
         The task arguments are in the variable `task`.\n"
    )
}
