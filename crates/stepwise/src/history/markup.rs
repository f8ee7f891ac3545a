//! Markup serialization of message sequences.
//!
//! Each step of a session is persisted as one XML document:
//!
//! ```text
//! <?xml version="1.0" encoding="UTF-8"?>
//! <history step="3">
//!   <message role="user" tags="observation">
//!     <content>&lt;observation step="3"&gt;\n...</content>
//!   </message>
//!   <message role="user" tags="instruction_reminder,outdated">
//!     <content></content>
//!     <short></short>
//!   </message>
//! </history>
//! ```
//!
//! Message text goes through [`escape_text`] before XML escaping, so control
//! characters (which XML cannot carry faithfully) survive the round trip.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use quick_xml::events::attributes::AttrError;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

use super::message::{Message, Role, UnknownRole};
use super::tag::{Tag, UnknownTag};

/// Errors produced while reading or writing step markup.
#[derive(Debug, Error)]
pub enum MarkupError {
    /// Error from the XML reader or writer.
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),
    /// Malformed attribute.
    #[error("XML attribute error: {0}")]
    Attr(#[from] AttrError),
    /// IO error while writing.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Escaped text contains an invalid escape sequence.
    #[error("invalid escape sequence at offset {0}")]
    Escape(usize),
    /// Required element or attribute missing.
    #[error("missing {0}")]
    Missing(&'static str),
    /// Unknown role name.
    #[error(transparent)]
    Role(#[from] UnknownRole),
    /// Unknown tag name.
    #[error(transparent)]
    Tag(#[from] UnknownTag),
    /// Attribute that should be numeric is not.
    #[error("invalid step number: {0}")]
    Step(String),
}

/// Encode control characters reversibly.
///
/// The escape character itself is encoded first (`\` → `\\`), so a literal
/// `\n` in the input can never be confused with an encoded newline.
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{{{:04x}}}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape_text`].
pub fn unescape_text(text: &str) -> Result<String, MarkupError> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices();

    while let Some((offset, c)) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some((_, '\\')) => out.push('\\'),
            Some((_, 'n')) => out.push('\n'),
            Some((_, 'r')) => out.push('\r'),
            Some((_, 't')) => out.push('\t'),
            Some((_, 'u')) => {
                if !matches!(chars.next(), Some((_, '{'))) {
                    return Err(MarkupError::Escape(offset));
                }
                let mut hex = String::new();
                loop {
                    match chars.next() {
                        Some((_, '}')) => break,
                        Some((_, h)) if h.is_ascii_hexdigit() && hex.len() < 6 => hex.push(h),
                        _ => return Err(MarkupError::Escape(offset)),
                    }
                }
                let decoded = u32::from_str_radix(&hex, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or(MarkupError::Escape(offset))?;
                out.push(decoded);
            }
            _ => return Err(MarkupError::Escape(offset)),
        }
    }

    Ok(out)
}

/// Render a message sequence as a step document.
pub fn render(step: usize, messages: &[Message]) -> Result<String, MarkupError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let step_attr = step.to_string();
    let mut root = BytesStart::new("history");
    root.push_attribute(("step", step_attr.as_str()));
    writer.write_event(Event::Start(root))?;

    for message in messages {
        let mut start = BytesStart::new("message");
        start.push_attribute(("role", message.role.as_str()));
        if !message.tags.is_empty() {
            let tags = message
                .tags
                .iter()
                .map(Tag::as_str)
                .collect::<Vec<_>>()
                .join(",");
            start.push_attribute(("tags", tags.as_str()));
        }
        if let Some(display) = &message.display {
            let display = escape_text(display);
            start.push_attribute(("display", display.as_str()));
        }
        writer.write_event(Event::Start(start))?;

        write_text_element(&mut writer, "content", &message.content)?;
        if let Some(short) = &message.short {
            write_text_element(&mut writer, "short", short)?;
        }

        writer.write_event(Event::End(BytesEnd::new("message")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("history")))?;

    String::from_utf8(writer.into_inner())
        .map_err(|e| MarkupError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

fn write_text_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    text: &str,
) -> Result<(), MarkupError> {
    let escaped = escape_text(text);
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(&escaped)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

/// Which text field of a message is being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Content,
    Short,
}

/// Message fields collected while reading one `<message>` element.
#[derive(Debug)]
struct Partial {
    role: Role,
    tags: BTreeSet<Tag>,
    display: Option<String>,
    content: Option<String>,
    short: Option<String>,
}

impl Partial {
    fn from_start(start: &BytesStart<'_>) -> Result<Self, MarkupError> {
        let role = start
            .try_get_attribute("role")?
            .ok_or(MarkupError::Missing("role attribute"))?
            .unescape_value()?
            .parse::<Role>()?;

        let mut tags = BTreeSet::new();
        if let Some(attr) = start.try_get_attribute("tags")? {
            for name in attr.unescape_value()?.split(',').filter(|s| !s.is_empty()) {
                tags.insert(name.parse::<Tag>()?);
            }
        }

        let display = match start.try_get_attribute("display")? {
            Some(attr) => Some(unescape_text(&attr.unescape_value()?)?),
            None => None,
        };

        Ok(Self {
            role,
            tags,
            display,
            content: None,
            short: None,
        })
    }

    fn finish(self) -> Result<Message, MarkupError> {
        Ok(Message {
            role: self.role,
            content: self.content.ok_or(MarkupError::Missing("content element"))?,
            short: self.short,
            tags: self.tags,
            display: self.display,
        })
    }
}

/// Parse a step document back into its step number and messages.
pub fn parse(xml: &str) -> Result<(usize, Vec<Message>), MarkupError> {
    let mut reader = Reader::from_str(xml);
    let mut step = None;
    let mut messages = Vec::new();
    let mut current: Option<Partial> = None;
    let mut field: Option<(Field, String)> = None;

    loop {
        match reader.read_event()? {
            Event::Start(start) => match start.name().as_ref() {
                b"history" => {
                    let value = start
                        .try_get_attribute("step")?
                        .ok_or(MarkupError::Missing("step attribute"))?
                        .unescape_value()?
                        .into_owned();
                    step = Some(value.parse::<usize>().map_err(|_| MarkupError::Step(value))?);
                }
                b"message" => current = Some(Partial::from_start(&start)?),
                b"content" => field = Some((Field::Content, String::new())),
                b"short" => field = Some((Field::Short, String::new())),
                _ => {}
            },
            Event::Empty(start) => match start.name().as_ref() {
                b"content" => set_field(&mut current, Field::Content, String::new())?,
                b"short" => set_field(&mut current, Field::Short, String::new())?,
                b"message" => {
                    return Err(MarkupError::Missing("content element"));
                }
                _ => {}
            },
            Event::Text(text) => {
                if let Some((_, buf)) = field.as_mut() {
                    buf.push_str(&text.unescape()?);
                }
            }
            Event::End(end) => match end.name().as_ref() {
                b"content" | b"short" => {
                    if let Some((which, buf)) = field.take() {
                        set_field(&mut current, which, unescape_text(&buf)?)?;
                    }
                }
                b"message" => {
                    let partial = current.take().ok_or(MarkupError::Missing("message start"))?;
                    messages.push(partial.finish()?);
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    let step = step.ok_or(MarkupError::Missing("history element"))?;
    Ok((step, messages))
}

fn set_field(current: &mut Option<Partial>, which: Field, text: String) -> Result<(), MarkupError> {
    let partial = current
        .as_mut()
        .ok_or(MarkupError::Missing("enclosing message element"))?;
    match which {
        Field::Content => partial.content = Some(text),
        Field::Short => partial.short = Some(text),
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_control_characters() {
        assert_eq!(escape_text("a\nb\tc\r"), "a\\nb\\tc\\r");
        assert_eq!(escape_text("bell\u{7}"), "bell\\u{0007}");
        assert_eq!(escape_text("plain"), "plain");
    }

    #[test]
    fn test_escape_is_collision_safe() {
        // A literal backslash-n must not decode to a newline
        let literal = "path\\nope";
        let escaped = escape_text(literal);
        assert_eq!(escaped, "path\\\\nope");
        assert_eq!(unescape_text(&escaped).unwrap(), literal);

        let newline = "path\nope";
        assert_ne!(escape_text(newline), escaped);
    }

    #[test]
    fn test_unescape_roundtrip_mixed() {
        let text = "tab\there\\u{41}\u{0}\u{1b}[0m \\\\ done\n";
        assert_eq!(unescape_text(&escape_text(text)).unwrap(), text);
    }

    #[test]
    fn test_unescape_rejects_dangling_escape() {
        assert!(matches!(unescape_text("oops\\"), Err(MarkupError::Escape(4))));
        assert!(matches!(unescape_text("\\q"), Err(MarkupError::Escape(0))));
        assert!(matches!(unescape_text("\\u{zz}"), Err(MarkupError::Escape(0))));
    }

    #[test]
    fn test_render_contains_no_raw_control_characters() {
        let messages = vec![Message::user("line one\nline two\u{7}")];
        let xml = render(1, &messages).unwrap();
        let body = xml.split_once("<content>").unwrap().1;
        let body = body.split_once("</content>").unwrap().0;
        assert!(!body.chars().any(char::is_control));
    }

    #[test]
    fn test_render_parse_roundtrip() {
        let messages = vec![
            Message::system("You are <careful> & \"precise\"").with_tag(Tag::Briefing),
            Message::user("  leading and trailing spaces  ")
                .with_short("")
                .with_tags([Tag::InstructionReminder, Tag::Outdated]),
            Message::assistant("<run_script>\nprint \"hi\"\n</run_script>")
                .with_tag(Tag::ActionProposal)
                .with_display("code\tblock"),
            Message::user(""),
        ];

        let xml = render(7, &messages).unwrap();
        let (step, parsed) = parse(&xml).unwrap();

        assert_eq!(step, 7);
        assert_eq!(parsed, messages);
    }

    #[test]
    fn test_parse_rejects_unknown_role() {
        let xml = r#"<history step="1"><message role="tool"><content>x</content></message></history>"#;
        assert!(matches!(parse(xml), Err(MarkupError::Role(_))));
    }

    #[test]
    fn test_parse_requires_history_element() {
        assert!(matches!(parse("<other/>"), Err(MarkupError::Missing(_))));
    }
}
