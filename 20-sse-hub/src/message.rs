use std::fmt::Write;

use crate::error::{Error, Result};

const TERMINATOR: &str = "\n";

/// One unit of the event-stream protocol.
///
/// `data` may span several lines. Decoded messages always carry a trailing
/// newline per data line, which is the canonical form: formatting and then
/// decoding a canonical message yields the same value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub event: String,
    pub data: String,
    pub retry: String,
    pub comment: String,
}

impl Message {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
            ..Self::default()
        }
    }

    /// A comment-only message, typically used as a keep-alive.
    pub fn comment(text: impl Into<String>) -> Self {
        Self {
            comment: text.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_retry(mut self, retry: impl Into<String>) -> Self {
        self.retry = retry.into();
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    /// Checks the message can be written as exactly one unit.
    ///
    /// Data may span lines; every other field must fit on a single line.
    pub fn validate(&self) -> Result<()> {
        if self.data.trim().is_empty() && self.comment.trim().is_empty() {
            return Err(Error::InvalidMessage);
        }
        let single_line = [&self.id, &self.event, &self.retry, &self.comment]
            .into_iter()
            .all(|value| !value.trim().contains(['\r', '\n']));
        if !single_line {
            return Err(Error::InvalidMessage);
        }
        Ok(())
    }

    /// Serializes the message to wire text, blank line included.
    pub fn format(&self) -> Result<String> {
        self.validate()?;

        let data = self.data.trim();
        let mut frame = String::new();

        if !data.is_empty() {
            push_field(&mut frame, "id", &self.id);
            for line in data.lines() {
                // Blank data lines are still data, so they are written unconditionally.
                let _ = writeln!(frame, "data: {}", line.trim());
            }
        }
        push_field(&mut frame, "event", &self.event);
        push_field(&mut frame, "retry", &self.retry);
        push_field(&mut frame, "", &self.comment);

        frame.push_str(TERMINATOR);
        Ok(frame)
    }
}

fn push_field(frame: &mut String, name: &str, value: &str) {
    let value = value.trim();
    if value.is_empty() {
        return;
    }
    let _ = writeln!(frame, "{name}: {value}");
}
