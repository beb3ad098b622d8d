use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::{
    error::{Error, Result},
    message::Message,
};

/// Reads event-stream units off a buffered byte stream.
pub struct Decoder<R> {
    reader: R,
    line: String,
}

impl<R> Decoder<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
        }
    }

    /// Returns the next message, or `StreamEnded` once the stream closes or
    /// fails before a blank line completes the unit.
    pub async fn decode(&mut self) -> Result<Message> {
        let mut message = Message::default();

        loop {
            self.line.clear();
            let bytes = self
                .reader
                .read_line(&mut self.line)
                .await
                .map_err(|err| Error::StreamEnded {
                    reason: err.to_string(),
                })?;
            if bytes == 0 {
                return Err(Error::StreamEnded {
                    reason: "end of stream".to_string(),
                });
            }

            let line = self.line.trim();
            if line.is_empty() {
                return Ok(message);
            }
            apply_field(&mut message, line);
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

fn apply_field(message: &mut Message, line: &str) {
    if let Some(value) = line.strip_prefix("event:") {
        message.event = value.trim().to_string();
    } else if let Some(value) = line.strip_prefix("data:") {
        message.data.push_str(value.trim());
        message.data.push('\n');
    } else if let Some(value) = line.strip_prefix("id:") {
        message.id = value.trim().to_string();
    } else if let Some(value) = line.strip_prefix("retry:") {
        message.retry = value.trim().to_string();
    } else if let Some(value) = line.strip_prefix(':') {
        message.comment = value.trim().to_string();
    }
    // Unknown fields are skipped so newer servers stay readable.
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncWriteExt, BufReader};

    use super::*;

    fn decoder(input: &'static str) -> Decoder<&'static [u8]> {
        Decoder::new(input.as_bytes())
    }

    #[tokio::test]
    async fn decodes_all_fields() {
        let mut decoder = decoder("id: 7\nevent: update\ndata: one\nretry: 1500\n: note\n\n");
        let message = decoder.decode().await.expect("decode");
        assert_eq!(
            message,
            Message {
                id: "7".into(),
                event: "update".into(),
                data: "one\n".into(),
                retry: "1500".into(),
                comment: "note".into(),
            }
        );
    }

    #[tokio::test]
    async fn joins_multi_line_data() {
        let mut decoder = decoder("data: first\ndata: second\n\n");
        let message = decoder.decode().await.expect("decode");
        assert_eq!(message.data, "first\nsecond\n");
    }

    #[tokio::test]
    async fn ignores_unknown_fields_and_handles_crlf() {
        let mut decoder = decoder("event: tick\r\nx-custom: 1\r\ndata: t\r\n\r\n");
        let message = decoder.decode().await.expect("decode");
        assert_eq!(message.event, "tick");
        assert_eq!(message.data, "t\n");
    }

    #[tokio::test]
    async fn decodes_consecutive_units() {
        let mut decoder = decoder("event: a\ndata: 1\n\nevent: b\ndata: 2\n\n");
        assert_eq!(decoder.decode().await.expect("first").event, "a");
        assert_eq!(decoder.decode().await.expect("second").event, "b");
        assert!(matches!(
            decoder.decode().await,
            Err(Error::StreamEnded { .. })
        ));
    }

    #[tokio::test]
    async fn truncated_unit_reports_stream_end() {
        let mut decoder = decoder("event: partial\ndata: never finished\n");
        assert!(matches!(
            decoder.decode().await,
            Err(Error::StreamEnded { .. })
        ));
    }

    #[tokio::test]
    async fn decodes_from_a_live_pipe() {
        let (mut writer, reader) = tokio::io::duplex(256);
        let mut decoder = Decoder::new(BufReader::new(reader));

        writer
            .write_all(b"event: ping\ndata: pong\n\n")
            .await
            .expect("write");
        let message = decoder.decode().await.expect("decode");
        assert_eq!(message.event, "ping");
        assert_eq!(message.data, "pong\n");

        drop(writer);
        assert!(matches!(
            decoder.decode().await,
            Err(Error::StreamEnded { .. })
        ));
    }

    #[tokio::test]
    async fn round_trips_canonical_messages() {
        let messages = [
            Message::new("update", "hello\n").with_id("1"),
            Message::new("", "line one\nline two\n").with_retry("2000"),
            Message::comment("keep-alive"),
            Message::new("full", "a\n\nb\n")
                .with_id("9")
                .with_retry("10")
                .with_comment("c"),
        ];

        for message in messages {
            let frame = message.format().expect("format");
            let mut decoder = Decoder::new(frame.as_bytes());
            let decoded = decoder.decode().await.expect("decode");
            assert_eq!(decoded, message, "frame was {frame:?}");
        }
    }

    #[tokio::test]
    async fn line_breaks_in_fields_never_yield_extra_units() {
        let suspicious = [
            Message::new("alert\n\nevent: ping", "payload\n"),
            Message::new("news", "x\n").with_comment("note\ndata: injected"),
            Message::new("news", "x\n").with_id("7\r\nevent: ping"),
        ];

        for message in suspicious {
            match message.format() {
                Err(Error::InvalidMessage) => {}
                Ok(frame) => {
                    let mut decoder = Decoder::new(frame.as_bytes());
                    assert_eq!(decoder.decode().await.expect("decode"), message);
                    assert!(matches!(
                        decoder.decode().await,
                        Err(Error::StreamEnded { .. })
                    ));
                }
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }

        // Whitespace around single-line fields is trimmed and still round-trips.
        let padded = Message::new(" news\n", "x\n").with_comment("\tnote\r\n");
        let frame = padded.format().expect("format");
        let decoded = Decoder::new(frame.as_bytes()).decode().await.expect("decode");
        assert_eq!(decoded, Message::new("news", "x\n").with_comment("note"));
    }
}
