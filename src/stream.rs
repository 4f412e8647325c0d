use std::borrow::Cow;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;

/// Buffers a streamed response body and hands back complete SSE blocks.
/// Line endings (`\r\n`, `\r`, `\n`) are normalised to `\n`, also when a
/// `\r\n` pair or a multi-byte character straddles two chunks.
#[derive(Debug, Default)]
pub(crate) struct SseBuffer {
    pending: String,
    partial_utf8: Vec<u8>,
    after_cr: bool,
}

impl SseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) {
        let mut bytes = std::mem::take(&mut self.partial_utf8);
        bytes.extend_from_slice(chunk);

        let (text, tail): (Cow<'_, str>, &[u8]) = match std::str::from_utf8(&bytes) {
            Ok(s) => (Cow::Borrowed(s), &[]),
            Err(err) if err.error_len().is_none() => {
                let (valid, tail) = bytes.split_at(err.valid_up_to());
                (String::from_utf8_lossy(valid), tail)
            }
            Err(_) => (String::from_utf8_lossy(&bytes), &[]),
        };

        for ch in text.chars() {
            match ch {
                '\r' => {
                    self.pending.push('\n');
                    self.after_cr = true;
                }
                '\n' if self.after_cr => self.after_cr = false,
                other => {
                    self.pending.push(other);
                    self.after_cr = false;
                }
            }
        }
        self.partial_utf8 = tail.to_vec();
    }

    pub fn next_block(&mut self) -> Option<String> {
        loop {
            let pos = self.pending.find("\n\n")?;
            let block = self.pending[..pos].to_string();
            self.pending.drain(..pos + 2);
            if !block.trim().is_empty() {
                return Some(block);
            }
        }
    }

    /// Whatever is left once the body ends without a trailing blank line.
    pub fn take_remaining(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        if rest.trim().is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}

/// Joins the `data:` lines of an SSE block. Comments and other fields are ignored.
pub(crate) fn block_data(block: &str) -> Option<String> {
    let mut data: Option<String> = None;
    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            let rest = rest.strip_prefix(' ').unwrap_or(rest);
            match data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(rest);
                }
                None => data = Some(rest.to_string()),
            }
        }
    }
    data
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkEvent {
    Done,
    Progress {
        /// Cumulative completion tokens reported by the server, if any.
        completion_tokens: Option<u64>,
        prompt_tokens: Option<u64>,
        /// Whether any choice carried non-empty text.
        has_text: bool,
    },
}

/// Interprets one `data:` payload of an OpenAI-style completion stream.
pub(crate) fn parse_chunk(data: &str) -> Result<ChunkEvent> {
    let trimmed = data.trim();
    if trimmed == "[DONE]" {
        return Ok(ChunkEvent::Done);
    }

    let payload: Value = serde_json::from_str(trimmed)
        .with_context(|| format!("stream chunk is not valid JSON: {}", trimmed))?;

    if let Some(error) = payload.get("error") {
        let message = error
            .get("message")
            .and_then(|value| value.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(anyhow!("engine reported an error: {}", message));
    }

    let usage = payload.get("usage").filter(|usage| !usage.is_null());
    let completion_tokens = usage
        .and_then(|usage| usage.get("completion_tokens"))
        .and_then(|value| value.as_u64());
    let prompt_tokens = usage
        .and_then(|usage| usage.get("prompt_tokens"))
        .and_then(|value| value.as_u64());

    let has_text = payload
        .get("choices")
        .and_then(|choices| choices.as_array())
        .map(|choices| {
            choices.iter().any(|choice| {
                choice
                    .get("text")
                    .and_then(|text| text.as_str())
                    .is_some_and(|text| !text.is_empty())
            })
        })
        .unwrap_or(false);

    Ok(ChunkEvent::Progress {
        completion_tokens,
        prompt_tokens,
        has_text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_survive_split_chunks_and_crlf() {
        let mut buffer = SseBuffer::new();
        buffer.push_chunk(b"data: {\"a\":");
        assert!(buffer.next_block().is_none());
        buffer.push_chunk(b"1}\r\n\r\n\n\ndata: [DONE]\r\n\r\n");

        assert_eq!(buffer.next_block().as_deref(), Some("data: {\"a\":1}"));
        assert_eq!(buffer.next_block().as_deref(), Some("data: [DONE]"));
        assert!(buffer.next_block().is_none());
        assert!(buffer.take_remaining().is_none());
    }

    #[test]
    fn crlf_boundary_split_across_chunks() {
        let mut buffer = SseBuffer::new();
        buffer.push_chunk(b"data: a\r\n\r");
        buffer.push_chunk(b"\n");
        buffer.push_chunk(b"data: b\r");
        buffer.push_chunk(b"\n\r\n");

        assert_eq!(buffer.next_block().as_deref(), Some("data: a"));
        assert_eq!(buffer.next_block().as_deref(), Some("data: b"));
        assert!(buffer.next_block().is_none());
    }

    #[test]
    fn bare_carriage_returns_end_lines() {
        let mut buffer = SseBuffer::new();
        buffer.push_chunk(b"data: a\r\rdata: b\r\r");

        assert_eq!(buffer.next_block().as_deref(), Some("data: a"));
        assert_eq!(buffer.next_block().as_deref(), Some("data: b"));
    }

    #[test]
    fn multibyte_character_split_across_chunks() {
        let text = "data: zażółć\n\n".as_bytes();
        let split = text.iter().position(|byte| *byte >= 0x80).unwrap() + 1;

        let mut buffer = SseBuffer::new();
        buffer.push_chunk(&text[..split]);
        buffer.push_chunk(&text[split..]);

        assert_eq!(buffer.next_block().as_deref(), Some("data: zażółć"));
    }

    #[test]
    fn unterminated_tail_is_recoverable() {
        let mut buffer = SseBuffer::new();
        buffer.push_chunk(b"data: [DONE]");
        assert!(buffer.next_block().is_none());
        assert_eq!(buffer.take_remaining().as_deref(), Some("data: [DONE]"));
    }

    #[test]
    fn block_data_skips_comments_and_joins_lines() {
        assert_eq!(block_data(": keep-alive"), None);
        assert_eq!(
            block_data("event: message\ndata: one\ndata:two").as_deref(),
            Some("one\ntwo")
        );
    }

    #[test]
    fn usage_and_text_are_extracted() {
        let event = parse_chunk(
            r#"{"choices":[{"index":0,"text":" ROCm"}],"usage":{"prompt_tokens":13,"completion_tokens":7}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            ChunkEvent::Progress {
                completion_tokens: Some(7),
                prompt_tokens: Some(13),
                has_text: true,
            }
        );

        let empty = parse_chunk(r#"{"choices":[{"index":0,"text":""}],"usage":null}"#).unwrap();
        assert_eq!(
            empty,
            ChunkEvent::Progress {
                completion_tokens: None,
                prompt_tokens: None,
                has_text: false,
            }
        );
    }

    #[test]
    fn done_and_error_payloads() {
        assert_eq!(parse_chunk(" [DONE] ").unwrap(), ChunkEvent::Done);

        let err = parse_chunk(r#"{"error":{"message":"out of memory"}}"#).unwrap_err();
        assert!(err.to_string().contains("out of memory"));

        assert!(parse_chunk("not json").is_err());
    }
}
