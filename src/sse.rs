//! Incremental SSE line framer for OpenAI-compatible chat-completion streams.
//!
//! [`SseParser`] holds the bytes that have not formed a complete line yet and
//! turns each network chunk into zero or more [`SseFrame`]s. It knows nothing
//! about sockets, so it can be driven with synthetic chunks in tests.
//!
//! ## Line rules
//! - lines split on `\n`, a trailing `\r` is trimmed
//! - blank lines and `:` comment lines are skipped
//! - lines without the `data: ` prefix are skipped
//! - `data: [DONE]` ends the stream; everything after it is ignored
//! - a `data:` payload that fails to decode is pushed back to the front of the
//!   buffer and the current pass stops, waiting for more bytes
//! - more than [`MAX_BUFFERED_BYTES`] piled up behind such a line is a
//!   [`RelayError::MalformedFrame`]
//!
//! Buffering is byte-level: a multi-byte character split across two chunks is
//! only decoded once its line is complete.

use crate::error::{RelayError, Result};
use crate::providers::ChatCompletionChunk;

pub const DATA_PREFIX: &str = "data: ";
pub const DONE_SENTINEL: &str = "[DONE]";

/// Upper bound on bytes held back behind an undecodable `data:` line.
pub const MAX_BUFFERED_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// Non-empty `choices[0].delta.content`.
    Delta(String),
    /// The `[DONE]` sentinel.
    Done,
}

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    done: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `[DONE]` has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Bytes held back waiting for a line terminator or a decodable payload.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Append one network chunk and return the frames it completed.
    ///
    /// Fails with [`RelayError::MalformedFrame`] once more than
    /// [`MAX_BUFFERED_BYTES`] are held back behind a line that never decodes.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>> {
        let mut frames = Vec::new();
        if self.done {
            return Ok(frames);
        }
        self.buffer.extend_from_slice(chunk);
        if let Some(stuck) = self.drain(&mut frames) {
            if self.buffer.len() > MAX_BUFFERED_BYTES {
                self.buffer.clear();
                return Err(RelayError::MalformedFrame { line: stuck });
            }
        }
        Ok(frames)
    }

    /// Signal end of input. A trailing unterminated line is processed; a payload
    /// that still does not decode is reported as [`RelayError::MalformedFrame`].
    pub fn finish(&mut self) -> Result<Vec<SseFrame>> {
        let mut frames = Vec::new();
        if self.done {
            self.buffer.clear();
            return Ok(frames);
        }
        if !self.buffer.is_empty() && !self.buffer.ends_with(b"\n") {
            self.buffer.push(b'\n');
        }
        match self.drain(&mut frames) {
            Some(line) => Err(RelayError::MalformedFrame { line }),
            None => Ok(frames),
        }
    }

    /// Consume complete lines into `frames`. Returns the `data:` line that did not
    /// decode, which is left at the front of the buffer.
    fn drain(&mut self, frames: &mut Vec<SseFrame>) -> Option<String> {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let mut line = String::from_utf8_lossy(&raw[..pos]).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }

            if line.starts_with(':') || line.trim().is_empty() {
                continue;
            }
            let Some(payload) = line.strip_prefix(DATA_PREFIX).map(str::trim) else {
                continue;
            };

            if payload == DONE_SENTINEL {
                self.done = true;
                self.buffer.clear();
                frames.push(SseFrame::Done);
                return None;
            }

            match serde_json::from_str::<ChatCompletionChunk>(payload) {
                Ok(chunk) => {
                    if let Some(text) = chunk.into_first_content() {
                        frames.push(SseFrame::Delta(text));
                    }
                }
                Err(_) => {
                    let mut restored = line.clone().into_bytes();
                    restored.push(b'\n');
                    restored.append(&mut self.buffer);
                    self.buffer = restored;
                    return Some(line);
                }
            }
        }
        None
    }
}

/// Deltas only, in arrival order.
pub fn deltas(frames: Vec<SseFrame>) -> impl Iterator<Item = String> {
    frames.into_iter().filter_map(|f| match f {
        SseFrame::Delta(text) => Some(text),
        SseFrame::Done => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices":[{"delta":{"content":content}}]})
        )
    }

    fn run(chunks: &[&[u8]]) -> Result<String> {
        let mut parser = SseParser::new();
        let mut out = String::new();
        for chunk in chunks {
            out.extend(deltas(parser.feed(chunk)?));
        }
        out.extend(deltas(parser.finish()?));
        Ok(out)
    }

    #[test]
    fn test_single_frame() {
        let data = frame("Hi");
        assert_eq!(run(&[data.as_bytes()]).unwrap(), "Hi");
    }

    #[test]
    fn test_frames_concatenate_in_order() {
        let data = format!("{}{}{}", frame("Hel"), frame("lo"), frame(", world"));
        assert_eq!(run(&[data.as_bytes()]).unwrap(), "Hello, world");
    }

    #[test]
    fn test_split_inside_json_payload() {
        let line = b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n";
        for cut in 0..line.len() {
            let (a, b) = line.split_at(cut);
            assert_eq!(run(&[a, b]).unwrap(), "Hi", "cut at {cut}");
        }
    }

    #[test]
    fn test_partial_line_is_buffered() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: {\"choices\":[{\"de").unwrap().is_empty());
        assert!(parser.buffered_len() > 0);
        let frames = parser.feed(b"lta\":{\"content\":\"ok\"}}]}\n").unwrap();
        assert_eq!(frames, vec![SseFrame::Delta("ok".into())]);
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn test_crlf_line_endings() {
        let data = frame("crlf").replace('\n', "\r\n");
        assert_eq!(run(&[data.as_bytes()]).unwrap(), "crlf");
    }

    #[test]
    fn test_comments_and_blank_lines_are_skipped() {
        let data = format!(": keep-alive\n\n:OPENROUTER PROCESSING\n{}\n\n", frame("x"));
        let mut parser = SseParser::new();
        let frames = parser.feed(data.as_bytes()).unwrap();
        assert_eq!(frames, vec![SseFrame::Delta("x".into())]);
    }

    #[test]
    fn test_non_data_lines_are_skipped() {
        let data = format!("event: message\nid: 4\nretry: 100\ndata:{{}}\n{}", frame("y"));
        assert_eq!(run(&[data.as_bytes()]).unwrap(), "y");
    }

    #[test]
    fn test_done_halts_accumulation() {
        let data = format!("{}data: [DONE]\n\n{}", frame("a"), frame("b"));
        let mut parser = SseParser::new();
        let frames = parser.feed(data.as_bytes()).unwrap();
        assert_eq!(frames, vec![SseFrame::Delta("a".into()), SseFrame::Done]);
        assert!(parser.is_done());
        assert!(parser.feed(frame("c").as_bytes()).unwrap().is_empty());
        assert!(parser.finish().unwrap().is_empty());
    }

    #[test]
    fn test_done_with_surrounding_whitespace() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"data:  [DONE] \r\n").unwrap();
        assert_eq!(frames, vec![SseFrame::Done]);
    }

    #[test]
    fn test_empty_and_missing_content_emit_nothing() {
        let data = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"\"}}]}\n\
                    data: {\"choices\":[]}\n";
        let mut parser = SseParser::new();
        assert!(parser.feed(data.as_bytes()).unwrap().is_empty());
        assert!(parser.finish().unwrap().is_empty());
    }

    #[test]
    fn test_undecodable_line_is_pushed_back() {
        let mut parser = SseParser::new();
        let data = format!("data: {{not json\n{}", frame("later"));
        assert!(parser.feed(data.as_bytes()).unwrap().is_empty());
        assert!(parser.buffered_len() >= data.len());
        assert!(parser.feed(b"").unwrap().is_empty());
    }

    #[test]
    fn test_stuck_line_with_runaway_backlog_is_malformed() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: {not json\n").unwrap().is_empty());
        let filler = frame("x").repeat(MAX_BUFFERED_BYTES / 40 + 1);
        match parser.feed(filler.as_bytes()) {
            Err(RelayError::MalformedFrame { line }) => assert_eq!(line, "data: {not json"),
            other => panic!("expected MalformedFrame, got {other:?}"),
        }
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn test_partial_frame_below_cap_keeps_waiting() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: {\"choices\":[{\"delta\":").unwrap().is_empty());
        let frames = parser.feed(b"{\"content\":\"ok\"}}]}\n").unwrap();
        assert_eq!(frames, vec![SseFrame::Delta("ok".into())]);
    }

    #[test]
    fn test_undecodable_line_at_end_is_malformed() {
        let mut parser = SseParser::new();
        parser.feed(b"data: {not json\n").unwrap();
        match parser.finish() {
            Err(RelayError::MalformedFrame { line }) => assert_eq!(line, "data: {not json"),
            other => panic!("expected MalformedFrame, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_final_frame_is_malformed() {
        let mut parser = SseParser::new();
        parser.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"cut").unwrap();
        assert!(matches!(parser.finish(), Err(RelayError::MalformedFrame { .. })));
    }

    #[test]
    fn test_unterminated_final_frame_is_flushed() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}").unwrap();
        assert!(frames.is_empty());
        assert_eq!(parser.finish().unwrap(), vec![SseFrame::Delta("tail".into())]);
    }

    #[test]
    fn test_multibyte_character_split_across_chunks() {
        let data = frame("héllo ✨");
        let bytes = data.as_bytes();
        let sparkle = data.find('✨').unwrap();
        let (a, b) = bytes.split_at(sparkle + 1);
        assert_eq!(run(&[a, b]).unwrap(), "héllo ✨");
    }

    #[test]
    fn test_escaped_newline_inside_content() {
        let data = frame("line one\nline two");
        assert_eq!(run(&[data.as_bytes()]).unwrap(), "line one\nline two");
    }

    proptest! {
        #[test]
        fn prop_chunk_boundaries_do_not_change_content(
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..12)
        ) {
            let data = format!(
                ": ping\n\n{}{}{}data: [DONE]\n\n{}",
                frame("Once upon "),
                frame("a time ✨ "),
                frame("in Ærwyn."),
                frame("ignored"),
            );
            let bytes = data.as_bytes();
            let mut offsets: Vec<usize> = cuts.iter().map(|i| i.index(bytes.len() + 1)).collect();
            offsets.sort_unstable();
            offsets.dedup();

            let mut chunks: Vec<&[u8]> = Vec::new();
            let mut start = 0;
            for end in offsets {
                chunks.push(&bytes[start..end]);
                start = end;
            }
            chunks.push(&bytes[start..]);

            prop_assert_eq!(run(&chunks).unwrap(), "Once upon a time ✨ in Ærwyn.");
        }
    }
}
