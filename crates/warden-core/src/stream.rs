//! Classification of worker stdout.
//!
//! Workers speak newline-delimited JSON (`stream-json`). Reads from a pipe
//! can split a line anywhere, so bytes go through a [`LineBuffer`] first and
//! only complete lines are decoded into a [`StreamLine`].

use serde::Deserialize;

use crate::event::OutputKind;

/// Longest line held back waiting for a newline. Anything longer is
/// released as-is in pieces of this size.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Accumulates raw bytes and yields complete lines.
#[derive(Debug)]
pub struct LineBuffer {
    pending: Vec<u8>,
    /// Prefix of `pending` already known to hold no newline.
    scanned: usize,
    max_line: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            pending: Vec::new(),
            scanned: 0,
            max_line: max_line.max(1),
        }
    }

    /// Append a chunk and return every line it completed. A trailing partial
    /// line stays buffered until the next chunk, unless it reaches the
    /// maximum line length.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(pos) = self.pending[from..].iter().position(|b| *b == b'\n') {
            let end = from + pos;
            lines.push(decode_line(&self.pending[start..end]));
            start = end + 1;
            from = start;
        }
        self.pending.drain(..start);

        while self.pending.len() >= self.max_line {
            let rest = self.pending.split_off(self.max_line);
            let head = std::mem::replace(&mut self.pending, rest);
            lines.push(String::from_utf8_lossy(&head).into_owned());
        }
        self.scanned = self.pending.len();
        lines
    }

    /// Drain whatever is left once the stream has closed.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(decode_line(&rest))
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    Assistant {
        message: AssistantBody,
    },
    Result {
        #[serde(default)]
        subtype: Option<String>,
    },
    System {
        #[serde(default)]
        subtype: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct AssistantBody {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {},
    #[serde(other)]
    Other,
}

/// One decoded line of worker output.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamLine {
    /// Assistant turn; holds the text of each `text` block in order.
    Assistant(Vec<String>),
    /// End-of-run summary.
    Result,
    /// Session bookkeeping (init and friends).
    System,
    /// Well-formed JSON event we do not surface (tool results, thinking-only turns).
    Ignored,
    /// Not a JSON event at all; forwarded as-is.
    Raw(String),
}

impl StreamLine {
    pub fn parse(line: &str) -> Self {
        match serde_json::from_str::<WireMessage>(line) {
            Ok(WireMessage::Assistant { message }) => {
                let texts: Vec<String> = message
                    .content
                    .into_iter()
                    .filter_map(|block| match block {
                        ContentBlock::Text { text } => Some(text),
                        ContentBlock::Thinking {} | ContentBlock::Other => None,
                    })
                    .collect();
                if texts.is_empty() {
                    StreamLine::Ignored
                } else {
                    StreamLine::Assistant(texts)
                }
            }
            Ok(WireMessage::Result { subtype }) => {
                tracing::debug!(subtype = ?subtype, "worker result");
                StreamLine::Result
            }
            Ok(WireMessage::System { subtype }) => {
                tracing::debug!(subtype = ?subtype, "worker system event");
                StreamLine::System
            }
            Ok(WireMessage::Other) => StreamLine::Ignored,
            Err(_) if is_json_object(line) => StreamLine::Ignored,
            Err(_) => StreamLine::Raw(line.to_string()),
        }
    }

    /// Output events this line produces, as `(kind, chunk)` pairs.
    pub fn into_outputs(self) -> Vec<(OutputKind, String)> {
        match self {
            StreamLine::Assistant(texts) => texts
                .into_iter()
                .map(|text| (OutputKind::Text, text))
                .collect(),
            StreamLine::Result => vec![(OutputKind::Done, String::new())],
            StreamLine::System | StreamLine::Ignored => Vec::new(),
            StreamLine::Raw(line) => vec![(OutputKind::Stdout, line)],
        }
    }
}

fn is_json_object(line: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(line)
        .map(|v| v.is_object())
        .unwrap_or(false)
}

/// Feeds stdout chunks through a [`LineBuffer`] and classifies each line.
#[derive(Debug, Default)]
pub struct StdoutClassifier {
    buffer: LineBuffer,
}

impl StdoutClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<(OutputKind, String)> {
        let lines = self.buffer.push(chunk);
        lines.iter().flat_map(|line| classify(line)).collect()
    }

    pub fn finish(&mut self) -> Vec<(OutputKind, String)> {
        self.buffer
            .finish()
            .map(|line| classify(&line))
            .unwrap_or_default()
    }
}

fn classify(line: &str) -> Vec<(OutputKind, String)> {
    if line.trim().is_empty() {
        return Vec::new();
    }
    StreamLine::parse(line).into_outputs()
}

/// Stderr is forwarded verbatim, minus surrounding whitespace.
pub fn classify_stderr(chunk: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(chunk);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ASSISTANT: &str = r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"hmm"},{"type":"text","text":"Hello"},{"type":"tool_use","id":"t1","name":"Bash","input":{}},{"type":"text","text":"World"}]}}"#;

    #[test]
    fn buffer_keeps_partial_line() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"abc").is_empty());
        assert!(!buf.is_empty());
        assert_eq!(buf.push(b"def\nghi"), vec!["abcdef"]);
        assert_eq!(buf.push(b"\r\n\n"), vec!["ghi", ""]);
        assert!(buf.is_empty());
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn buffer_flushes_unterminated_tail() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"tail without newline").is_empty());
        assert_eq!(buf.finish().as_deref(), Some("tail without newline"));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn buffer_finds_newline_after_many_chunks() {
        let mut buf = LineBuffer::new();
        for _ in 0..100 {
            assert!(buf.push(&[b'a'; 1000]).is_empty());
        }
        let lines = buf.push(b"\nb\n");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), 100_000);
        assert_eq!(lines[1], "b");
        assert!(buf.is_empty());
    }

    #[test]
    fn buffer_releases_oversized_line() {
        let mut buf = LineBuffer::with_max_line(8);
        assert!(buf.push(b"abcde").is_empty());
        assert_eq!(buf.push(b"fghij"), vec!["abcdefgh"]);
        assert_eq!(buf.push(b"k\nrest"), vec!["ijk"]);
        assert_eq!(buf.finish().as_deref(), Some("rest"));
    }

    #[test]
    fn buffer_rejoins_split_utf8() {
        let bytes = "héllo\n".as_bytes();
        let mut buf = LineBuffer::new();
        // split inside the two-byte 'é'
        assert!(buf.push(&bytes[..2]).is_empty());
        assert_eq!(buf.push(&bytes[2..]), vec!["héllo"]);
    }

    #[test]
    fn assistant_text_blocks_become_text_events() {
        let outputs = StreamLine::parse(ASSISTANT).into_outputs();
        assert_eq!(
            outputs,
            vec![
                (OutputKind::Text, "Hello".to_string()),
                (OutputKind::Text, "World".to_string()),
            ]
        );
    }

    #[test]
    fn thinking_only_turn_is_ignored() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"..."}]}}"#;
        assert_eq!(StreamLine::parse(line), StreamLine::Ignored);
    }

    #[test]
    fn result_emits_single_done() {
        let line = r#"{"type":"result","subtype":"success","is_error":false,"result":"ok","usage":{"input_tokens":3}}"#;
        assert_eq!(
            StreamLine::parse(line).into_outputs(),
            vec![(OutputKind::Done, String::new())]
        );
    }

    #[test]
    fn system_and_unknown_json_are_discarded() {
        let init = r#"{"type":"system","subtype":"init","session_id":"abc","tools":[]}"#;
        assert_eq!(StreamLine::parse(init), StreamLine::System);
        let user = r#"{"type":"user","message":{"content":[{"type":"tool_result"}]}}"#;
        assert_eq!(StreamLine::parse(user), StreamLine::Ignored);
        let untyped = r#"{"hello":"world"}"#;
        assert_eq!(StreamLine::parse(untyped), StreamLine::Ignored);
    }

    #[test]
    fn plain_text_is_forwarded_verbatim() {
        let line = "[mock] butler: working on it";
        assert_eq!(
            StreamLine::parse(line).into_outputs(),
            vec![(OutputKind::Stdout, line.to_string())]
        );
        // truncated JSON is not an event either
        assert_eq!(
            StreamLine::parse(r#"{"type":"assistant""#),
            StreamLine::Raw(r#"{"type":"assistant""#.to_string())
        );
        assert_eq!(StreamLine::parse("42"), StreamLine::Raw("42".to_string()));
    }

    #[test]
    fn split_json_line_matches_whole_line() {
        let whole = format!("{ASSISTANT}\n");
        let mut one = StdoutClassifier::new();
        let expected = one.push(whole.as_bytes());
        assert_eq!(expected.len(), 2);

        let mut split = StdoutClassifier::new();
        let cut = r#"{"type":"assistant""#.len();
        assert!(split.push(whole[..cut].as_bytes()).is_empty());
        assert_eq!(split.push(whole[cut..].as_bytes()), expected);
    }

    #[test]
    fn classifier_skips_blank_lines_and_flushes_tail() {
        let mut c = StdoutClassifier::new();
        assert!(c.push(b"\n  \n").is_empty());
        assert!(c.push(b"last words").is_empty());
        assert_eq!(
            c.finish(),
            vec![(OutputKind::Stdout, "last words".to_string())]
        );
    }

    #[test]
    fn classifier_emits_oversized_fragment_as_stdout() {
        let mut c = StdoutClassifier {
            buffer: LineBuffer::with_max_line(16),
        };
        let out = c.push(br#"{"type":"assistant","message""#);
        assert_eq!(
            out,
            vec![(OutputKind::Stdout, r#"{"type":"assista"#.to_string())]
        );
    }

    #[test]
    fn stderr_is_trimmed_and_blank_dropped() {
        assert_eq!(classify_stderr(b"  warning: x \n").as_deref(), Some("warning: x"));
        assert_eq!(classify_stderr(b" \n\t"), None);
    }
}
