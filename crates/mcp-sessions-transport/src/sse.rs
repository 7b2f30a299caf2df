//! Incremental parsing of event-stream response bodies.

/// Accumulates body chunks and yields complete, non-empty lines.
///
/// Chunk boundaries fall anywhere, including inside a UTF-8 sequence, so the
/// buffer is byte-oriented and lines are decoded only once complete.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Feed a chunk; returns the lines it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=newline).collect();
            let mut end = raw.len() - 1;
            if end > 0 && raw[end - 1] == b'\r' {
                end -= 1;
            }
            if let Ok(text) = std::str::from_utf8(&raw[..end]) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }
        }
        lines
    }

    /// Flush whatever remains once the body ends.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let text = std::str::from_utf8(&rest).ok()?.trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

/// Whether a Content-Type header denotes an event stream.
#[must_use]
pub fn is_event_stream(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

/// Payload of a `data:` line, if that is what the line is.
#[must_use]
pub fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}
