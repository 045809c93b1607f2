//! Splitting upstream body bytes into logical fragments.
//!
//! Events are separated by a blank line (`\r\n\r\n` or `\n\n`). Inside an
//! event every `data:` line becomes one fragment; an event with no `data:`
//! line is passed through whole, which is how a plain JSON body ends up as a
//! single fragment.

use llamagate_core::{GatewayError, Result};

/// Cap on bytes held for a single event that has not ended yet. A plain
/// JSON body counts as one event.
pub const MAX_EVENT_BYTES: usize = 20 * 1024 * 1024;

/// One logical unit of upstream content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// JSON text of one event, or a whole non-SSE body.
    Data(String),
    /// The `data: [DONE]` sentinel.
    Done,
}

/// Incremental event splitter. Bytes may arrive cut at any position,
/// including inside a UTF-8 sequence.
#[derive(Debug, Default)]
pub struct SseSplitter {
    buf: Vec<u8>,
    /// Bytes of `buf` already searched for a separator.
    scanned: usize,
}

impl SseSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every event completed by them.
    ///
    /// Fails once the unfinished event grows past [`MAX_EVENT_BYTES`].
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Fragment>> {
        self.buf.extend_from_slice(bytes);

        let mut out = Vec::new();
        // A separator may straddle the previous push, so back up three bytes.
        let mut from = self.scanned.saturating_sub(3);
        while let Some((at, sep_len)) = next_boundary(&self.buf[from..]) {
            let end = from + at;
            let rest = self.buf.split_off(end + sep_len);
            let mut event = std::mem::replace(&mut self.buf, rest);
            event.truncate(end);
            split_event(&String::from_utf8_lossy(&event), &mut out);
            from = 0;
        }
        self.scanned = self.buf.len();

        if self.buf.len() > MAX_EVENT_BYTES {
            return Err(GatewayError::http(format!(
                "upstream event exceeds {MAX_EVENT_BYTES} bytes"
            )));
        }
        Ok(out)
    }

    /// Bytes held for the event still in progress.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Flush whatever is left once the body has ended.
    pub fn finish(&mut self) -> Vec<Fragment> {
        let mut out = Vec::new();
        if !self.buf.is_empty() {
            let event = std::mem::take(&mut self.buf);
            self.scanned = 0;
            split_event(&String::from_utf8_lossy(&event), &mut out);
        }
        out
    }
}

/// Earliest blank-line separator as `(position, length)`.
fn next_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = find(buf, b"\r\n\r\n").map(|p| (p, 4));
    let lf = find(buf, b"\n\n").map(|p| (p, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn split_event(event: &str, out: &mut Vec<Fragment>) {
    let lines: Vec<&str> = event
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    if lines.is_empty() {
        return;
    }

    let mut had_data = false;
    for line in &lines {
        if let Some(payload) = line.strip_prefix("data:") {
            had_data = true;
            let payload = payload.trim();
            if payload == "[DONE]" {
                out.push(Fragment::Done);
            } else if !payload.is_empty() {
                out.push(Fragment::Data(payload.to_string()));
            }
        }
    }

    // Comments and bare `event:`/`id:`/`retry:` fields carry no content.
    if !had_data && !lines.iter().all(|l| is_sse_field(l)) {
        out.push(Fragment::Data(event.trim().to_string()));
    }
}

fn is_sse_field(line: &str) -> bool {
    line.starts_with(':')
        || line.starts_with("event:")
        || line.starts_with("id:")
        || line.starts_with("retry:")
}
