use bytes::{Buf, BytesMut};
use tracing::debug;

/// Prefix carried by server-sent event payload lines
pub const DATA_PREFIX: &str = "data: ";

/// Splits streamed bytes into lines
///
/// Fragments may cut a line (or a multi-byte character) anywhere; incomplete
/// data is held until the next `feed`. Blank lines are skipped and a trailing
/// `\r` is removed. With a prefix configured, only lines carrying it are
/// returned, with the prefix stripped.
#[derive(Debug)]
pub struct LineFramer {
    buffer: BytesMut,
    prefix: Option<String>,
}

impl LineFramer {
    /// Framer for `data: `-prefixed event streams
    pub fn new() -> Self {
        Self::with_prefix(DATA_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            prefix: Some(prefix.into()),
        }
    }

    /// Framer that returns every non-blank line unchanged
    pub fn plain() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            prefix: None,
        }
    }

    /// Feed a fragment and take every line it completed
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw = self.buffer.split_to(pos);
            self.buffer.advance(1);
            if let Some(line) = self.accept(&raw) {
                lines.push(line);
            }
        }
        lines
    }

    /// Flush a final line that was not newline-terminated
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let raw = self.buffer.split();
        self.accept(&raw)
    }

    pub fn has_incomplete(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    fn accept(&self, raw: &[u8]) -> Option<String> {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        if raw.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(raw);

        match &self.prefix {
            None => Some(line.into_owned()),
            Some(prefix) => match line.strip_prefix(prefix.as_str()) {
                Some(payload) => Some(payload.to_string()),
                None => {
                    debug!(line = %line, "skipping line without payload prefix");
                    None
                }
            },
        }
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}
