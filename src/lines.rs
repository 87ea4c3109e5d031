use anyhow::{anyhow, Result};

/// The longest line the buffer will hold while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Splits a byte stream into `\n` terminated lines.
///
/// Bytes that were already searched for a newline are not searched again when more
/// data arrives, and a line that grows past the configured limit is an error.
pub struct LineBuffer {
    buffer: Vec<u8>,

    // start of the first line that hasn't been handed out
    start: usize,

    // everything before this index is known to contain no newline
    scanned: usize,

    max_line: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        LineBuffer::with_max_line(MAX_LINE_BYTES)
    }

    pub fn with_max_line(max_line: usize) -> Self {
        LineBuffer {
            buffer: Vec::new(),
            start: 0,
            scanned: 0,
            max_line,
        }
    }

    /// Add bytes to the buffer
    pub fn extend(&mut self, bytes: &[u8]) {
        if self.start > 0 {
            self.buffer.drain(..self.start);
            self.scanned -= self.start;
            self.start = 0;
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// Returns the next complete line, including its newline, or None if no complete
    /// line is buffered yet.
    pub fn next_line(&mut self) -> Result<Option<&[u8]>> {
        let from = self.scanned.max(self.start);
        match self.buffer[from..].iter().position(|&b| b == b'\n') {
            Some(offset) => {
                let end = from + offset + 1;
                let line_start = self.start;
                self.start = end;
                self.scanned = end;
                Ok(Some(&self.buffer[line_start..end]))
            }
            None => {
                self.scanned = self.buffer.len();
                let pending = self.buffer.len() - self.start;
                if pending > self.max_line {
                    return Err(anyhow!(
                        "stream line exceeded {} bytes without a newline",
                        self.max_line
                    ));
                }
                Ok(None)
            }
        }
    }

    /// Whatever is left after the last newline.
    pub fn remainder(&self) -> &[u8] {
        &self.buffer[self.start..]
    }
}
