//! Chunk assembly for streamed output.
//!
//! Process output arrives in arbitrary byte chunks. [`ChunkAssembler`] turns
//! them into text that never splits a line (complete-lines mode) or never
//! splits a UTF-8 sequence (raw mode), carrying the remainder over to the
//! next chunk.

/// Assembles byte chunks into deliverable text.
#[derive(Debug, Default, Clone)]
pub struct ChunkAssembler {
    complete_lines: bool,
    carry: Vec<u8>,
}

impl ChunkAssembler {
    /// Creates an assembler.
    ///
    /// With `complete_lines`, only text up to and including the last line
    /// terminator is surfaced; the rest waits for the next chunk.
    pub fn new(complete_lines: bool) -> Self {
        Self {
            complete_lines,
            carry: Vec::new(),
        }
    }

    /// Adds a chunk, returning the text that is ready for delivery.
    pub fn push(&mut self, chunk: &[u8]) -> Option<String> {
        self.carry.extend_from_slice(chunk);
        let ready = if self.complete_lines {
            self.carry.iter().rposition(|&b| b == b'\n')? + 1
        } else {
            self.carry.len() - incomplete_utf8_suffix(&self.carry)
        };
        if ready == 0 {
            return None;
        }
        let rest = self.carry.split_off(ready);
        let complete = std::mem::replace(&mut self.carry, rest);
        Some(String::from_utf8_lossy(&complete).into_owned())
    }

    /// Returns whatever is still buffered (the trailing partial line).
    pub fn flush(&mut self) -> Option<String> {
        if self.carry.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.carry);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }

    /// Drops the buffered remainder.
    pub fn discard(&mut self) -> usize {
        let len = self.carry.len();
        self.carry.clear();
        len
    }

    /// Returns the number of buffered bytes.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }
}

/// Length of a trailing UTF-8 sequence that is still missing bytes.
fn incomplete_utf8_suffix(buf: &[u8]) -> usize {
    for back in 1..=buf.len().min(3) {
        let byte = buf[buf.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            b if b >= 0xF0 => 4,
            b if b >= 0xE0 => 3,
            b if b >= 0xC0 => 2,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}
