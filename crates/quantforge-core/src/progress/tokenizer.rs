//! Incremental record tokenizer for subprocess output.
//!
//! `llama-imatrix` separates its per-chunk perplexity reports with commas and
//! only ends the line after the whole pass, so waiting for `\n` would stall
//! progress until the end. The tokenizer therefore splits on a configurable
//! separator set and hands out records as soon as their terminator arrives.

/// Which bytes terminate a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Separators {
    #[default]
    Newline,
    NewlineOrComma,
}

impl Separators {
    fn is_separator(self, byte: u8) -> bool {
        match self {
            Separators::Newline => byte == b'\n',
            Separators::NewlineOrComma => byte == b'\n' || byte == b',',
        }
    }
}

/// Splits a byte stream into trimmed, non-empty text records.
#[derive(Debug, Default)]
pub struct RecordTokenizer {
    separators: Separators,
    pending: Vec<u8>,
}

impl RecordTokenizer {
    pub fn new(separators: Separators) -> Self {
        Self {
            separators,
            pending: Vec::new(),
        }
    }

    /// Feed a chunk; returns every record completed by it.
    ///
    /// Bytes after the last separator are kept until the next chunk or
    /// [`finish`](Self::finish).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut records = Vec::new();
        for &byte in chunk {
            if self.separators.is_separator(byte) {
                if let Some(record) = self.take_pending() {
                    records.push(record);
                }
            } else {
                self.pending.push(byte);
            }
        }
        records
    }

    /// Flush a trailing record that had no terminator.
    pub fn finish(&mut self) -> Option<String> {
        self.take_pending()
    }

    fn take_pending(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&raw);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

/// Tokenize a complete buffer in one go.
pub fn tokenize(raw: &[u8], separators: Separators) -> Vec<String> {
    let mut tokenizer = RecordTokenizer::new(separators);
    let mut records = tokenizer.push(raw);
    records.extend(tokenizer.finish());
    records
}
