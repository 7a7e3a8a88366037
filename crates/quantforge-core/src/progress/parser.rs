//! Turns output records into progress events.
//!
//! Two record shapes are recognized:
//!
//! ```text
//! compute_imatrix: computing over 128 chunks with batch_size 512
//! [ 123/ 456]  blk.5.attn_k.weight - [ 4096,  4096,     1,     1], type = f16, ...
//! [17]6.1234
//! ```
//!
//! A total declaration sets the task total once. A bracketed record updates
//! the current position; when no declaration prefix is configured the second
//! number inside the record supplies the total instead.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use super::tokenizer::Separators;

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").expect("valid regex"))
}

/// How progress is expressed in a tool's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressShape {
    /// No progress records; every record is a log line.
    None,
    /// `[current/total]` records carry their own total.
    InlineTotal,
    /// A record starting with this prefix declares the total; `[current]...`
    /// records report position.
    DeclaredTotal(String),
}

/// Per-invocation parsing setup.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    pub label: String,
    pub separators: Separators,
    pub shape: ProgressShape,
}

impl ParserConfig {
    /// `llama-quantize`: newline records, inline totals.
    pub fn quantize(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            separators: Separators::Newline,
            shape: ProgressShape::InlineTotal,
        }
    }

    /// `llama-imatrix`: comma or newline records, declared total.
    pub fn imatrix(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            separators: Separators::NewlineOrComma,
            shape: ProgressShape::DeclaredTotal("compute_imatrix: computing over".to_string()),
        }
    }

    /// Free-form output with no progress protocol.
    pub fn log_only(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            separators: Separators::Newline,
            shape: ProgressShape::None,
        }
    }
}

/// A progress report for one running task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub label: String,
    /// Units completed so far; never decreases and never exceeds `total`.
    pub current: u64,
    pub total: u64,
    /// Increase since the previous event for this task.
    pub advance: u64,
}

/// Classified output record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    Progress(ProgressEvent),
    Log(String),
}

/// Stateful parser for a single process's records.
#[derive(Debug)]
pub struct ProgressParser {
    config: ParserConfig,
    total: Option<u64>,
    reported: Option<u64>,
}

impl ProgressParser {
    pub fn new(config: ParserConfig) -> Self {
        Self {
            config,
            total: None,
            reported: None,
        }
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// Classify one record, updating task state.
    pub fn parse(&mut self, record: &str) -> TrackerEvent {
        let record = record.trim();

        if let ProgressShape::DeclaredTotal(prefix) = &self.config.shape {
            if record.starts_with(prefix.as_str()) {
                if self.total.is_none() {
                    self.total = first_number(&record[prefix.len()..]);
                }
                return TrackerEvent::Log(record.to_string());
            }
        }

        if self.config.shape == ProgressShape::None || !record.starts_with('[') {
            return TrackerEvent::Log(record.to_string());
        }

        let mut numbers = number_re()
            .find_iter(record)
            .filter_map(|m| m.as_str().parse::<u64>().ok());
        let Some(current) = numbers.next() else {
            return TrackerEvent::Log(record.to_string());
        };

        if self.config.shape == ProgressShape::InlineTotal && self.total.is_none() {
            self.total = numbers.next();
        }

        let Some(total) = self.total else {
            return TrackerEvent::Log(record.to_string());
        };

        let previous = self.reported.unwrap_or(0);
        let current = current.min(total).max(previous);
        self.reported = Some(current);

        TrackerEvent::Progress(ProgressEvent {
            label: self.config.label.clone(),
            current,
            total,
            advance: current - previous,
        })
    }
}

fn first_number(text: &str) -> Option<u64> {
    number_re()
        .find(text)
        .and_then(|m| m.as_str().parse::<u64>().ok())
}
