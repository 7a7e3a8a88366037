//! Streaming progress tracking for engine subprocesses.
//!
//! Output flows through three stages: a [`RecordTokenizer`] cuts raw bytes
//! into records, a [`ProgressParser`] classifies each record, and a
//! [`ProgressReporter`] presents the resulting events.

mod parser;
mod process;
mod reporter;
mod tokenizer;

pub use parser::{ParserConfig, ProgressEvent, ProgressParser, ProgressShape, TrackerEvent};
pub use process::TrackedProcess;
pub use reporter::{ProgressReporter, TracingReporter};
pub use tokenizer::{tokenize, RecordTokenizer, Separators};
