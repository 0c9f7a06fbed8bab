//! Chunk types: the unit of dispatch to a worker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How many error records a chunk keeps
pub const ERROR_HISTORY_LIMIT: usize = 10;

/// Chunk status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// Never dispatched
    Pending,
    /// Waiting in the queue after a retry or manual requeue
    Queued,
    /// Dispatched to a worker
    Processing,
    Completed,
    Failed,
}

impl ChunkStatus {
    /// Completed and failed chunks never leave their state on their own
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Per-line result status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LineStatus {
    #[default]
    Pending,
    Translated,
    Failed,
}

impl LineStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Translated | Self::Failed)
    }
}

/// A non-blank source line with its position in the original document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceLine {
    /// Zero-based line index in the original text, blank lines included
    pub line_index: usize,
    pub text: String,
}

/// Result for one line of a chunk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineResult {
    /// Original line index this result belongs to
    pub line_index: usize,
    /// Output text, absent until translated
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub status: LineStatus,
}

impl LineResult {
    /// A successfully translated line
    pub fn translated(line_index: usize, text: impl Into<String>) -> Self {
        Self {
            line_index,
            text: Some(text.into()),
            status: LineStatus::Translated,
        }
    }

    /// A line the worker gave up on
    pub fn failed(line_index: usize) -> Self {
        Self {
            line_index,
            text: None,
            status: LineStatus::Failed,
        }
    }

    /// A line not yet produced
    pub fn pending(line_index: usize) -> Self {
        Self {
            line_index,
            text: None,
            status: LineStatus::Pending,
        }
    }
}

/// One entry of a chunk's error history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorRecord {
    pub attempt: u32,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// A contiguous slice of a document's lines
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    /// Position of the chunk in the document
    pub index: u32,
    pub status: ChunkStatus,
    /// Source span produced by the chunker
    pub source: Vec<SourceLine>,
    pub lines_processed: usize,
    pub total_lines: usize,
    /// Per-line results, in source order
    pub lines: Vec<LineResult>,
    pub retries: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Dispatch counter; results carrying an older attempt are discarded
    pub attempt: u32,
    pub error: Option<String>,
    pub error_details: Option<String>,
    pub error_history: Vec<ErrorRecord>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Degraded processing was used for this chunk
    pub fallback_mode: bool,
}

impl Chunk {
    /// Create a pending chunk over a source span
    pub fn new(index: u32, source: Vec<SourceLine>, max_retries: u32) -> Self {
        let total_lines = source.len();
        Self {
            index,
            status: ChunkStatus::Pending,
            source,
            lines_processed: 0,
            total_lines,
            lines: Vec::new(),
            retries: 0,
            max_retries,
            next_retry_at: None,
            attempt: 0,
            error: None,
            error_details: None,
            error_history: Vec::new(),
            started_at: None,
            completed_at: None,
            fallback_mode: false,
        }
    }

    /// Whether a dispatch may start at `now`
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.next_retry_at {
            Some(at) => at <= now,
            None => true,
        }
    }

    /// Record a diagnostic error, keeping the history bounded
    pub fn record_error(&mut self, message: String, details: Option<String>, at: DateTime<Utc>) {
        self.error_history.push(ErrorRecord {
            attempt: self.attempt,
            message: message.clone(),
            at,
        });
        if self.error_history.len() > ERROR_HISTORY_LIMIT {
            let excess = self.error_history.len() - ERROR_HISTORY_LIMIT;
            self.error_history.drain(..excess);
        }
        self.error = Some(message);
        self.error_details = details;
    }

    /// Drop accumulated line output
    pub fn clear_lines(&mut self) {
        self.lines.clear();
        self.lines_processed = 0;
        self.fallback_mode = false;
    }

    /// Number of lines whose status is terminal
    pub fn terminal_line_count(&self) -> usize {
        self.lines.iter().filter(|l| l.status.is_terminal()).count()
    }
}
