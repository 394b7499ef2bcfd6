//! FIFO buffer of pending stage commands.
//!
//! Loaded wholesale from a command-sequence file; lines come back out in
//! exactly the order they went in. The queue does not interpret command
//! text beyond the blank-line/comment filter.

use std::collections::VecDeque;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("command source '{path}' could not be opened: {source}")]
    SourceNotFound {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("motion queue is empty")]
    QueueEmpty,
}

/// A comment line's first non-whitespace character is `;`.
pub fn is_dispatchable(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty() && !trimmed.starts_with(';')
}

#[derive(Debug, Default)]
pub struct MotionQueue {
    entries: VecDeque<String>,
    source: Option<String>,
}

impl MotionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the queue contents with the dispatchable lines of a command
    /// file, preserving file order.
    pub async fn load_file(&mut self, path: impl AsRef<Path>) -> Result<usize, QueueError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| QueueError::SourceNotFound {
                path: path.display().to_string(),
                source,
            })?;
        self.load_lines(text.lines(), path.display().to_string());
        tracing::info!(
            "loaded {} commands from {}",
            self.entries.len(),
            path.display()
        );
        Ok(self.entries.len())
    }

    /// Replace the queue contents from any line iterator. Used by recovery
    /// to enqueue the tail of a source after the checkpointed line.
    pub fn load_lines<'a>(&mut self, lines: impl Iterator<Item = &'a str>, source: String) {
        self.entries = lines
            .filter(|line| is_dispatchable(line))
            .map(|line| line.trim().to_string())
            .collect();
        self.source = Some(source);
    }

    pub fn dequeue(&mut self) -> Result<String, QueueError> {
        self.entries.pop_front().ok_or(QueueError::QueueEmpty)
    }

    /// Next entry without removing it.
    pub fn peek(&self) -> Option<&str> {
        self.entries.front().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all pending entries. Irreversible; used by cancellation.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Identifier of the source the queue was last loaded from.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }
}
