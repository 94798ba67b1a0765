//! The user-visible output channel.
//!
//! A [`LogSink`] is an append-only list of lines shared by every component
//! that reports on the worker. Clones share the same list. Each line is also
//! emitted as a `tracing` event under [`OUTPUT_TARGET`], so whatever log
//! subscriber the host installs carries the channel too.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// `tracing` target for mirrored channel lines.
pub const OUTPUT_TARGET: &str = "pineapple::output";

/// Prefix for lines forwarded from the worker's stderr.
pub const ERROR_PREFIX: &str = "ERROR: ";

#[derive(Debug, Clone)]
pub struct LogSink {
    name: Arc<str>,
    lines: Arc<Mutex<Vec<String>>>,
}

impl LogSink {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            lines: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Channel name shown to the user.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn append_line(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::info!(target: OUTPUT_TARGET, channel = %self.name, "{line}");
        self.lock().push(line);
    }

    /// Append a chunk of worker stderr as an error line.
    pub fn append_error(&self, chunk: &str) {
        self.append_line(format!("{ERROR_PREFIX}{}", trim_line_ending(chunk)));
    }

    /// Copy of every line appended so far, oldest first.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // Appends never leave the list half-written, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn trim_line_ending(chunk: &str) -> &str {
    let chunk = chunk.strip_suffix('\n').unwrap_or(chunk);
    chunk.strip_suffix('\r').unwrap_or(chunk)
}
