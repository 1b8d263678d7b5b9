//! Buffered output files shared by every client a factory creates.
//!
//! Consumers write one line per received message and publishers and
//! consumers both write statistics lines. Writers are opened lazily on first
//! use (truncating any previous run) and stay buffered until
//! [`OutputSinks::flush_all`] is called, which the shutdown hook does as
//! its last step.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Default)]
pub struct OutputSinks {
    writers: Mutex<HashMap<PathBuf, BufWriter<File>>>,
}

impl OutputSinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one line to the sink at `path`, opening it on first use
    pub fn write_line(&self, path: &Path, line: &str) -> Result<()> {
        let mut writers = self.writers.lock();
        if !writers.contains_key(path) {
            let writer = Self::open(path)?;
            writers.insert(path.to_path_buf(), writer);
        }
        if let Some(writer) = writers.get_mut(path) {
            writeln!(writer, "{}", line)
                .with_context(|| format!("Failed to write to {}", path.display()))?;
        }
        Ok(())
    }

    /// Flush every open sink
    ///
    /// All sinks are attempted even if one fails; the first failure is
    /// returned.
    pub fn flush_all(&self) -> Result<()> {
        let mut writers = self.writers.lock();
        let mut first_error = None;
        for (path, writer) in writers.iter_mut() {
            if let Err(e) = writer.flush() {
                let err = anyhow::Error::new(e)
                    .context(format!("Failed to flush {}", path.display()));
                first_error.get_or_insert(err);
            }
        }
        debug!("Flushed {} output sink(s)", writers.len());
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Paths of the sinks opened so far
    pub fn open_paths(&self) -> Vec<PathBuf> {
        self.writers.lock().keys().cloned().collect()
    }

    fn open(path: &Path) -> Result<BufWriter<File>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory {}", parent.display())
                })?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to open output sink {}", path.display()))?;
        debug!("Opened output sink {}", path.display());
        Ok(BufWriter::new(file))
    }
}
