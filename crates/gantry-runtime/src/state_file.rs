//! Running-plugins state file.
//!
//! The daemon persists exactly one thing: the list of plugin names that
//! were running at shutdown, one per line, so the plugin manager can
//! restart them after boot. Writes go through a temp file and an atomic
//! rename.

use gantry_types::DaemonError;
use parking_lot::Mutex;
use std::path::PathBuf;
use tracing::{debug, info};

/// In-memory registry of running plugin names, backed by a plain-text
/// file.
pub struct PluginRegistry {
    path: PathBuf,
    names: Mutex<Vec<String>>,
}

impl PluginRegistry {
    /// Creates an empty registry backed by `path`.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            names: Mutex::new(Vec::new()),
        }
    }

    /// Loads the persisted list. A missing file is an empty list.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::FileError`] on any other I/O failure.
    pub async fn load(&self) -> Result<(), DaemonError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no plugin state file");
                return Ok(());
            }
            Err(err) => {
                return Err(DaemonError::FileError(format!(
                    "{}: {err}",
                    self.path.display()
                )))
            }
        };

        let names: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect();
        info!(count = names.len(), "loaded running-plugins list");
        *self.names.lock() = names;
        Ok(())
    }

    /// Persists the current list via temp file + rename.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::FileError`] on I/O failure.
    pub async fn save(&self) -> Result<(), DaemonError> {
        let mut text = self.names.lock().join("\n");
        if !text.is_empty() {
            text.push('\n');
        }

        let tmp = self.path.with_extension("tmp");
        let io_err =
            |err: std::io::Error| DaemonError::FileError(format!("{}: {err}", self.path.display()));
        tokio::fs::write(&tmp, text).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        debug!(path = %self.path.display(), "plugin state saved");
        Ok(())
    }

    /// Records a plugin as running.
    pub fn mark_started(&self, name: &str) {
        let mut names = self.names.lock();
        if !names.iter().any(|n| n == name) {
            names.push(name.to_owned());
        }
    }

    /// Records a plugin as stopped.
    pub fn mark_stopped(&self, name: &str) {
        self.names.lock().retain(|n| n != name);
    }

    /// Names currently recorded as running.
    #[must_use]
    pub fn running(&self) -> Vec<String> {
        self.names.lock().clone()
    }
}
