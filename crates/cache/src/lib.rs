// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Serialize;
use thiserror::Error;

/// Error type for store-related operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to determine a state directory for this platform")]
    NoStateDir,
}

/// Returns the platform state directory for neuron, e.g.
/// `~/.local/share/neuron` on Linux.
///
/// Used for default locations of durable files (the process registry) when
/// configuration does not name an explicit path.
pub fn state_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("", "", "neuron").ok_or(StoreError::NoStateDir)?;
    Ok(dirs.data_dir().to_path_buf())
}

/// JSON document persisted at a single path.
///
/// The store is synchronous and small on purpose: callers own the in-memory
/// state and the locking around it, and call [`JsonStore::save`] after every
/// mutation. Saves are atomic with respect to readers and crashes:
///
/// - serialise to a string,
/// - write it to `<path>.tmp` next to the target and fsync it,
/// - rename the temporary file over the target.
///
/// A reader therefore observes either the previous document or the new one,
/// never a partial write.
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    /// Store backed by an explicit file path. Parent directories are created.
    pub fn at<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create store directory {}", parent.display())
                })?;
            }
        }
        Ok(JsonStore { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw document text, or `None` when the file is absent or blank.
    fn read_text(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let mut file = fs::File::open(&self.path)
            .with_context(|| format!("failed to open store file {}", self.path.display()))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)
            .with_context(|| format!("failed to read store file {}", self.path.display()))?;

        if buf.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(buf))
    }

    /// Load the document as untyped JSON.
    ///
    /// Callers that must tolerate partially corrupt documents (one bad entry
    /// in an otherwise valid map) decode the pieces themselves from this.
    pub fn load_value(&self) -> Result<Option<serde_json::Value>> {
        let Some(text) = self.read_text()? else {
            return Ok(None);
        };
        let value = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse JSON from {}", self.path.display()))?;
        Ok(Some(value))
    }

    /// Persist `value` as pretty-printed JSON using write-then-rename.
    pub fn save<T>(&self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        let json = serde_json::to_string_pretty(value)
            .with_context(|| "failed to serialise value to JSON for store")?;

        let tmp_path = self.path.with_extension("json.tmp");

        {
            let mut file = fs::File::create(&tmp_path).with_context(|| {
                format!("failed to create temporary store file {}", tmp_path.display())
            })?;
            file.write_all(json.as_bytes()).with_context(|| {
                format!("failed to write temporary store file {}", tmp_path.display())
            })?;
            file.sync_all().with_context(|| {
                format!("failed to sync temporary store file {}", tmp_path.display())
            })?;
        }

        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "failed to rename temporary store file {} to {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;

        Ok(())
    }
}
