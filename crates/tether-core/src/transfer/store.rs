//! Task list persistence.
//!
//! The whole list is written as one JSON document, atomically: a temporary
//! file is written and synced, then renamed over the previous one.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};

use super::TransferTask;

/// File name of the persisted task list.
pub const TASKS_FILE: &str = "transfers.json";

const STORE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct StoredTasks {
    version: u32,
    tasks: Vec<TransferTask>,
}

/// Reads and writes the task list under a directory.
#[derive(Debug, Clone)]
pub struct TaskStore {
    path: PathBuf,
}

impl TaskStore {
    /// Store inside `dir`. The directory is created on first save.
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(TASKS_FILE),
        }
    }

    /// Path of the task file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the stored list with `tasks`.
    ///
    /// # Errors
    ///
    /// Returns an error if the list cannot be serialized or written.
    pub async fn save(&self, tasks: &[TransferTask]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(&StoredTasks {
            version: STORE_VERSION,
            tasks: tasks.to_vec(),
        })
        .map_err(|e| Error::Serialization(format!("Failed to serialize task list: {e}")))?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &self.path).await?;

        tracing::debug!(
            path = %self.path.display(),
            count = tasks.len(),
            "Saved task list"
        );
        Ok(())
    }

    /// Load the stored list; a missing file is an empty list.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load(&self) -> Result<Vec<TransferTask>> {
        let contents = match fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let stored: StoredTasks = serde_json::from_slice(&contents)
            .map_err(|e| Error::Serialization(format!("Failed to parse task list: {e}")))?;

        if stored.version != STORE_VERSION {
            return Err(Error::Serialization(format!(
                "unsupported task list version {}",
                stored.version
            )));
        }

        tracing::debug!(
            path = %self.path.display(),
            count = stored.tasks.len(),
            "Loaded task list"
        );
        Ok(stored.tasks)
    }
}
