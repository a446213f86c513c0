//! Supervised chunked uploads and downloads.
//!
//! [`TransferManager`] owns every [`TransferTask`]. Other components hold a
//! task id and read state back through the manager or its streams.
//!
//! ## Lifecycle
//!
//! ```text
//! Pending ──slot free──▶ InProgress ──last chunk acked──▶ Completed
//!    │                       │ └──chunk error / timeout──▶ Failed ──retry──▶ Pending
//!    │                       └──pause──▶ Paused ──resume──▶ Pending
//!    └──cancel (from any non-terminal state)──▶ Cancelled
//! ```
//!
//! Workers run at most `max_concurrent` at a time and pick pending tasks in
//! creation order. Each chunk is acknowledged before the next is sent, and
//! `transferred_bytes` only moves when an acknowledgment arrives. Cancel
//! and pause are cooperative: the worker notices between chunks.

pub mod store;
mod worker;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::TransferConfig;
use crate::dispatch::ActiveDispatcher;
use crate::error::{Error, FailureReason, Result};

pub use store::TaskStore;

use worker::Job;

/// Which way the bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// Local file to host
    Upload,
    /// Host file to local
    Download,
}

/// State of a transfer task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum TransferState {
    /// Waiting for a worker slot
    Pending,
    /// A worker is moving chunks
    InProgress,
    /// Stopped by the user; keeps its progress
    Paused,
    /// Every byte acknowledged
    Completed,
    /// Stopped by an error
    Failed(FailureReason),
    /// Stopped by the user; partial files are left in place
    Cancelled,
}

impl TransferState {
    /// Pending or in progress.
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    /// Completed, failed or cancelled.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Cancelled)
    }

    /// Short lowercase name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One upload or download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTask {
    /// Unique id, generated at creation
    pub id: Uuid,
    /// Upload or download
    pub direction: TransferDirection,
    /// Path on the host
    pub remote_path: String,
    /// Path on this device
    pub local_path: PathBuf,
    /// Display name
    pub file_name: String,
    /// Size of the file; 0 until known for downloads
    pub total_bytes: u64,
    /// Bytes acknowledged so far
    pub transferred_bytes: u64,
    /// Current state
    pub state: TransferState,
    /// When the task was created
    pub created_at: DateTime<Utc>,
}

impl TransferTask {
    /// Create a pending task with a fresh id.
    pub fn new(
        direction: TransferDirection,
        remote_path: String,
        local_path: PathBuf,
        total_bytes: u64,
    ) -> Self {
        let file_name = match direction {
            TransferDirection::Download => remote_file_name(&remote_path),
            TransferDirection::Upload => local_path.file_name().map_or_else(
                || remote_file_name(&remote_path),
                |name| name.to_string_lossy().into_owned(),
            ),
        };

        Self {
            id: Uuid::new_v4(),
            direction,
            remote_path,
            local_path,
            file_name,
            total_bytes,
            transferred_bytes: 0,
            state: TransferState::Pending,
            created_at: Utc::now(),
        }
    }

    /// Progress as a whole percentage in `0..=100`.
    ///
    /// An empty file reads 100 once completed and 0 before.
    pub fn progress_percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return if self.state == TransferState::Completed {
                100
            } else {
                0
            };
        }
        let percent =
            (u128::from(self.transferred_bytes) * 100 / u128::from(self.total_bytes)).min(100);
        u8::try_from(percent).unwrap_or(100)
    }

    /// Pending or in progress.
    pub const fn is_active(&self) -> bool {
        self.state.is_active()
    }
}

/// Last component of a host path; hosts may use either separator.
fn remote_file_name(path: &str) -> String {
    let trimmed = path.trim_end_matches(['/', '\\']);
    trimmed
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(trimmed)
        .to_string()
}

struct Running {
    run: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct Book {
    tasks: Vec<TransferTask>,
    queue: VecDeque<Uuid>,
    running: HashMap<Uuid, Running>,
    next_run: u64,
}

impl Book {
    fn index(&self, id: Uuid) -> Result<usize> {
        self.tasks
            .iter()
            .position(|t| t.id == id)
            .ok_or(Error::TaskNotFound(id))
    }

    fn is_current(&self, job: &Job) -> bool {
        self.running.get(&job.id).is_some_and(|r| r.run == job.run)
    }

    fn current_task(&mut self, job: &Job) -> Option<&mut TransferTask> {
        if !self.is_current(job) {
            return None;
        }
        self.tasks
            .iter_mut()
            .find(|t| t.id == job.id && t.state == TransferState::InProgress)
    }

    fn stop_worker(&self, id: Uuid) {
        if let Some(running) = self.running.get(&id) {
            running.token.cancel();
        }
    }
}

struct Inner {
    link: ActiveDispatcher,
    config: TransferConfig,
    book: Mutex<Book>,
    all: watch::Sender<Vec<TransferTask>>,
    active: watch::Sender<Vec<TransferTask>>,
    store: Option<TaskStore>,
    /// Serialises writes; true once the saved list has been merged in.
    persist_lock: tokio::sync::Mutex<bool>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate the task set and publish the result to both streams.
    ///
    /// Publishing happens under the lock so snapshots never go backwards.
    fn update<R>(&self, f: impl FnOnce(&mut Book) -> R) -> R {
        let mut book = self.lock();
        let out = f(&mut book);

        let all = book.tasks.clone();
        let active = all.iter().filter(|t| t.is_active()).cloned().collect();
        self.all.send_replace(all);
        self.active.send_replace(active);
        drop(book);
        out
    }

    /// Write the latest snapshot if a store is configured.
    ///
    /// The first write merges the list saved by earlier processes, so a
    /// manager that never called `restore` does not erase their history.
    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let mut merged = self.persist_lock.lock().await;
        if !*merged {
            match store.load().await {
                Ok(saved) => {
                    self.merge_saved(saved);
                }
                Err(e) => tracing::warn!(error = %e, "Overwriting unreadable task list"),
            }
            *merged = true;
        }
        let snapshot = self.all.borrow().clone();
        if let Err(e) = store.save(&snapshot).await {
            tracing::warn!(error = %e, "Failed to persist task list");
        }
    }

    /// Add saved tasks not already known, ahead of this process's own.
    ///
    /// Tasks saved while pending or running were cut off by the process
    /// ending; they come back as failed with reason "interrupted".
    fn merge_saved(&self, saved: Vec<TransferTask>) -> usize {
        self.update(|book| {
            let mut restored: Vec<TransferTask> = saved
                .into_iter()
                .filter(|task| !book.tasks.iter().any(|t| t.id == task.id))
                .map(|mut task| {
                    if task.state.is_active() {
                        task.state = TransferState::Failed(FailureReason::interrupted());
                    }
                    task
                })
                .collect();
            let added = restored.len();
            restored.append(&mut book.tasks);
            book.tasks = restored;
            added
        })
    }

    fn set_total(&self, job: &Job, total: u64) {
        self.update(|book| {
            if let Some(task) = book.current_task(job) {
                task.total_bytes = total;
            }
        });
    }

    /// Record an acknowledged offset. Returns false once the task is no
    /// longer this worker's to run.
    fn record_progress(&self, job: &Job, transferred: u64) -> bool {
        self.update(|book| match book.current_task(job) {
            Some(task) => {
                let transferred = transferred.min(task.total_bytes);
                task.transferred_bytes = task.transferred_bytes.max(transferred);
                true
            }
            None => false,
        })
    }

    fn fail_in_progress(&self, reason: &FailureReason) -> usize {
        self.update(|book| {
            let mut failed = 0;
            for task in &mut book.tasks {
                if task.state == TransferState::InProgress {
                    task.state = TransferState::Failed(reason.clone());
                    if let Some(running) = book.running.get(&task.id) {
                        running.token.cancel();
                    }
                    failed += 1;
                }
            }
            failed
        })
    }
}

/// Start queued tasks while worker slots are free and a link is up.
fn pump(inner: &Arc<Inner>) {
    if !inner.link.is_connected() {
        return;
    }

    let jobs = inner.update(|book| {
        let mut jobs = Vec::new();
        let tasks = &book.tasks;
        book.queue.retain(|id| {
            tasks
                .iter()
                .any(|t| t.id == *id && t.state == TransferState::Pending)
        });

        while book.running.len() < inner.config.max_concurrent {
            // A task whose previous worker is still winding down waits its turn.
            let Some(pos) = book
                .queue
                .iter()
                .position(|id| !book.running.contains_key(id))
            else {
                break;
            };
            let Some(id) = book.queue.remove(pos) else {
                break;
            };
            let Some(task) = book.tasks.iter_mut().find(|t| t.id == id) else {
                continue;
            };

            task.state = TransferState::InProgress;
            book.next_run += 1;
            let token = CancellationToken::new();
            book.running.insert(
                id,
                Running {
                    run: book.next_run,
                    token: token.clone(),
                },
            );
            jobs.push(Job::new(task, book.next_run, token));
        }
        jobs
    });

    for job in jobs {
        tokio::spawn(worker::run(Arc::clone(inner), job));
    }
}

/// Apply a worker's outcome, then refill the slot it leaves.
async fn finish_run(inner: Arc<Inner>, job: &Job, result: Result<()>) {
    inner.update(|book| {
        if !book.is_current(job) {
            return;
        }
        if let Some(task) = book.current_task(job) {
            match &result {
                Ok(()) => {
                    task.transferred_bytes = task.total_bytes;
                    task.state = TransferState::Completed;
                    tracing::info!(
                        task_id = %task.id,
                        bytes = task.total_bytes,
                        "Transfer completed"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        task_id = %task.id,
                        transferred = task.transferred_bytes,
                        error = %e,
                        "Transfer failed"
                    );
                    task.state = TransferState::Failed(FailureReason::from(e));
                }
            }
        }
        book.running.remove(&job.id);
    });

    if let Err(e @ (Error::LinkLost(_) | Error::NotConnected)) = &result {
        let failed = inner.fail_in_progress(&FailureReason::from(e));
        if failed > 0 {
            tracing::warn!(failed, "Link lost, failing transfers in progress");
        }
    }

    inner.persist().await;
    pump(&inner);
}

/// Owns and runs transfer tasks.
#[derive(Clone)]
pub struct TransferManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TransferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let book = self.inner.lock();
        f.debug_struct("TransferManager")
            .field("tasks", &book.tasks.len())
            .field("queued", &book.queue.len())
            .field("running", &book.running.len())
            .finish()
    }
}

impl TransferManager {
    /// Create a manager. Tasks run only while `link` has a live dispatcher.
    pub fn new(link: ActiveDispatcher, config: TransferConfig, store: Option<TaskStore>) -> Self {
        let (all, _) = watch::channel(Vec::new());
        let (active, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(Inner {
                link,
                config,
                book: Mutex::new(Book::default()),
                all,
                active,
                store,
                persist_lock: tokio::sync::Mutex::new(false),
            }),
        }
    }

    /// Queue a download of `remote_path` into `local_path`.
    ///
    /// Returns the new task right away; it starts when a slot is free.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConnected` without a live link.
    pub async fn download_file(
        &self,
        remote_path: &str,
        local_path: impl AsRef<Path>,
    ) -> Result<TransferTask> {
        self.inner.link.current()?;
        let task = TransferTask::new(
            TransferDirection::Download,
            remote_path.to_string(),
            local_path.as_ref().to_path_buf(),
            0,
        );
        Ok(self.enqueue(task).await)
    }

    /// Queue an upload of `local_path` to `remote_path`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConnected` without a live link, or an I/O error if
    /// the local file cannot be inspected.
    pub async fn upload_file(
        &self,
        local_path: impl AsRef<Path>,
        remote_path: &str,
    ) -> Result<TransferTask> {
        self.inner.link.current()?;
        let local_path = local_path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&local_path).await?;
        if !metadata.is_file() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", local_path.display()),
            )));
        }

        let task = TransferTask::new(
            TransferDirection::Upload,
            remote_path.to_string(),
            local_path,
            metadata.len(),
        );
        Ok(self.enqueue(task).await)
    }

    async fn enqueue(&self, task: TransferTask) -> TransferTask {
        tracing::debug!(
            task_id = %task.id,
            direction = ?task.direction,
            remote = %task.remote_path,
            "Transfer queued"
        );
        let snapshot = task.clone();
        self.inner.update(|book| {
            book.queue.push_back(task.id);
            book.tasks.push(task);
        });
        self.inner.persist().await;
        pump(&self.inner);
        snapshot
    }

    /// Cancel a task.
    ///
    /// Cancelling a completed, failed or cancelled task succeeds and changes
    /// nothing. A running worker stops after its current chunk.
    ///
    /// # Errors
    ///
    /// Returns `Error::TaskNotFound` for an unknown id.
    pub async fn cancel_transfer(&self, id: Uuid) -> Result<()> {
        let changed = self.inner.update(|book| -> Result<bool> {
            let idx = book.index(id)?;
            if book.tasks[idx].state.is_terminal() {
                return Ok(false);
            }
            book.tasks[idx].state = TransferState::Cancelled;
            book.queue.retain(|q| *q != id);
            book.stop_worker(id);
            Ok(true)
        })?;

        if changed {
            tracing::info!(task_id = %id, "Transfer cancelled");
            self.inner.persist().await;
        }
        Ok(())
    }

    /// Restart a failed task from the beginning.
    ///
    /// # Errors
    ///
    /// Returns `Error::TaskNotFound` for an unknown id and
    /// `Error::InvalidTaskState` unless the task is `Failed`.
    pub async fn retry_transfer(&self, id: Uuid) -> Result<()> {
        self.inner.update(|book| -> Result<()> {
            let idx = book.index(id)?;
            let task = &mut book.tasks[idx];
            if !matches!(task.state, TransferState::Failed(_)) {
                return Err(invalid_state(task));
            }
            task.transferred_bytes = 0;
            task.state = TransferState::Pending;
            book.queue.push_back(id);
            Ok(())
        })?;

        tracing::info!(task_id = %id, "Transfer retried");
        self.inner.persist().await;
        pump(&self.inner);
        Ok(())
    }

    /// Pause a pending or running task, keeping its progress.
    ///
    /// # Errors
    ///
    /// Returns `Error::TaskNotFound` for an unknown id and
    /// `Error::InvalidTaskState` for a finished task.
    pub async fn pause_transfer(&self, id: Uuid) -> Result<()> {
        let changed = self.inner.update(|book| -> Result<bool> {
            let idx = book.index(id)?;
            match &book.tasks[idx].state {
                TransferState::Paused => return Ok(false),
                TransferState::Pending | TransferState::InProgress => {}
                _ => return Err(invalid_state(&book.tasks[idx])),
            }
            book.tasks[idx].state = TransferState::Paused;
            book.queue.retain(|q| *q != id);
            book.stop_worker(id);
            Ok(true)
        })?;

        if changed {
            tracing::info!(task_id = %id, "Transfer paused");
            self.inner.persist().await;
        }
        Ok(())
    }

    /// Re-queue a paused task at the tail; it continues where it stopped.
    ///
    /// # Errors
    ///
    /// Returns `Error::TaskNotFound` for an unknown id and
    /// `Error::InvalidTaskState` for a finished task.
    pub async fn resume_transfer(&self, id: Uuid) -> Result<()> {
        let changed = self.inner.update(|book| -> Result<bool> {
            let idx = book.index(id)?;
            match &book.tasks[idx].state {
                TransferState::Paused => {}
                TransferState::Pending | TransferState::InProgress => return Ok(false),
                _ => return Err(invalid_state(&book.tasks[idx])),
            }
            book.tasks[idx].state = TransferState::Pending;
            book.queue.push_back(id);
            Ok(true)
        })?;

        if changed {
            tracing::info!(task_id = %id, "Transfer resumed");
            self.inner.persist().await;
            pump(&self.inner);
        }
        Ok(())
    }

    /// Remove every completed, failed and cancelled task.
    ///
    /// Returns how many were removed.
    pub async fn clear_history(&self) -> usize {
        let removed = self.inner.update(|book| {
            let before = book.tasks.len();
            book.tasks.retain(|t| !t.state.is_terminal());
            before - book.tasks.len()
        });
        if removed > 0 {
            tracing::debug!(removed, "Cleared transfer history");
            self.inner.persist().await;
        }
        removed
    }

    /// Fail every running task with `reason`, as when the link drops.
    ///
    /// Returns how many tasks were failed.
    pub async fn fail_active(&self, reason: &FailureReason) -> usize {
        let failed = self.inner.fail_in_progress(reason);
        if failed > 0 {
            tracing::warn!(failed, %reason, "Failing transfers in progress");
            self.inner.persist().await;
        }
        failed
    }

    /// Start pending tasks; called when a link comes up.
    pub fn start_pending(&self) {
        pump(&self.inner);
    }

    /// Load tasks saved by an earlier process.
    ///
    /// Tasks that were pending or running are restored as failed with reason
    /// "interrupted" so the user can retry them; paused tasks stay paused.
    /// Returns how many tasks were added; the saved list is only read once,
    /// either here or before the first write.
    ///
    /// # Errors
    ///
    /// Returns an error if the store exists but cannot be read.
    pub async fn restore(&self) -> Result<usize> {
        let Some(store) = &self.inner.store else {
            return Ok(0);
        };

        let added = {
            let mut merged = self.inner.persist_lock.lock().await;
            if *merged {
                0
            } else {
                let saved = store.load().await?;
                *merged = true;
                self.inner.merge_saved(saved)
            }
        };

        if added > 0 {
            tracing::info!(added, "Restored transfer tasks");
            self.inner.persist().await;
        }
        Ok(added)
    }

    /// Write the current task list to the store and wait for it.
    ///
    /// Call before exiting: a finished worker's own write may not have run.
    pub async fn flush(&self) {
        self.inner.persist().await;
    }

    /// Snapshot of one task.
    pub fn task(&self, id: Uuid) -> Option<TransferTask> {
        self.inner.all.borrow().iter().find(|t| t.id == id).cloned()
    }

    /// Snapshot of every task, in creation order.
    pub fn tasks(&self) -> Vec<TransferTask> {
        self.inner.all.borrow().clone()
    }

    /// Snapshot of pending and running tasks.
    pub fn active_tasks(&self) -> Vec<TransferTask> {
        self.inner.active.borrow().clone()
    }

    /// Live stream of every task.
    pub fn subscribe_tasks(&self) -> watch::Receiver<Vec<TransferTask>> {
        self.inner.all.subscribe()
    }

    /// Live stream of pending and running tasks.
    pub fn subscribe_active(&self) -> watch::Receiver<Vec<TransferTask>> {
        self.inner.active.subscribe()
    }

    /// Wait until a task is no longer pending or running.
    ///
    /// # Errors
    ///
    /// Returns `Error::TaskNotFound` if the task is unknown or removed.
    pub async fn wait_until_settled(&self, id: Uuid) -> Result<TransferTask> {
        let mut rx = self.inner.all.subscribe();
        let tasks = rx
            .wait_for(|tasks| {
                tasks
                    .iter()
                    .find(|t| t.id == id)
                    .is_none_or(|t| !t.is_active())
            })
            .await
            .map_err(|_| Error::Internal("transfer manager dropped".to_string()))?;
        tasks
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or(Error::TaskNotFound(id))
    }
}

fn invalid_state(task: &TransferTask) -> Error {
    Error::InvalidTaskState {
        id: task.id,
        state: task.state.name().to_string(),
    }
}
