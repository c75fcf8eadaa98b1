//! Crash-safe ledger of build tasks.
//!
//! Every build gets a task record carrying its status, log location, and,
//! while the container runs, an abort handle. The ledger is persisted as
//! JSON; on save it is compacted to the newest 30 records and the
//! survivors are renumbered, so task ids are not durable across restarts.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::builder::ContainerHandle;
use crate::persist;

const KEPT_TASKS: usize = 30;

/// Lifecycle state of one build task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Running,
    Succeeded,
    Failed,
    Aborted,
    Warning,
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Running
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TaskStatus::Running => "Running...",
            TaskStatus::Succeeded => "Succeeded",
            TaskStatus::Failed => "Failed",
            TaskStatus::Aborted => "Aborted",
            TaskStatus::Warning => "Warning",
        };
        f.write_str(text)
    }
}

/// One build task record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunningTask {
    pub id: usize,
    #[serde(default)]
    pub log_name: String,
    #[serde(default)]
    pub log_file_path: PathBuf,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub error_text: String,

    #[serde(skip)]
    pub container_id: Option<String>,
    #[serde(skip)]
    kill: Option<ContainerHandle>,
}

impl RunningTask {
    /// A task is active until it reaches a terminal status.
    pub fn is_active(&self) -> bool {
        self.status == TaskStatus::Running
    }

    /// A task can be aborted once it has received its container handle.
    pub fn is_killable(&self) -> bool {
        self.kill.is_some()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Ledger {
    next: usize,
    tasks: Vec<RunningTask>,
}

impl Ledger {
    fn get_mut(&mut self, id: usize) -> Option<&mut RunningTask> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }
}

/// The persistent task ledger.
#[derive(Debug)]
pub struct RunningTasks {
    inner: Mutex<Ledger>,
    file_path: PathBuf,
}

impl RunningTasks {
    /// Load the ledger from `path`, starting empty if absent.
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        let ledger: Ledger = persist::load_or_default(path)?;
        Ok(Self {
            inner: Mutex::new(ledger),
            file_path: path.to_path_buf(),
        })
    }

    /// Allocate a new task record with the next id.
    pub fn create_task(&self) -> RunningTask {
        let mut inner = self.inner.lock().unwrap();

        let task = RunningTask {
            id: inner.next,
            ..Default::default()
        };
        inner.next += 1;
        inner.tasks.push(task.clone());

        task
    }

    /// Fetch a task record by id.
    pub fn get(&self, id: usize) -> Option<RunningTask> {
        self.inner.lock().unwrap().get_mut(id).map(|task| task.clone())
    }

    /// The newest records, capped at the retention limit, newest first.
    pub fn display_tasks(&self) -> Vec<RunningTask> {
        let inner = self.inner.lock().unwrap();
        inner
            .tasks
            .iter()
            .rev()
            .take(KEPT_TASKS)
            .cloned()
            .collect()
    }

    /// Record the log destination of a task.
    pub fn set_log(&self, id: usize, log_name: &str, log_file_path: &Path) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = inner.get_mut(id) {
            task.log_name = log_name.to_owned();
            task.log_file_path = log_file_path.to_path_buf();
        }
    }

    /// Attach the container abort handle, making the task killable.
    pub fn set_container(&self, id: usize, handle: ContainerHandle) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = inner.get_mut(id) {
            task.container_id = Some(handle.container_id.clone());
            task.kill = Some(handle);
        }
    }

    /// Mark a task failed. The status only moves from `Running`, but the
    /// error text is recorded unconditionally.
    pub fn mark_failed(&self, id: usize, message: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = inner.get_mut(id) {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Failed;
            }
            task.error_text = message.to_owned();
        }
    }

    /// Downgrade a task to a warning. Same transition rules as
    /// [`mark_failed`](Self::mark_failed).
    pub fn mark_warning(&self, id: usize, message: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = inner.get_mut(id) {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Warning;
            }
            task.error_text = message.to_owned();
        }
    }

    /// Mark a task as succeeded.
    pub fn mark_succeeded(&self, id: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = inner.get_mut(id) {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Succeeded;
            }
        }
    }

    /// Kill the task's container and mark it aborted.
    pub async fn abort(&self, id: usize) -> Result<(), String> {
        let handle = {
            let mut inner = self.inner.lock().unwrap();
            let task = inner.get_mut(id).ok_or("no such task")?;
            task.kill.clone().ok_or("container is not killable")?
        };

        handle.kill().await.map_err(|err| err.to_string())?;

        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = inner.get_mut(id) {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Aborted;
            }
        }

        Ok(())
    }

    /// Compact and persist the ledger.
    ///
    /// Only the newest records are kept; the log files of the pruned tail
    /// are deleted, the survivors are renumbered from zero and the id
    /// counter restarts at the retention limit. Tasks still running are
    /// transitioned to `Aborted`, killing their containers where a handle
    /// is attached.
    pub async fn save(&self) -> Result<(), std::io::Error> {
        let stale_handles: Vec<ContainerHandle> = {
            let inner = self.inner.lock().unwrap();
            inner
                .tasks
                .iter()
                .filter(|task| task.is_active())
                .filter_map(|task| task.kill.clone())
                .collect()
        };
        for handle in stale_handles {
            if let Err(err) = handle.kill().await {
                warn!("failed to kill container on save: {}", err);
            }
        }

        let snapshot = {
            let mut inner = self.inner.lock().unwrap();

            let keep_from = inner.tasks.len().saturating_sub(KEPT_TASKS);
            for pruned in inner.tasks.drain(..keep_from) {
                if pruned.log_file_path.as_os_str().is_empty() {
                    continue;
                }
                info!("pruning task log {}", pruned.log_file_path.display());
                if let Err(err) = std::fs::remove_file(&pruned.log_file_path) {
                    warn!(
                        "failed to remove log {}: {}",
                        pruned.log_file_path.display(),
                        err
                    );
                }
            }

            for (index, task) in inner.tasks.iter_mut().enumerate() {
                task.id = index;
                if task.status == TaskStatus::Running {
                    task.status = TaskStatus::Aborted;
                }
            }
            inner.next = KEPT_TASKS;

            Ledger {
                next: inner.next,
                tasks: inner.tasks.clone(),
            }
        };

        persist::save_json(&self.file_path, &snapshot)
    }
}
