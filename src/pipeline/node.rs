//! Pipeline task nodes and their file-based input/output contracts.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Execution status of a pipeline task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Not yet eligible to run (parents incomplete).
    Waiting,
    /// Eligible, queued for a worker.
    Ready,
    Running,
    Complete,
    Failed { error: String },
    Skipped { reason: SkipReason },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// All required outputs already exist non-empty.
    OutputsExist,
    /// An ancestor task failed; this task never ran.
    ParentFailed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Waiting => write!(f, "waiting"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Complete => write!(f, "complete"),
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Skipped { reason } => match reason {
                SkipReason::OutputsExist => write!(f, "skipped: outputs exist"),
                SkipReason::ParentFailed => write!(f, "skipped: parent failed"),
            },
        }
    }
}

/// A file a task consumes or produces, relative to the session folder.
///
/// Patterns support `*` and `?` wildcards within a single path component
/// (e.g. `_spikeglx_sync.times*.npy`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileSignature {
    pub pattern: String,
    pub collection: String,
    /// Required outputs gate skip detection and postcondition checks;
    /// optional ones do not.
    pub required: bool,
}

impl FileSignature {
    pub fn required(pattern: &str, collection: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            collection: collection.to_string(),
            required: true,
        }
    }

    pub fn optional(pattern: &str, collection: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            collection: collection.to_string(),
            required: false,
        }
    }

    /// Whether at least one non-empty file matching this signature exists
    /// under `session_path`.
    pub fn exists_nonempty(&self, session_path: &Path) -> bool {
        let dir = session_path.join(&self.collection);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return false;
        };
        entries.filter_map(|e| e.ok()).any(|entry| {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                return false;
            };
            if !glob_match(&self.pattern, name) {
                return false;
            }
            entry.metadata().map(|m| m.len() > 0).unwrap_or(false)
        })
    }
}

/// Match a file name against a pattern with `*` and `?` wildcards.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&p[1..], &n[1..]),
            (Some(&pc), Some(&nc)) if pc == nc => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

/// The work a task performs when its turn comes.
///
/// Implementations run on a blocking worker thread; they get the session
/// location and task name through the context and do their own file IO.
pub trait TaskStep: Send + Sync {
    fn run(&self, ctx: &TaskContext) -> Result<()>;
}

/// Per-invocation context handed to a [`TaskStep`].
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub session_path: std::path::PathBuf,
    pub task_name: String,
}

/// A step with no side effects. Used for tasks whose only purpose is to
/// anchor graph structure, and as the default step in planning mode.
pub struct NoopStep;

impl TaskStep for NoopStep {
    fn run(&self, _ctx: &TaskContext) -> Result<()> {
        Ok(())
    }
}

/// A node in the pipeline graph.
#[derive(Clone)]
pub struct TaskNode {
    /// Unique within a graph; doubles as the job identifier in run records.
    pub name: String,
    /// Topological depth: 0 for roots, 1 + max parent level otherwise.
    pub level: u32,
    pub status: TaskStatus,
    /// Run even when outputs already exist.
    pub force: bool,
    pub input_signatures: Vec<FileSignature>,
    pub output_signatures: Vec<FileSignature>,
    pub step: Arc<dyn TaskStep>,
}

impl TaskNode {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            level: 0,
            status: TaskStatus::Waiting,
            force: false,
            input_signatures: Vec::new(),
            output_signatures: Vec::new(),
            step: Arc::new(NoopStep),
        }
    }

    pub fn with_step(mut self, step: Arc<dyn TaskStep>) -> Self {
        self.step = step;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<FileSignature>) -> Self {
        self.output_signatures = outputs;
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<FileSignature>) -> Self {
        self.input_signatures = inputs;
        self
    }

    /// Whether every required output already exists non-empty.
    ///
    /// Vacuously false when the task declares no required outputs, so
    /// declaration-free tasks always run.
    pub fn outputs_complete(&self, session_path: &Path) -> bool {
        let required: Vec<_> = self
            .output_signatures
            .iter()
            .filter(|s| s.required)
            .collect();
        !required.is_empty() && required.iter().all(|s| s.exists_nonempty(session_path))
    }

    /// Required outputs missing after a run, for postcondition reporting.
    pub fn missing_outputs(&self, session_path: &Path) -> Vec<&FileSignature> {
        self.output_signatures
            .iter()
            .filter(|s| s.required && !s.exists_nonempty(session_path))
            .collect()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Complete | TaskStatus::Failed { .. } | TaskStatus::Skipped { .. }
        )
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("name", &self.name)
            .field("level", &self.level)
            .field("status", &self.status)
            .field("force", &self.force)
            .finish()
    }
}
