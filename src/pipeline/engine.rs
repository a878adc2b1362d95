//! Task execution engine.
//!
//! Drives a frozen [`TaskGraph`] to completion: ready tasks go to
//! blocking workers bounded by `max_workers`, a failed task
//! short-circuits its descendants, and every status change batch is
//! persisted to the session's run record so an interrupted run resumes
//! where it left off.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::pipeline::graph::TaskGraph;
use crate::pipeline::node::{SkipReason, TaskContext, TaskStatus};
use crate::{rlog, rlog_debug, rlog_warn, Error, Result};

pub const RUN_RECORD_DIR: &str = "_pipeline";
pub const RUN_RECORD_FILE: &str = "last_run.json";

/// Task lifecycle notifications, mirrored to an optional channel.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    TaskStarted { name: String },
    TaskCompleted { name: String },
    TaskFailed { name: String, error: String },
    TaskSkipped { name: String, reason: SkipReason },
    RunComplete,
}

/// One task's outcome in the persisted run record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub name: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Aggregate outcome of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub complete: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub skipped: Vec<(String, SkipReason)>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Engine {
    graph: TaskGraph,
    session_path: PathBuf,
    max_workers: usize,
    force: bool,
    cancel: CancellationToken,
    event_tx: Option<mpsc::Sender<EngineEvent>>,
    times: std::collections::HashMap<String, (Option<DateTime<Utc>>, Option<DateTime<Utc>>)>,
}

impl Engine {
    pub fn new(graph: TaskGraph, session_path: &Path) -> Self {
        Self {
            graph,
            session_path: session_path.to_path_buf(),
            max_workers: 1,
            force: false,
            cancel: CancellationToken::new(),
            event_tx: None,
            times: Default::default(),
        }
    }

    pub fn with_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, tx: mpsc::Sender<EngineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Execute the graph to quiescence.
    ///
    /// Cancellation is observed between dispatches only; in-flight tasks
    /// run to completion and are recorded, pending tasks stay Waiting.
    pub async fn run(&mut self) -> Result<RunSummary> {
        self.resume_from_record()?;

        let mut in_flight: JoinSet<(String, Result<()>)> = JoinSet::new();
        let mut running: HashSet<String> = HashSet::new();

        loop {
            self.skip_descendants_of_failed();
            let progressed = if self.cancel.is_cancelled() {
                0
            } else {
                self.dispatch_ready(&mut in_flight, &mut running).await?
            };
            self.persist_record()?;

            if in_flight.is_empty() {
                // A skip can unlock children without anything running;
                // only stop once a pass changes nothing.
                if progressed == 0 {
                    break;
                }
                continue;
            }
            let joined = in_flight
                .join_next()
                .await
                .ok_or_else(|| Error::TaskJoin("worker set drained unexpectedly".to_string()))?;
            let (name, result) = joined.map_err(|e| Error::TaskJoin(e.to_string()))?;
            running.remove(&name);
            self.settle(&name, result).await;
        }

        self.persist_record()?;
        self.emit(EngineEvent::RunComplete).await;
        Ok(self.summary())
    }

    /// Mark previously Complete tasks from the last run record as cache
    /// hits, unless this run forces re-execution.
    fn resume_from_record(&mut self) -> Result<()> {
        let path = self.record_path();
        if !path.exists() {
            return Ok(());
        }
        let records: Vec<TaskRecord> = match serde_json::from_str(&std::fs::read_to_string(&path)?)
        {
            Ok(records) => records,
            Err(e) => {
                rlog_warn!("unreadable run record {}: {}", path.display(), e);
                return Ok(());
            }
        };
        for record in records {
            if record.status != TaskStatus::Complete {
                continue;
            }
            if let Some(task) = self.graph.get_mut(&record.name) {
                if !self.force && !task.force {
                    task.status = TaskStatus::Skipped {
                        reason: SkipReason::OutputsExist,
                    };
                    rlog_debug!("cache hit from previous run: {}", record.name);
                }
            }
        }
        Ok(())
    }

    /// Names counted as satisfied parents: Complete or skipped-as-done.
    fn done_set(&self) -> HashSet<String> {
        self.graph
            .all_tasks()
            .filter(|t| {
                matches!(
                    t.status,
                    TaskStatus::Complete
                        | TaskStatus::Skipped {
                            reason: SkipReason::OutputsExist
                        }
                )
            })
            .map(|t| t.name.clone())
            .collect()
    }

    /// Returns the number of tasks whose status changed (dispatched or
    /// skipped) in this pass.
    async fn dispatch_ready(
        &mut self,
        in_flight: &mut JoinSet<(String, Result<()>)>,
        running: &mut HashSet<String>,
    ) -> Result<usize> {
        let mut progressed = 0;
        let done = self.done_set();
        let ready: Vec<String> = self
            .graph
            .ready_tasks(&done)
            .iter()
            .filter(|t| t.status == TaskStatus::Waiting)
            .map(|t| t.name.clone())
            .collect();

        for name in ready {
            if running.len() >= self.max_workers {
                break;
            }
            if self.cancel.is_cancelled() {
                rlog!("cancellation requested, not dispatching {}", name);
                break;
            }

            let force = self.force;
            let task = self
                .graph
                .get_mut(&name)
                .ok_or_else(|| Error::Config(format!("task {} not found in graph", name)))?;

            if !force && !task.force && task.outputs_complete(&self.session_path) {
                task.status = TaskStatus::Skipped {
                    reason: SkipReason::OutputsExist,
                };
                rlog_debug!("outputs exist, skipping {}", name);
                self.emit(EngineEvent::TaskSkipped {
                    name: name.clone(),
                    reason: SkipReason::OutputsExist,
                })
                .await;
                progressed += 1;
                continue;
            }

            task.status = TaskStatus::Running;
            let step = task.step.clone();
            let ctx = TaskContext {
                session_path: self.session_path.clone(),
                task_name: name.clone(),
            };
            self.times.insert(name.clone(), (Some(Utc::now()), None));
            running.insert(name.clone());
            rlog!("task started: {}", name);
            self.emit(EngineEvent::TaskStarted { name: name.clone() }).await;

            let task_name = name;
            in_flight.spawn_blocking(move || {
                let result = step.run(&ctx);
                (task_name, result)
            });
            progressed += 1;
        }
        Ok(progressed)
    }

    /// Record the outcome of a finished worker, including the
    /// postcondition check on required outputs.
    async fn settle(&mut self, name: &str, result: Result<()>) {
        if let Some(times) = self.times.get_mut(name) {
            times.1 = Some(Utc::now());
        }
        let outcome = match result {
            Ok(()) => {
                let missing: Vec<String> = self
                    .graph
                    .get(name)
                    .map(|t| {
                        t.missing_outputs(&self.session_path)
                            .iter()
                            .map(|s| format!("{}/{}", s.collection, s.pattern))
                            .collect()
                    })
                    .unwrap_or_default();
                if missing.is_empty() {
                    Ok(())
                } else {
                    Err(format!("missing required outputs: {}", missing.join(", ")))
                }
            }
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(()) => {
                if let Some(task) = self.graph.get_mut(name) {
                    task.status = TaskStatus::Complete;
                }
                rlog!("task complete: {}", name);
                self.emit(EngineEvent::TaskCompleted {
                    name: name.to_string(),
                })
                .await;
            }
            Err(error) => {
                if let Some(task) = self.graph.get_mut(name) {
                    task.status = TaskStatus::Failed {
                        error: error.clone(),
                    };
                }
                rlog_warn!("task failed: {}: {}", name, error);
                self.emit(EngineEvent::TaskFailed {
                    name: name.to_string(),
                    error,
                })
                .await;
            }
        }
    }

    /// Propagate failures: every non-terminal descendant of a failed task
    /// is skipped without running.
    fn skip_descendants_of_failed(&mut self) {
        let failed: Vec<String> = self
            .graph
            .all_tasks()
            .filter(|t| matches!(t.status, TaskStatus::Failed { .. }))
            .map(|t| t.name.clone())
            .collect();
        for name in failed {
            let descendants: Vec<String> = self
                .graph
                .descendants(&name)
                .iter()
                .map(|s| s.to_string())
                .collect();
            for descendant in descendants {
                if let Some(task) = self.graph.get_mut(&descendant) {
                    if !task.is_terminal() && task.status != TaskStatus::Running {
                        task.status = TaskStatus::Skipped {
                            reason: SkipReason::ParentFailed,
                        };
                        rlog_debug!("skipping {} after failure of {}", descendant, name);
                    }
                }
            }
        }
    }

    fn record_path(&self) -> PathBuf {
        self.session_path.join(RUN_RECORD_DIR).join(RUN_RECORD_FILE)
    }

    /// Persist the run record in dependency order.
    fn persist_record(&self) -> Result<()> {
        let records: Vec<TaskRecord> = self
            .graph
            .topological_order()?
            .iter()
            .map(|t| {
                let (started_at, ended_at) =
                    self.times.get(&t.name).copied().unwrap_or((None, None));
                TaskRecord {
                    name: t.name.clone(),
                    status: t.status.clone(),
                    started_at,
                    ended_at,
                }
            })
            .collect();
        let dir = self.session_path.join(RUN_RECORD_DIR);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(self.record_path(), serde_json::to_string_pretty(&records)?)?;
        Ok(())
    }

    fn summary(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for task in self.graph.all_tasks() {
            match &task.status {
                TaskStatus::Complete => summary.complete.push(task.name.clone()),
                TaskStatus::Failed { error } => {
                    summary.failed.push((task.name.clone(), error.clone()))
                }
                TaskStatus::Skipped { reason } => {
                    summary.skipped.push((task.name.clone(), *reason))
                }
                _ => {}
            }
        }
        summary
    }

    async fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }
}
