//! Pipeline subsystem: descriptor-driven task graphs and their execution.

pub mod builder;
pub mod engine;
pub mod graph;
pub mod node;
pub mod registry;

pub use builder::{build_pipeline, ProbeGeneration};
pub use engine::{Engine, EngineEvent, RunSummary, TaskRecord};
pub use graph::TaskGraph;
pub use node::{FileSignature, SkipReason, TaskContext, TaskNode, TaskStatus, TaskStep};
pub use registry::{ExternalRegistry, TaskArgs, TaskRegistry};
