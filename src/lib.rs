pub mod config;
pub mod descriptor;
pub mod error;
pub mod log;
pub mod pipeline;
pub mod sync;

pub use error::{Error, Result};

pub use descriptor::SessionDescriptor;
pub use pipeline::{Engine, RunSummary, TaskGraph, TaskRegistry};
