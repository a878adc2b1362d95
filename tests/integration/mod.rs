//! Integration test suite for rigpipe.
//!
//! These tests exercise the crate end to end: descriptor aggregation
//! from multiple device stubs, graph construction from the merged
//! descriptor, and full engine runs against a session folder on disk.
//!
//! # Test Categories
//!
//! - `aggregation`: multi-writer descriptor merging under the lock protocol
//! - `pipeline_e2e`: descriptor -> graph -> engine execution and resume
//! - `sync_workflow`: clock mapping applied to extracted pulse trains
//!
//! Everything runs against temporary directories; no instrument data or
//! network access is needed.

mod fixtures;

mod aggregation;
mod pipeline_e2e;
mod sync_workflow;
