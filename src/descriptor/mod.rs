//! Session descriptor subsystem.
//!
//! A session descriptor is a YAML document describing what was acquired:
//! devices, the sync source, behavioral task protocols, procedures and
//! projects. Device computers each produce a partial stub; [`store`]
//! merges stubs into the canonical file under a lock-file protocol and
//! [`query`] answers structural questions about the result.

pub mod lock;
pub mod query;
pub mod schema;
pub mod store;

pub use schema::{
    DeviceSettings, SessionDescriptor, SyncSettings, TaskEntry, TaskSettings,
    DESCRIPTION_FILE, SPEC_VERSION,
};
