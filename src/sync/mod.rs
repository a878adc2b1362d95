//! Clock synchronization and probe drift estimation.

pub mod clock;
pub mod drift;

pub use clock::{sync_timestamps, sync_timestamps_with, ClockMapping};
pub use drift::{estimate_drift, DriftEstimate, DriftParams};
