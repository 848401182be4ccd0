//! Dispatch bookkeeping: the assignment registry with its termination
//! predicate, and the worker liveness tracker.

pub mod liveness;
pub mod registry;

pub use liveness::LivenessTracker;
pub use registry::{AssignmentRegistry, RETRY_CAP};
