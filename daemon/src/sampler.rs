//! Per-process metric sampling (reads /proc on Linux)

mod linux;

pub use linux::LinuxSampler;

use crate::config::WatchCriterion;
use crate::error::SampleError;
use crate::model::{ExitCode, ProcessHandle, ProcessKey, Snapshot};
use std::collections::HashMap;
use std::time::Instant;

pub trait ProcessSampler: Send + Sync {
    /// Live processes matching any of `criteria`. A partial list would read
    /// as processes exiting, so running out of time is an error.
    fn discover(
        &self,
        criteria: &[WatchCriterion],
        deadline: Instant,
    ) -> Result<Vec<ProcessHandle>, SampleError>;

    /// Take one snapshot per handle. Processes that cannot be read, or that
    /// are not reached before `deadline`, are left out of the result.
    fn sample(&self, handles: &[ProcessHandle], deadline: Instant) -> HashMap<ProcessKey, Snapshot>;

    /// Single best-effort attempt to learn how a vanished process ended.
    fn exit_code(&self, handle: &ProcessHandle) -> Option<ExitCode>;
}
