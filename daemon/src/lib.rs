//! CrashSense: watches running applications and classifies their exits as
//! crashes or normal terminations from recent resource telemetry.

pub mod classifier;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod handler;
pub mod history;
pub mod liveness;
pub mod model;
pub mod notifier;
pub mod protocol;
pub mod publisher;
pub mod sampler;
pub mod socket;
pub mod system;
pub mod verdicts;
