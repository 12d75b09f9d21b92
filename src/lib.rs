//! portrack: supervise local development services and arbitrate their ports.
//!
//! The crate is built from three independent parts that a front end wires together:
//!
//! - [`ProcessSupervisor`] starts and stops shell commands per (project, service)
//!   and streams their output to subscribers.
//! - [`PortRegistry`] keeps advisory port allocations on disk, probes the OS for
//!   free ports and listeners, suggests ports and reports conflicts.
//! - [`PortSourceDetector`] reads a project's files and start command to infer
//!   which port a service is going to bind.
//!
//! Project and service descriptors live in [`ProjectStore`]. New projects come
//! from [`PortSourceDetector::detect_project`], and dev processes started by
//! other means are attributed to them by [`match_to_projects`].

pub mod config;
pub mod detect;
pub mod error;
pub mod events;
pub mod output;
pub mod persist;
pub mod plan;
pub mod ports;
pub mod process;
pub mod project;
pub mod scan;
pub mod supervisor;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::Settings;
pub use detect::{DetectedProject, DetectedService, PortDetectionResult, PortSourceDetector};
pub use error::{Error, Result};
pub use events::{LogCallback, LogEvent, LogReceiver, SubscriberId};
pub use output::{LogLine, StreamKind};
pub use plan::{plan_service_port, PortPlan};
pub use ports::{
    AllocationOwner, HostProcess, PortAllocation, PortConflict, PortOccupant, PortProbe,
    PortRegistry, SystemProbe,
};
pub use process::ServiceKey;
pub use project::{PortAssignment, ProjectDescriptor, ProjectStore, ServiceDescriptor, ServiceRole};
pub use scan::{match_to_projects, scan_processes, ExternalProcess};
pub use supervisor::ProcessSupervisor;

/// Locks a table mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
