//! Data structures for tracking process state.
//!
//! This module defines the key a managed process is registered under
//! (`ServiceKey`), the specification used to launch it (`ProcessSpec`), and the
//! point-in-time view the supervisor hands out (`ProcessSnapshot`).

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

/// Identifies a managed process: one service within one project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub project_id: String,
    pub service_id: String,
}

impl ServiceKey {
    pub fn new(project_id: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            service_id: service_id.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.project_id, self.service_id)
    }
}

/// Specification for a process to be run.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Command line, run through the host command interpreter.
    pub command: String,
    /// Working directory.
    pub working_dir: PathBuf,
    /// Environment variables merged over the inherited environment.
    pub env: HashMap<String, String>,
}

impl ProcessSpec {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.into(),
            env: HashMap::new(),
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

/// Runtime view of a single managed process.
#[derive(Debug, Clone)]
pub struct ProcessSnapshot {
    pub key: ServiceKey,
    /// Process ID of the interpreter the command runs under.
    pub pid: Option<u32>,
    /// Time when the process started.
    pub started_at: Instant,
    pub command: String,
}
