//! Static port detection.
//!
//! Reads a project's configuration files and its literal start command to
//! infer which port a service will bind, and walks whole projects to find
//! their services. Nothing is executed.

mod env_override;
mod project;
mod rules;

use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::project::ServiceRole;

pub use env_override::detect_env_port_override;
pub use project::{DetectedProject, DetectedService, PYTHON_ENV_VAR};
use rules::{CheckSpec, BACKEND_CHECKS, FRONTEND_CHECKS};

/// Provenance reported when the start command carries the port.
pub const COMMAND_PROVENANCE: &str = "command";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortDetectionResult {
    /// `None` when nothing was found or the port comes from `env_var`.
    pub port: Option<u16>,
    /// File (or `command`) the result was read from.
    pub provenance: String,
    pub confidence: f32,
    pub env_var: Option<String>,
    pub details: String,
}

impl PortDetectionResult {
    fn not_found() -> Self {
        Self {
            port: None,
            provenance: "default".to_string(),
            confidence: 0.0,
            env_var: None,
            details: "no port configuration found".to_string(),
        }
    }

    fn from_command(var: String, port: u16) -> Self {
        Self {
            port: Some(port),
            provenance: COMMAND_PROVENANCE.to_string(),
            confidence: 1.0,
            details: format!("{var}={port} set by the start command"),
            env_var: Some(var),
        }
    }

    pub fn is_found(&self) -> bool {
        self.confidence > 0.0
    }
}

/// Stateless front for the artifact checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortSourceDetector;

impl PortSourceDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn detect_frontend_port(&self, dir: &Path) -> PortDetectionResult {
        run_checks(dir, FRONTEND_CHECKS)
    }

    pub fn detect_backend_port(&self, dir: &Path) -> PortDetectionResult {
        run_checks(dir, BACKEND_CHECKS)
    }

    pub fn detect_env_port_override(&self, command: &str) -> Option<(String, u16)> {
        detect_env_port_override(command)
    }

    /// Port for a service: an override in `command` outranks anything found
    /// on disk. Services that are neither frontend nor backend get whichever
    /// battery is more confident.
    pub fn resolve_service_port(&self, dir: &Path, role: ServiceRole, command: &str) -> PortDetectionResult {
        if let Some((var, port)) = detect_env_port_override(command) {
            return PortDetectionResult::from_command(var, port);
        }
        match role {
            ServiceRole::Frontend => self.detect_frontend_port(dir),
            ServiceRole::Backend => self.detect_backend_port(dir),
            ServiceRole::Other => {
                let frontend = self.detect_frontend_port(dir);
                let backend = self.detect_backend_port(dir);
                if backend.confidence > frontend.confidence {
                    backend
                } else {
                    frontend
                }
            }
        }
    }
}

/// Runs `checks` in order. A result strictly above its check's threshold ends
/// the search; otherwise the most confident result wins, earliest on ties.
fn run_checks(dir: &Path, checks: &[CheckSpec]) -> PortDetectionResult {
    let mut best: Option<PortDetectionResult> = None;
    for check in checks {
        let Some(result) = check.evaluate(dir) else {
            continue;
        };
        debug!(
            dir = %dir.display(),
            check = check.name,
            port = ?result.port,
            confidence = result.confidence,
            "port check matched"
        );
        if result.confidence > check.threshold {
            return result;
        }
        if best.as_ref().map_or(true, |best| result.confidence > best.confidence) {
            best = Some(result);
        }
    }
    best.unwrap_or_else(PortDetectionResult::not_found)
}
