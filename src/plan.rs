//! Choosing the port a service is started on.

use std::collections::HashSet;

use tracing::{info, warn};

use crate::detect::{PortDetectionResult, PortSourceDetector};
use crate::error::Result;
use crate::ports::{AllocationOwner, PortAllocation, PortRegistry};
use crate::project::{PortAssignment, ProjectDescriptor};

#[derive(Debug, Clone)]
pub struct PortPlan {
    pub port: u16,
    pub tech_stack: String,
    pub detection: PortDetectionResult,
    /// The assignment to record on the service descriptor.
    pub assignment: PortAssignment,
    pub allocation: PortAllocation,
    /// The preferred port could not be used and another was suggested.
    pub relocated: bool,
}

/// Picks, allocates and returns the port for one service of `project`.
///
/// A port spelled out in the start command is always used, even when busy.
/// Otherwise the configured port is preferred, then whatever detection finds.
/// If that port is busy on the host, allocated to another project or used by
/// a sibling service, a new one is suggested for the service's tech stack.
pub fn plan_service_port(
    detector: &PortSourceDetector,
    registry: &PortRegistry,
    project: &ProjectDescriptor,
    service_id: &str,
) -> Result<PortPlan> {
    let service = project.service(service_id)?;
    let detection = detector.resolve_service_port(&service.working_dir, service.role, &service.start_command);
    let tech_stack = if service.tech_stack.is_empty() {
        registry.detect_tech_stack(&service.start_command, &service.working_dir)
    } else {
        service.tech_stack.clone()
    };

    let siblings: HashSet<u16> = project
        .services
        .iter()
        .filter(|(id, _)| id.as_str() != service_id)
        .filter_map(|(_, sibling)| sibling.port())
        .collect();
    // An explicit override in the command is what the process will bind.
    let from_command = detection.provenance == crate::detect::COMMAND_PROVENANCE;
    let preferred = if from_command {
        detection.port
    } else {
        service.port().or(detection.port)
    };

    let usable = |port: u16| {
        !siblings.contains(&port)
            && registry.is_port_available(port)
            && registry
                .allocation(port)
                .map_or(true, |allocation| allocation.project_id == project.id)
    };
    let (port, relocated) = match preferred {
        // The process binds what its command says, whatever we export.
        Some(port) if from_command => {
            if !usable(port) {
                warn!(
                    project = %project.id,
                    service = service_id,
                    port,
                    "port set by the start command is busy or claimed; keeping it"
                );
            }
            (port, false)
        }
        Some(port) if usable(port) => (port, false),
        _ => (registry.suggest_port(&tech_stack, &project.id, &siblings)?, preferred.is_some()),
    };
    if relocated {
        info!(
            project = %project.id,
            service = service_id,
            wanted = ?preferred,
            port,
            "preferred port unavailable; relocated"
        );
    }

    let allocation = registry.allocate(
        port,
        &AllocationOwner {
            project_id: project.id.clone(),
            project_name: project.name.clone(),
            service_id: service_id.to_string(),
            service_name: service.display_name.clone(),
            tech_stack: tech_stack.clone(),
        },
    )?;
    let assignment = match &service.assigned_port {
        Some(existing) => {
            let mut assignment = existing.clone();
            assignment.reassign(port);
            assignment
        }
        None => PortAssignment::from_detection(port, &detection),
    };

    Ok(PortPlan {
        port,
        tech_stack,
        detection,
        assignment,
        allocation,
        relocated,
    })
}
