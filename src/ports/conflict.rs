//! Advisory conflicts between configured services.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use serde::Serialize;

use crate::project::ProjectDescriptor;

/// A service that claims a port through its descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Claimant {
    pub project_id: String,
    pub project_name: String,
    pub service_id: String,
    pub service_name: String,
    pub command: String,
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortConflict {
    pub port: u16,
    pub claimants: Vec<Claimant>,
}

/// Groups enabled services by assigned port and reports every port with two
/// or more distinct claimants, ordered by port.
///
/// A service whose port was moved away from its detected original is a
/// deliberate override and never takes part in grouping.
pub fn check_conflicts(projects: &[ProjectDescriptor]) -> Vec<PortConflict> {
    let mut by_port: BTreeMap<u16, Vec<Claimant>> = BTreeMap::new();
    let mut seen: HashSet<(&str, &str)> = HashSet::new();

    for project in projects {
        for (service_id, service) in &project.services {
            if !service.enabled {
                continue;
            }
            let Some(assignment) = service.assigned_port.as_ref().filter(|a| a.port != 0) else {
                continue;
            };
            if assignment.is_overridden() {
                continue;
            }
            if !seen.insert((project.id.as_str(), service_id.as_str())) {
                continue;
            }
            by_port.entry(assignment.port).or_default().push(Claimant {
                project_id: project.id.clone(),
                project_name: project.name.clone(),
                service_id: service_id.clone(),
                service_name: service.display_name.clone(),
                command: service.start_command.clone(),
                working_dir: service.working_dir.clone(),
            });
        }
    }

    by_port
        .into_iter()
        .filter(|(_, claimants)| claimants.len() > 1)
        .map(|(port, claimants)| PortConflict { port, claimants })
        .collect()
}
