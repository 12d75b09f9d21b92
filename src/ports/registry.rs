//! Advisory port allocations and port suggestion.
//!
//! The table is bookkeeping only; nothing stops an unrelated process from
//! binding an allocated port. Every mutation rewrites `port_allocations.json`
//! while the table lock is held.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::conflict::{self, PortConflict};
use super::probe::{PortOccupant, PortProbe, SystemProbe};
use super::stack::{self, HIGH_RANGE, OVERFLOW_BAND, PORT_BANDS};
use crate::error::{Error, Result};
use crate::lock;
use crate::persist::{self, timestamp};
use crate::project::ProjectDescriptor;

const DOCUMENT_VERSION: u32 = 1;

/// Who a port is being allocated to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationOwner {
    pub project_id: String,
    pub project_name: String,
    pub service_id: String,
    pub service_name: String,
    pub tech_stack: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortAllocation {
    pub port: u16,
    #[serde(alias = "project_id")]
    pub project_id: String,
    #[serde(default, alias = "project_name")]
    pub project_name: String,
    #[serde(alias = "service_id", alias = "service_key")]
    pub service_id: String,
    #[serde(default, alias = "service_name")]
    pub service_name: String,
    #[serde(default, alias = "tech_stack")]
    pub tech_stack: String,
    #[serde(alias = "allocated_at", with = "timestamp")]
    pub allocated_at: DateTime<Utc>,
    #[serde(alias = "last_used", with = "timestamp")]
    pub last_used_at: DateTime<Utc>,
}

impl PortAllocation {
    fn is_owned_by(&self, owner: &AllocationOwner) -> bool {
        self.project_id == owner.project_id && self.service_id == owner.service_id
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AllocationDocument {
    #[serde(default)]
    version: u32,
    #[serde(default, alias = "updated_at", with = "timestamp::option")]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    allocations: Vec<PortAllocation>,
}

/// Allocation counts for one reserved band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BandUsage {
    pub key: &'static str,
    pub name: &'static str,
    pub start: u16,
    pub end: u16,
    pub allocated: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortStatistics {
    pub total_allocated: usize,
    pub by_tech_stack: BTreeMap<String, usize>,
    /// Keyed by project display name.
    pub by_project: BTreeMap<String, usize>,
    pub bands: Vec<BandUsage>,
}

/// What a front end shows when a service's port needs attention.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortRecommendation {
    pub current_port: Option<u16>,
    pub tech_stack: String,
    pub is_available: Option<bool>,
    pub occupant: Option<PortOccupant>,
    pub suggested: Vec<u16>,
}

pub struct PortRegistry {
    path: PathBuf,
    probe: Box<dyn PortProbe>,
    allocations: Mutex<BTreeMap<u16, PortAllocation>>,
}

impl PortRegistry {
    /// Opens the allocation document at `path` with the host probe.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::with_probe(path, SystemProbe)
    }

    pub fn with_probe(path: impl Into<PathBuf>, probe: impl PortProbe + 'static) -> Self {
        let path = path.into();
        let allocations: BTreeMap<u16, PortAllocation> =
            persist::read_json::<AllocationDocument>(&path)
                .map(|document| {
                    document
                        .allocations
                        .into_iter()
                        .filter(|allocation| allocation.port != 0)
                        .map(|allocation| (allocation.port, allocation))
                        .collect()
                })
                .unwrap_or_default();
        debug!(path = %path.display(), count = allocations.len(), "loaded port allocations");
        Self {
            path,
            probe: Box::new(probe),
            allocations: Mutex::new(allocations),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_port_available(&self, port: u16) -> bool {
        self.probe.is_port_available(port)
    }

    pub fn get_port_occupant(&self, port: u16) -> Option<PortOccupant> {
        self.probe.port_occupant(port)
    }

    /// Listening ports within `start..=end`.
    pub fn scan_occupied_ports(&self, start: u16, end: u16) -> BTreeMap<u16, PortOccupant> {
        self.probe.occupied_ports(start, end)
    }

    /// Records `port` for `owner`, replacing whatever allocation it had.
    ///
    /// Re-allocating a port to the same service keeps the original
    /// `allocated_at`. The in-memory table is updated even if the write fails.
    pub fn allocate(&self, port: u16, owner: &AllocationOwner) -> Result<PortAllocation> {
        if port == 0 {
            return Err(Error::InvalidPort(port));
        }
        let now = Utc::now();
        let mut allocations = lock(&self.allocations);
        let allocated_at = allocations
            .get(&port)
            .filter(|existing| existing.is_owned_by(owner))
            .map(|existing| existing.allocated_at)
            .unwrap_or(now);
        let allocation = PortAllocation {
            port,
            project_id: owner.project_id.clone(),
            project_name: owner.project_name.clone(),
            service_id: owner.service_id.clone(),
            service_name: owner.service_name.clone(),
            tech_stack: owner.tech_stack.clone(),
            allocated_at,
            last_used_at: now,
        };
        allocations.insert(port, allocation.clone());
        debug!(port, project = %owner.project_id, service = %owner.service_id, "allocated port");
        self.save(&allocations)?;
        Ok(allocation)
    }

    /// Drops the allocation for `port`. Returns whether there was one.
    pub fn release(&self, port: u16) -> Result<bool> {
        let mut allocations = lock(&self.allocations);
        if allocations.remove(&port).is_none() {
            return Ok(false);
        }
        debug!(port, "released port");
        self.save(&allocations)?;
        Ok(true)
    }

    pub fn update_last_used(&self, port: u16) -> Result<bool> {
        let mut allocations = lock(&self.allocations);
        let Some(allocation) = allocations.get_mut(&port) else {
            return Ok(false);
        };
        allocation.last_used_at = Utc::now();
        self.save(&allocations)?;
        Ok(true)
    }

    pub fn allocation(&self, port: u16) -> Option<PortAllocation> {
        lock(&self.allocations).get(&port).cloned()
    }

    /// All allocations ordered by port.
    pub fn allocations(&self) -> Vec<PortAllocation> {
        lock(&self.allocations).values().cloned().collect()
    }

    pub fn statistics(&self) -> PortStatistics {
        let allocations = lock(&self.allocations);
        let mut by_tech_stack: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_project: BTreeMap<String, usize> = BTreeMap::new();
        for allocation in allocations.values() {
            *by_tech_stack.entry(allocation.tech_stack.clone()).or_default() += 1;
            *by_project.entry(allocation.project_name.clone()).or_default() += 1;
        }
        let bands = PORT_BANDS
            .iter()
            .map(|band| BandUsage {
                key: band.key,
                name: band.name,
                start: band.start,
                end: band.end,
                allocated: allocations.keys().filter(|port| band.contains(**port)).count(),
                total: band.size(),
            })
            .collect();
        PortStatistics {
            total_allocated: allocations.len(),
            by_tech_stack,
            by_project,
            bands,
        }
    }

    pub fn detect_tech_stack(&self, command: &str, working_dir: &Path) -> String {
        stack::detect_tech_stack(command, working_dir)
    }

    /// Picks a port for a service of `tech_stack` in `project_id`.
    ///
    /// Tries the stack's default port, then the stack's reserved bands, the
    /// overflow band and finally 10000-65535. A candidate must be free on the
    /// host, outside `exclude` and not allocated to another project.
    pub fn suggest_port(&self, tech_stack: &str, project_id: &str, exclude: &HashSet<u16>) -> Result<u16> {
        let foreign: HashSet<u16> = lock(&self.allocations)
            .values()
            .filter(|allocation| allocation.project_id != project_id)
            .map(|allocation| allocation.port)
            .collect();
        let usable = |port: u16| {
            !exclude.contains(&port) && !foreign.contains(&port) && self.probe.is_port_available(port)
        };

        if let Some(port) = stack::default_port(tech_stack).filter(|port| usable(*port)) {
            return Ok(port);
        }
        let bands = PORT_BANDS
            .iter()
            .filter(|band| band.key != OVERFLOW_BAND.key && band.stacks.contains(&tech_stack))
            .map(|band| (band.start, band.end))
            .chain([(OVERFLOW_BAND.start, OVERFLOW_BAND.end), HIGH_RANGE]);
        for (start, end) in bands {
            if let Some(port) = (start..=end).find(|port| usable(*port)) {
                return Ok(port);
            }
        }
        Err(Error::NoPortAvailable {
            tech_stack: tech_stack.to_string(),
        })
    }

    /// Current state of a service's port and up to three alternatives, none of
    /// which collide with the project's other services.
    pub fn port_recommendations(&self, project: &ProjectDescriptor, service_id: &str) -> Result<PortRecommendation> {
        let service = project.service(service_id)?;
        let tech_stack = if service.tech_stack.is_empty() {
            self.detect_tech_stack(&service.start_command, &service.working_dir)
        } else {
            service.tech_stack.clone()
        };
        let current_port = service.port();

        let mut exclude = project.assigned_ports();
        if let Some(port) = current_port {
            exclude.remove(&port);
        }
        let mut suggested = Vec::with_capacity(3);
        while suggested.len() < 3 {
            match self.suggest_port(&tech_stack, &project.id, &exclude) {
                Ok(port) => {
                    suggested.push(port);
                    exclude.insert(port);
                }
                Err(_) => break,
            }
        }

        Ok(PortRecommendation {
            current_port,
            is_available: current_port.map(|port| self.is_port_available(port)),
            occupant: current_port.and_then(|port| self.get_port_occupant(port)),
            tech_stack,
            suggested,
        })
    }

    pub fn check_conflicts(&self, projects: &[ProjectDescriptor]) -> Vec<PortConflict> {
        conflict::check_conflicts(projects)
    }

    fn save(&self, allocations: &BTreeMap<u16, PortAllocation>) -> Result<()> {
        let document = AllocationDocument {
            version: DOCUMENT_VERSION,
            updated_at: Some(Utc::now()),
            allocations: allocations.values().cloned().collect(),
        };
        persist::write_json(&self.path, &document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{PortAssignment, ServiceDescriptor, ServiceRole};
    use std::sync::Arc;

    /// Probe whose view of the host is a fixed set of busy ports.
    #[derive(Clone, Default)]
    struct FakeProbe {
        busy: Arc<Mutex<HashSet<u16>>>,
    }

    impl FakeProbe {
        fn occupy(&self, ports: impl IntoIterator<Item = u16>) {
            self.busy.lock().unwrap().extend(ports);
        }
    }

    impl PortProbe for FakeProbe {
        fn is_port_available(&self, port: u16) -> bool {
            port != 0 && !self.busy.lock().unwrap().contains(&port)
        }

        fn port_occupant(&self, port: u16) -> Option<PortOccupant> {
            self.busy.lock().unwrap().contains(&port).then(|| PortOccupant {
                pid: 4242,
                process_name: "node".into(),
                command_line: "node server.js".into(),
            })
        }

        fn occupied_ports(&self, start: u16, end: u16) -> BTreeMap<u16, PortOccupant> {
            (start..=end)
                .filter_map(|port| self.port_occupant(port).map(|o| (port, o)))
                .collect()
        }
    }

    fn owner(project: &str, service: &str, stack: &str) -> AllocationOwner {
        AllocationOwner {
            project_id: project.into(),
            project_name: project.to_uppercase(),
            service_id: service.into(),
            service_name: service.into(),
            tech_stack: stack.into(),
        }
    }

    fn registry() -> (tempfile::TempDir, FakeProbe, PortRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let probe = FakeProbe::default();
        let registry = PortRegistry::with_probe(dir.path().join("port_allocations.json"), probe.clone());
        (dir, probe, registry)
    }

    #[test]
    fn allocations_persist_and_reload() {
        let (dir, _probe, registry) = registry();
        registry.allocate(5173, &owner("shop", "frontend", "vite")).unwrap();
        registry.allocate(8000, &owner("shop", "backend", "fastapi")).unwrap();
        assert!(registry.update_last_used(8000).unwrap());

        let reloaded = PortRegistry::with_probe(dir.path().join("port_allocations.json"), FakeProbe::default());
        assert_eq!(reloaded.allocations(), registry.allocations());

        let raw: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("port_allocations.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(raw["version"], 1);
        assert_eq!(raw["allocations"][0]["projectId"], "shop");
    }

    #[test]
    fn concurrent_allocate_and_release_keep_document_in_step() {
        let (dir, _, registry) = registry();
        std::thread::scope(|scope| {
            for worker in 0..8u16 {
                let registry = &registry;
                scope.spawn(move || {
                    let service = format!("svc{worker}");
                    for i in 0..25u16 {
                        let port = 20000 + worker * 100 + i;
                        registry.allocate(port, &owner("p", &service, "custom")).unwrap();
                        if i % 3 == 0 {
                            assert!(registry.release(port).unwrap());
                        }
                    }
                });
            }
        });

        let in_memory = registry.allocations();
        assert_eq!(in_memory.len(), 8 * 16);
        let reloaded = PortRegistry::open(dir.path().join("port_allocations.json"));
        assert_eq!(reloaded.allocations(), in_memory);
    }

    #[test]
    fn allocate_is_an_upsert_keyed_by_port() {
        let (_dir, _probe, registry) = registry();
        let first = registry.allocate(3000, &owner("a", "frontend", "vite")).unwrap();
        let again = registry.allocate(3000, &owner("a", "frontend", "vite")).unwrap();
        assert_eq!(again.allocated_at, first.allocated_at);

        let taken = registry.allocate(3000, &owner("b", "frontend", "react")).unwrap();
        assert_eq!(registry.allocations().len(), 1);
        assert_eq!(registry.allocation(3000), Some(taken));
        assert!(matches!(
            registry.allocate(0, &owner("a", "x", "custom")),
            Err(Error::InvalidPort(0))
        ));
    }

    #[test]
    fn release_and_touch_of_unknown_port_do_not_write() {
        let (dir, _probe, registry) = registry();
        assert!(!registry.release(4000).unwrap());
        assert!(!registry.update_last_used(4000).unwrap());
        assert!(!dir.path().join("port_allocations.json").exists());

        registry.allocate(4000, &owner("a", "api", "express")).unwrap();
        assert!(registry.release(4000).unwrap());
        assert!(registry.allocations().is_empty());
    }

    #[test]
    fn reads_snake_case_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("port_allocations.json");
        std::fs::write(
            &path,
            r#"{"allocations": [{"port": 5173, "project_id": "p", "project_name": "P",
                "service_key": "frontend", "service_name": "Web", "tech_stack": "vite",
                "allocated_at": "2025-01-02T03:04:05.000006", "last_used": "2025-01-02T03:04:05.000006"}],
                "updated_at": "2025-01-02T03:04:05.000006"}"#,
        )
        .unwrap();
        let registry = PortRegistry::with_probe(&path, FakeProbe::default());
        let allocation = registry.allocation(5173).unwrap();
        assert_eq!(allocation.service_id, "frontend");
        assert_eq!(allocation.tech_stack, "vite");
    }

    #[test]
    fn corrupt_document_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("port_allocations.json");
        std::fs::write(&path, "[1, 2").unwrap();
        let registry = PortRegistry::with_probe(&path, FakeProbe::default());
        assert!(registry.allocations().is_empty());
    }

    #[test]
    fn suggest_prefers_default_port() {
        let (_dir, _probe, registry) = registry();
        assert_eq!(registry.suggest_port("vite", "p", &HashSet::new()).unwrap(), 5173);
        assert_eq!(registry.suggest_port("flask", "p", &HashSet::new()).unwrap(), 5000);
    }

    #[test]
    fn suggest_skips_ports_of_other_projects_but_not_our_own() {
        let (_dir, _probe, registry) = registry();
        registry.allocate(5173, &owner("other", "frontend", "vite")).unwrap();
        assert_eq!(registry.suggest_port("vite", "p", &HashSet::new()).unwrap(), 3000);

        registry.allocate(5173, &owner("p", "frontend", "vite")).unwrap();
        assert_eq!(registry.suggest_port("vite", "p", &HashSet::new()).unwrap(), 5173);
    }

    #[test]
    fn suggest_walks_bands_then_overflow_then_high_range() {
        let (_dir, probe, registry) = registry();
        let exclude: HashSet<u16> = [8000].into_iter().collect();
        probe.occupy(8001..=8010);
        assert_eq!(registry.suggest_port("fastapi", "p", &exclude).unwrap(), 8011);

        // Unknown tag: no default, no band of its own.
        probe.occupy(9000..=9998);
        assert_eq!(registry.suggest_port("customtag", "p", &HashSet::new()).unwrap(), 9999);

        registry.allocate(9999, &owner("other", "svc", "customtag")).unwrap();
        probe.occupy([10000]);
        assert_eq!(registry.suggest_port("customtag", "p", &HashSet::new()).unwrap(), 10001);

        registry.allocate(10001, &owner("other", "svc2", "customtag")).unwrap();
        let exclude: HashSet<u16> = [10002].into_iter().collect();
        assert_eq!(registry.suggest_port("customtag", "p", &exclude).unwrap(), 10003);
    }

    #[test]
    fn suggest_reports_exhaustion() {
        let (_dir, probe, registry) = registry();
        probe.occupy(1..=u16::MAX);
        let err = registry.suggest_port("vite", "p", &HashSet::new()).unwrap_err();
        assert!(matches!(err, Error::NoPortAvailable { ref tech_stack } if tech_stack == "vite"));
    }

    #[test]
    fn statistics_group_by_stack_project_and_band() {
        let (_dir, _probe, registry) = registry();
        registry.allocate(3000, &owner("a", "frontend", "vite")).unwrap();
        registry.allocate(3001, &owner("b", "frontend", "vite")).unwrap();
        registry.allocate(8000, &owner("a", "backend", "fastapi")).unwrap();
        let stats = registry.statistics();
        assert_eq!(stats.total_allocated, 3);
        assert_eq!(stats.by_tech_stack["vite"], 2);
        assert_eq!(stats.by_project["A"], 2);
        let frontend = stats.bands.iter().find(|b| b.key == "frontend_dev").unwrap();
        assert_eq!((frontend.allocated, frontend.total), (2, 1000));
    }

    #[test]
    fn recommendations_avoid_sibling_ports() {
        let (_dir, probe, registry) = registry();
        probe.occupy([5173]);
        let project = ProjectDescriptor::new("p", "P", "/p")
            .with_service(
                "frontend",
                ServiceDescriptor::new("Web", ServiceRole::Frontend, "/p/web", "npm run dev")
                    .with_port(PortAssignment::new(5173, "vite.config.ts")),
            )
            .with_service(
                "backend",
                ServiceDescriptor::new("API", ServiceRole::Backend, "/p/api", "node api.js")
                    .with_port(PortAssignment::new(3000, "server.js")),
            );
        let rec = registry.port_recommendations(&project, "frontend").unwrap();
        assert_eq!(rec.tech_stack, "vite");
        assert_eq!(rec.current_port, Some(5173));
        assert_eq!(rec.is_available, Some(false));
        assert_eq!(rec.occupant.map(|o| o.pid), Some(4242));
        assert_eq!(rec.suggested, vec![3001, 3002, 3003]);

        assert!(matches!(
            registry.port_recommendations(&project, "worker"),
            Err(Error::ServiceNotFound { .. })
        ));
    }
}
