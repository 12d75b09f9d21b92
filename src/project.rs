//! Project and service descriptors and the document that persists them.
//!
//! The on-disk document has gone through two layouts. Older files store a
//! service's port as a bare integer next to `cwd`/`env`/`name`; newer ones use
//! a port record that remembers the originally detected port. Both are read
//! into the one canonical [`ServiceDescriptor`] when the document is loaded.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::detect::PortDetectionResult;
use crate::error::{Error, Result};
use crate::lock;
use crate::persist::{self, timestamp};

pub const DOCUMENT_VERSION: &str = "2.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRole {
    Frontend,
    Backend,
    #[serde(alias = "service")]
    Other,
}

impl ServiceRole {
    /// Guesses the role from a service key such as `frontend` or `api`.
    pub fn infer(service_id: &str) -> Self {
        let id = service_id.to_lowercase();
        if id.contains("front") {
            ServiceRole::Frontend
        } else if id.contains("back") || id.contains("api") {
            ServiceRole::Backend
        } else {
            ServiceRole::Other
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "frontend" => Some(ServiceRole::Frontend),
            "backend" => Some(ServiceRole::Backend),
            "" => None,
            _ => Some(ServiceRole::Other),
        }
    }
}

/// The port a service runs on and where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortAssignment {
    pub port: u16,
    /// What detection produced when the service was first configured.
    #[serde(default)]
    pub original_port: Option<u16>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub confidence: f32,
}

impl PortAssignment {
    pub fn new(port: u16, source: impl Into<String>) -> Self {
        Self {
            port,
            original_port: None,
            source: source.into(),
            confidence: 0.0,
        }
    }

    /// Assignment of `port` for a service whose detection gave `detection`.
    pub fn from_detection(port: u16, detection: &PortDetectionResult) -> Self {
        Self {
            port,
            original_port: detection.port.or(Some(port)),
            source: detection.provenance.clone(),
            confidence: detection.confidence,
        }
    }

    /// Moves the service to another port; the original port is kept.
    pub fn reassign(&mut self, port: u16) {
        if self.original_port.is_none() {
            self.original_port = Some(self.port);
        }
        self.port = port;
    }

    /// A port that differs from the originally detected one is a deliberate user choice.
    pub fn is_overridden(&self) -> bool {
        matches!(self.original_port, Some(original) if original != self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    pub enabled: bool,
    pub display_name: String,
    pub role: ServiceRole,
    pub working_dir: PathBuf,
    pub start_command: String,
    pub tech_stack: String,
    pub assigned_port: Option<PortAssignment>,
    pub env_overrides: BTreeMap<String, String>,
}

impl ServiceDescriptor {
    pub fn new(
        display_name: impl Into<String>,
        role: ServiceRole,
        working_dir: impl Into<PathBuf>,
        start_command: impl Into<String>,
    ) -> Self {
        Self {
            enabled: true,
            display_name: display_name.into(),
            role,
            working_dir: working_dir.into(),
            start_command: start_command.into(),
            tech_stack: String::new(),
            assigned_port: None,
            env_overrides: BTreeMap::new(),
        }
    }

    pub fn with_port(mut self, assignment: PortAssignment) -> Self {
        self.assigned_port = Some(assignment);
        self
    }

    pub fn port(&self) -> Option<u16> {
        self.assigned_port
            .as_ref()
            .map(|assignment| assignment.port)
            .filter(|port| *port != 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawProject")]
pub struct ProjectDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub path: PathBuf,
    pub services: BTreeMap<String, ServiceDescriptor>,
    #[serde(serialize_with = "timestamp::serialize")]
    pub created_at: DateTime<Utc>,
    #[serde(serialize_with = "timestamp::serialize")]
    pub updated_at: DateTime<Utc>,
    #[serde(serialize_with = "timestamp::option::serialize")]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl ProjectDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            path: path.into(),
            services: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            last_run_at: None,
        }
    }

    pub fn with_service(mut self, service_id: impl Into<String>, service: ServiceDescriptor) -> Self {
        self.services.insert(service_id.into(), service);
        self
    }

    pub fn service(&self, service_id: &str) -> Result<&ServiceDescriptor> {
        self.services
            .get(service_id)
            .ok_or_else(|| Error::ServiceNotFound {
                project: self.id.clone(),
                service: service_id.to_string(),
            })
    }

    /// Ports assigned to this project's services, enabled or not.
    pub fn assigned_ports(&self) -> HashSet<u16> {
        self.services.values().filter_map(ServiceDescriptor::port).collect()
    }

    fn matches(&self, keyword: &str) -> bool {
        self.name.to_lowercase().contains(keyword)
            || self.description.to_lowercase().contains(keyword)
            || self.path.to_string_lossy().to_lowercase().contains(keyword)
    }
}

// Every shape a stored project has been written in.

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawProject {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    path: PathBuf,
    #[serde(default)]
    services: BTreeMap<String, RawService>,
    #[serde(default, alias = "created_at", with = "timestamp::option")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "updated_at", with = "timestamp::option")]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "last_run_at", with = "timestamp::option")]
    last_run_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawService {
    #[serde(default = "enabled_by_default")]
    enabled: bool,
    #[serde(default, alias = "name")]
    display_name: String,
    #[serde(default, alias = "service_type")]
    role: Option<String>,
    #[serde(default, alias = "working_dir", alias = "cwd")]
    working_dir: PathBuf,
    #[serde(default, alias = "command")]
    start_command: String,
    #[serde(default, alias = "tech_stack")]
    tech_stack: String,
    #[serde(default, alias = "port_config", alias = "port")]
    assigned_port: Option<RawPort>,
    #[serde(default, alias = "env_vars", alias = "env")]
    env_overrides: BTreeMap<String, String>,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPort {
    Bare(u16),
    Record(RawPortRecord),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPortRecord {
    #[serde(default)]
    port: Option<u16>,
    #[serde(default, alias = "original_port")]
    original_port: Option<u16>,
    #[serde(default, alias = "detected_port")]
    detected_port: Option<u16>,
    #[serde(default, alias = "port_source")]
    source: String,
    #[serde(default)]
    confidence: f32,
}

impl RawPort {
    fn into_assignment(self) -> Option<PortAssignment> {
        match self {
            RawPort::Bare(0) => None,
            RawPort::Bare(port) => Some(PortAssignment {
                port,
                original_port: Some(port),
                source: "migrated".to_string(),
                confidence: 0.5,
            }),
            RawPort::Record(record) => {
                let original_port = record.original_port.or(record.detected_port);
                let port = record.port.or(original_port).filter(|port| *port != 0)?;
                Some(PortAssignment {
                    port,
                    original_port,
                    source: record.source,
                    confidence: record.confidence.clamp(0.0, 1.0),
                })
            }
        }
    }
}

impl From<RawProject> for ProjectDescriptor {
    fn from(raw: RawProject) -> Self {
        let now = Utc::now();
        let services = raw
            .services
            .into_iter()
            .map(|(service_id, service)| {
                let role = service
                    .role
                    .as_deref()
                    .and_then(ServiceRole::parse)
                    .unwrap_or_else(|| ServiceRole::infer(&service_id));
                let display_name = if service.display_name.is_empty() {
                    service_id.clone()
                } else {
                    service.display_name
                };
                let descriptor = ServiceDescriptor {
                    enabled: service.enabled,
                    display_name,
                    role,
                    working_dir: service.working_dir,
                    start_command: service.start_command,
                    tech_stack: service.tech_stack,
                    assigned_port: service.assigned_port.and_then(RawPort::into_assignment),
                    env_overrides: service.env_overrides,
                };
                (service_id, descriptor)
            })
            .collect();
        let created_at = raw.created_at.unwrap_or(now);
        ProjectDescriptor {
            id: raw.id,
            name: raw.name,
            description: raw.description,
            path: raw.path,
            services,
            created_at,
            updated_at: raw.updated_at.unwrap_or(created_at),
            last_run_at: raw.last_run_at,
        }
    }
}

#[derive(Deserialize)]
struct StoredDocument {
    #[serde(default)]
    version: Option<serde_json::Value>,
    #[serde(default)]
    projects: Vec<ProjectDescriptor>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentOut<'a> {
    version: &'static str,
    #[serde(with = "timestamp")]
    last_updated: DateTime<Utc>,
    projects: Vec<&'a ProjectDescriptor>,
}

/// Persistent collection of project descriptors keyed by id.
pub struct ProjectStore {
    path: PathBuf,
    projects: Mutex<BTreeMap<String, ProjectDescriptor>>,
}

impl ProjectStore {
    /// Loads the document at `path`, migrating older layouts. A missing or
    /// malformed document yields an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut projects = BTreeMap::new();
        let mut migrated = false;
        if let Some(document) = persist::read_json::<StoredDocument>(&path) {
            let version = document.version.as_ref().and_then(|v| v.as_str());
            migrated = version != Some(DOCUMENT_VERSION) && !document.projects.is_empty();
            for mut project in document.projects {
                if project.id.is_empty() {
                    project.id = fallback_id(&project.name, &projects);
                }
                projects.insert(project.id.clone(), project);
            }
        }
        debug!(path = %path.display(), count = projects.len(), "loaded projects");
        let store = Self {
            path,
            projects: Mutex::new(projects),
        };
        if migrated {
            info!(path = %store.path.display(), "migrated legacy project document");
            store.save(&lock(&store.projects))?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, project_id: &str) -> Option<ProjectDescriptor> {
        lock(&self.projects).get(project_id).cloned()
    }

    pub fn all(&self) -> Vec<ProjectDescriptor> {
        lock(&self.projects).values().cloned().collect()
    }

    /// Case-insensitive match on name, description or path.
    pub fn search(&self, keyword: &str) -> Vec<ProjectDescriptor> {
        let keyword = keyword.to_lowercase();
        lock(&self.projects)
            .values()
            .filter(|project| project.matches(&keyword))
            .cloned()
            .collect()
    }

    /// Inserts or replaces a project, stamping `updated_at`.
    /// A slug of `name` that no stored project uses yet.
    pub fn unused_id(&self, name: &str) -> String {
        fallback_id(name, &lock(&self.projects))
    }

    pub fn upsert(&self, mut project: ProjectDescriptor) -> Result<ProjectDescriptor> {
        project.updated_at = Utc::now();
        let mut projects = lock(&self.projects);
        projects.insert(project.id.clone(), project.clone());
        self.save(&projects)?;
        Ok(project)
    }

    pub fn delete(&self, project_id: &str) -> Result<bool> {
        let mut projects = lock(&self.projects);
        if projects.remove(project_id).is_none() {
            return Ok(false);
        }
        self.save(&projects)?;
        Ok(true)
    }

    pub fn mark_run(&self, project_id: &str) -> Result<()> {
        let mut projects = lock(&self.projects);
        let project = projects
            .get_mut(project_id)
            .ok_or_else(|| Error::ProjectNotFound(project_id.to_string()))?;
        project.last_run_at = Some(Utc::now());
        self.save(&projects)
    }

    /// Records `assignment` for a service, keeping the first known original port.
    pub fn assign_port(
        &self,
        project_id: &str,
        service_id: &str,
        assignment: PortAssignment,
    ) -> Result<PortAssignment> {
        let mut projects = lock(&self.projects);
        let project = projects
            .get_mut(project_id)
            .ok_or_else(|| Error::ProjectNotFound(project_id.to_string()))?;
        let service = project
            .services
            .get_mut(service_id)
            .ok_or_else(|| Error::ServiceNotFound {
                project: project_id.to_string(),
                service: service_id.to_string(),
            })?;
        let assignment = match service.assigned_port.take() {
            Some(mut existing) => {
                existing.reassign(assignment.port);
                if existing.original_port.is_none() {
                    existing.original_port = assignment.original_port;
                }
                existing.source = assignment.source;
                existing.confidence = assignment.confidence;
                existing
            }
            None => assignment,
        };
        service.assigned_port = Some(assignment.clone());
        project.updated_at = Utc::now();
        self.save(&projects)?;
        Ok(assignment)
    }

    fn save(&self, projects: &BTreeMap<String, ProjectDescriptor>) -> Result<()> {
        persist::backup(&self.path)?;
        let document = DocumentOut {
            version: DOCUMENT_VERSION,
            last_updated: Utc::now(),
            projects: projects.values().collect(),
        };
        persist::write_json(&self.path, &document)
    }
}

fn fallback_id(name: &str, taken: &BTreeMap<String, ProjectDescriptor>) -> String {
    let slug: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let slug = slug.trim_matches('-');
    let base = if slug.is_empty() { "project" } else { slug };
    let mut candidate = base.to_string();
    let mut n = 2;
    while taken.contains_key(&candidate) {
        candidate = format!("{base}-{n}");
        n += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sample() -> ProjectDescriptor {
        ProjectDescriptor::new("shop", "Shop", "/work/shop")
            .with_service(
                "frontend",
                ServiceDescriptor::new("Web", ServiceRole::Frontend, "/work/shop/web", "npm run dev")
                    .with_port(PortAssignment::new(5173, "vite.config.ts")),
            )
            .with_service(
                "backend",
                ServiceDescriptor::new("API", ServiceRole::Backend, "/work/shop/api", "uvicorn main:app"),
            )
    }

    #[test]
    fn role_is_inferred_from_key() {
        assert_eq!(ServiceRole::infer("frontend"), ServiceRole::Frontend);
        assert_eq!(ServiceRole::infer("web-front"), ServiceRole::Frontend);
        assert_eq!(ServiceRole::infer("Backend"), ServiceRole::Backend);
        assert_eq!(ServiceRole::infer("api"), ServiceRole::Backend);
        assert_eq!(ServiceRole::infer("worker"), ServiceRole::Other);
    }

    #[test]
    fn reassign_keeps_first_original() {
        let mut assignment = PortAssignment::new(3000, "package.json");
        assert!(!assignment.is_overridden());
        assignment.reassign(3001);
        assert_eq!(assignment.original_port, Some(3000));
        assert!(assignment.is_overridden());
        assignment.reassign(3002);
        assert_eq!(assignment.original_port, Some(3000));
        assignment.reassign(3000);
        assert!(!assignment.is_overridden());
    }

    #[test]
    fn store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("projects.json");
        let store = ProjectStore::open(&path).unwrap();
        let saved = store.upsert(sample()).unwrap();

        let reloaded = ProjectStore::open(&path).unwrap();
        assert_eq!(reloaded.get("shop"), Some(saved));

        let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], "2.0");
        assert!(raw["lastUpdated"].is_string());
        assert_eq!(raw["projects"][0]["services"]["frontend"]["assignedPort"]["port"], 5173);
    }

    #[test]
    fn unused_id_avoids_stored_projects() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::open(dir.path().join("projects.json")).unwrap();
        assert_eq!(store.unused_id("Shop"), "shop");
        store.upsert(sample()).unwrap();
        assert_eq!(store.unused_id("Shop"), "shop-2");
        assert_eq!(store.unused_id("My App!"), "my-app");
        assert_eq!(store.unused_id("///"), "project");
    }

    #[test]
    fn save_keeps_a_backup_of_the_previous_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("projects.json");
        let store = ProjectStore::open(&path).unwrap();
        store.upsert(sample()).unwrap();
        assert!(!persist::backup_path(&path).exists());
        store.mark_run("shop").unwrap();
        let backup = fs::read_to_string(persist::backup_path(&path)).unwrap();
        assert!(backup.contains("\"lastRunAt\": null"));
        assert!(store.get("shop").unwrap().last_run_at.is_some());
    }

    #[test]
    fn legacy_document_is_migrated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("projects.json");
        fs::write(
            &path,
            r#"{
              "projects": [{
                "id": "legacy",
                "name": "Legacy",
                "path": "/old",
                "created_at": "2024-05-01T12:00:00.000001",
                "services": {
                  "frontend": {"enabled": true, "name": "UI", "command": "npm start", "cwd": "/old/ui", "port": 3000, "env": {"BROWSER": "none"}},
                  "api": {"enabled": false, "name": "", "command": "python app.py", "cwd": "/old/api", "port": null, "env": {}}
                }
              }]
            }"#,
        )
        .unwrap();

        let store = ProjectStore::open(&path).unwrap();
        let project = store.get("legacy").unwrap();
        let ui = &project.services["frontend"];
        assert_eq!(ui.role, ServiceRole::Frontend);
        assert_eq!(ui.working_dir, PathBuf::from("/old/ui"));
        assert_eq!(ui.start_command, "npm start");
        assert_eq!(ui.env_overrides["BROWSER"], "none");
        let port = ui.assigned_port.clone().unwrap();
        assert_eq!((port.port, port.original_port), (3000, Some(3000)));

        let api = &project.services["api"];
        assert_eq!(api.role, ServiceRole::Backend);
        assert_eq!(api.display_name, "api");
        assert!(!api.enabled);
        assert_eq!(api.assigned_port, None);

        // Rewritten in the current layout, old file kept as backup.
        let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], "2.0");
        assert!(persist::backup_path(&path).exists());
    }

    #[test]
    fn port_record_layout_is_understood() {
        let raw = r#"{
          "id": "p", "name": "P",
          "services": {"backend": {
            "name": "API", "service_type": "backend", "working_dir": "/p/api", "command": "uvicorn main:app",
            "port_config": {"port": 8001, "original_port": null, "detected_port": 8000, "port_source": "main.py", "confidence": 0.9}
          }}
        }"#;
        let project: ProjectDescriptor = serde_json::from_str(raw).unwrap();
        let port = project.services["backend"].assigned_port.clone().unwrap();
        assert_eq!(port.port, 8001);
        assert_eq!(port.original_port, Some(8000));
        assert!(port.is_overridden());
        assert_eq!(port.source, "main.py");
    }

    #[test]
    fn assign_port_preserves_original_detection() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::open(dir.path().join("projects.json")).unwrap();
        store.upsert(sample()).unwrap();

        let updated = store
            .assign_port("shop", "frontend", PortAssignment::new(5174, "user"))
            .unwrap();
        assert_eq!(updated.port, 5174);
        assert_eq!(updated.original_port, Some(5173));

        let err = store
            .assign_port("shop", "worker", PortAssignment::new(1, "user"))
            .unwrap_err();
        assert!(matches!(err, Error::ServiceNotFound { .. }));
        assert!(matches!(
            store.mark_run("missing"),
            Err(Error::ProjectNotFound(_))
        ));
    }

    #[test]
    fn search_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::open(dir.path().join("projects.json")).unwrap();
        store.upsert(sample()).unwrap();
        assert_eq!(store.search("SHOP").len(), 1);
        assert!(store.search("blog").is_empty());
        assert!(store.delete("shop").unwrap());
        assert!(!store.delete("shop").unwrap());
        assert!(store.all().is_empty());
    }
}
