//! Whole-project detection: walks a directory tree looking for one frontend
//! and one backend service, with a start command and port for each.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use super::{detect_env_port_override, PortDetectionResult, PortSourceDetector};
use crate::ports::stack::{default_port, detect_tech_stack, CUSTOM_STACK};
use crate::project::{PortAssignment, ProjectDescriptor, ServiceDescriptor, ServiceRole};

/// Interpreter used in generated Python start commands.
pub const PYTHON_ENV_VAR: &str = "PORTRACK_PYTHON";

const MAX_DEPTH: usize = 3;
/// A service found with more confidence than this is not looked for again.
const SETTLED: f32 = 0.8;
const FALLBACK_CONFIDENCE: f32 = 0.5;
const SNIFF_BYTES: u64 = 5000;

const PRIORITY_DIRS: &[&str] = &["backend", "server", "api", "frontend", "client", "web", "web_app", "src"];
const SKIPPED_DIRS: &[&str] = &["node_modules", "__pycache__", "venv", ".venv", "dist", "build"];
const PYTHON_ENTRYPOINTS: &[&str] = &["main.py", "app.py", "server.py", "run.py"];
const NODE_ENTRYPOINTS: &[&str] = &["server.js", "app.js", "index.js"];

const NODE_BACKEND_MARKERS: &[&str] = &["express", "koa", "fastify", "hapi", "nest"];
const NODE_FRONTEND_MARKERS: &[&str] = &["react", "vue", "angular", "@angular", "svelte", "vite"];

struct Framework {
    stack: &'static str,
    markers: &'static [&'static str],
    command: &'static str,
    default_port: u16,
}

const FRONTEND_FRAMEWORKS: &[Framework] = &[
    Framework { stack: "vite", markers: &["vite", "@vitejs"], command: "npm run dev", default_port: 5173 },
    Framework { stack: "create-react-app", markers: &["react-scripts"], command: "npm start", default_port: 3000 },
    Framework { stack: "next", markers: &["next"], command: "npm run dev", default_port: 3000 },
    Framework { stack: "vue-cli", markers: &["@vue/cli-service"], command: "npm run serve", default_port: 8080 },
    Framework { stack: "nuxt", markers: &["nuxt"], command: "npm run dev", default_port: 3000 },
    Framework { stack: "angular", markers: &["@angular/cli"], command: "ng serve", default_port: 4200 },
];

/// Run scripts that replace a framework's default command, in preference order.
const SCRIPT_COMMANDS: &[(&str, &str)] = &[("dev", "npm run dev"), ("start", "npm start"), ("serve", "npm run serve")];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectedService {
    pub display_name: String,
    pub role: ServiceRole,
    pub working_dir: PathBuf,
    pub command: String,
    pub tech_stack: String,
    /// How sure the walk is that this directory holds the service.
    pub confidence: f32,
    pub port: Option<u16>,
    pub port_source: PortDetectionResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectedProject {
    pub name: String,
    pub path: PathBuf,
    pub frontend: Option<DetectedService>,
    pub backend: Option<DetectedService>,
}

impl DetectedProject {
    pub fn is_empty(&self) -> bool {
        self.frontend.is_none() && self.backend.is_none()
    }

    /// Descriptor with services keyed `frontend` and `backend`.
    pub fn into_descriptor(self, id: impl Into<String>) -> ProjectDescriptor {
        let mut project = ProjectDescriptor::new(id, self.name, self.path);
        for (key, service) in [("frontend", self.frontend), ("backend", self.backend)] {
            let Some(service) = service else {
                continue;
            };
            let mut descriptor =
                ServiceDescriptor::new(service.display_name, service.role, service.working_dir, service.command);
            descriptor.tech_stack = service.tech_stack;
            if let Some(port) = service.port {
                descriptor = descriptor.with_port(PortAssignment::from_detection(port, &service.port_source));
            }
            project = project.with_service(key, descriptor);
        }
        project
    }
}

impl PortSourceDetector {
    /// Walks `dir` up to three levels deep, well-known service directories
    /// first, and reports the most convincing frontend and backend found.
    pub fn detect_project(&self, dir: &Path) -> DetectedProject {
        let path = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let mut scan = Scan {
            detector: *self,
            python: std::env::var(PYTHON_ENV_VAR).unwrap_or_else(|_| "python".to_string()),
            project: DetectedProject {
                name,
                path: path.clone(),
                frontend: None,
                backend: None,
            },
        };
        scan.walk(&path, 0);
        scan.project
    }
}

struct Scan {
    detector: PortSourceDetector,
    python: String,
    project: DetectedProject,
}

impl Scan {
    fn walk(&mut self, dir: &Path, depth: usize) {
        if depth > MAX_DEPTH {
            return;
        }
        let mut entries: Vec<(String, bool)> = match fs::read_dir(dir) {
            Ok(entries) => entries
                .flatten()
                .map(|entry| {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let is_dir = entry.path().is_dir();
                    (name, is_dir)
                })
                .collect(),
            Err(err) => {
                debug!(dir = %dir.display(), error = %err, "skipping unreadable directory");
                return;
            }
        };
        entries.sort();
        let has = |file: &str| entries.iter().any(|(name, is_dir)| !is_dir && name == file);

        self.check_backend(dir, &has);
        self.check_frontend(dir, &has);

        for priority in PRIORITY_DIRS {
            if entries.iter().any(|(name, is_dir)| *is_dir && name == priority) {
                self.walk(&dir.join(priority), depth + 1);
            }
        }
        for (name, is_dir) in &entries {
            if !is_dir
                || name.starts_with('.')
                || PRIORITY_DIRS.contains(&name.as_str())
                || SKIPPED_DIRS.contains(&name.as_str())
            {
                continue;
            }
            self.walk(&dir.join(name), depth + 1);
        }
    }

    fn check_backend(&mut self, dir: &Path, has: &dyn Fn(&str) -> bool) {
        if settled(&self.project.backend) {
            return;
        }

        for file in PYTHON_ENTRYPOINTS.iter().copied().filter(|file| has(file)) {
            let (framework, confidence) = sniff_python(&dir.join(file));
            if confidence <= current_confidence(&self.project.backend) {
                continue;
            }
            let command = if framework == "django" {
                format!("{} manage.py runserver", self.python)
            } else {
                format!("{} {file}", self.python)
            };
            let stack = if framework == "python" {
                let refined = detect_tech_stack(&command, dir);
                if refined == CUSTOM_STACK {
                    framework.to_string()
                } else {
                    refined
                }
            } else {
                framework.to_string()
            };
            self.project.backend = Some(self.backend(dir, command, stack, confidence, None));
        }

        if has("manage.py") {
            let command = format!("{} manage.py runserver", self.python);
            self.project.backend = Some(self.backend(dir, command, "django".to_string(), 0.9, Some(8000)));
        }

        if self.project.backend.is_none() && has("package.json") && is_node_backend(&dir.join("package.json")) {
            if let Some(file) = NODE_ENTRYPOINTS.iter().find(|file| has(file)) {
                let command = format!("node {file}");
                self.project.backend = Some(self.backend(dir, command, "express".to_string(), 0.7, Some(3000)));
            }
        }

        if self.project.backend.is_none() && has("main.go") {
            let command = "go run main.go".to_string();
            self.project.backend = Some(self.backend(dir, command, "go".to_string(), 0.8, Some(8080)));
        }
    }

    fn backend(
        &self,
        dir: &Path,
        command: String,
        stack: String,
        confidence: f32,
        fallback: Option<u16>,
    ) -> DetectedService {
        let found = self.detector.detect_backend_port(dir);
        let fallback = fallback.or_else(|| default_port(&stack));
        let port_source = resolve_port(found, &command, &stack, fallback);
        debug!(dir = %dir.display(), stack = %stack, port = ?port_source.port, "backend candidate");
        DetectedService {
            display_name: format!("backend ({stack})"),
            role: ServiceRole::Backend,
            working_dir: dir.to_path_buf(),
            command,
            tech_stack: stack,
            confidence,
            port: port_source.port,
            port_source,
        }
    }

    fn check_frontend(&mut self, dir: &Path, has: &dyn Fn(&str) -> bool) {
        if settled(&self.project.frontend) || !has("package.json") {
            return;
        }
        let manifest = dir.join("package.json");
        if is_node_backend(&manifest) {
            return;
        }
        let guess = frontend_framework(&manifest);
        if guess.confidence <= current_confidence(&self.project.frontend) {
            return;
        }

        let stack = guess.framework.map_or("react", |framework| framework.stack).to_string();
        let backend_port = self.project.backend.as_ref().and_then(|backend| backend.port);
        let fallback = guess
            .framework
            .map(|framework| framework.default_port)
            .or_else(|| default_port(&stack))
            .filter(|port| Some(*port) != backend_port);
        let found = self.detector.detect_frontend_port(dir);
        let port_source = resolve_port(found, &guess.command, &stack, fallback);
        debug!(dir = %dir.display(), stack = %stack, port = ?port_source.port, "frontend candidate");

        self.project.frontend = Some(DetectedService {
            display_name: format!("frontend ({stack})"),
            role: ServiceRole::Frontend,
            working_dir: dir.to_path_buf(),
            command: guess.command,
            tech_stack: stack,
            confidence: guess.confidence,
            port: port_source.port,
            port_source,
        });
    }
}

fn current_confidence(service: &Option<DetectedService>) -> f32 {
    service.as_ref().map_or(0.0, |service| service.confidence)
}

fn settled(service: &Option<DetectedService>) -> bool {
    current_confidence(service) > SETTLED
}

/// Command override, then what the files say, then the stack's conventional port.
fn resolve_port(found: PortDetectionResult, command: &str, stack: &str, fallback: Option<u16>) -> PortDetectionResult {
    if let Some((var, port)) = detect_env_port_override(command) {
        return PortDetectionResult::from_command(var, port);
    }
    if found.port.is_some() {
        return found;
    }
    match fallback {
        Some(port) => PortDetectionResult {
            port: Some(port),
            provenance: "default".to_string(),
            confidence: FALLBACK_CONFIDENCE,
            env_var: found.env_var,
            details: format!("conventional port for {stack}"),
        },
        None => found,
    }
}

/// Framework named by the head of a Python entry file.
fn sniff_python(path: &Path) -> (&'static str, f32) {
    let mut head = Vec::new();
    let read = fs::File::open(path).and_then(|file| file.take(SNIFF_BYTES).read_to_end(&mut head));
    if read.is_err() {
        return ("python", 0.3);
    }
    let text = String::from_utf8_lossy(&head).to_lowercase();
    if text.contains("fastapi") {
        ("fastapi", 0.9)
    } else if text.contains("flask") {
        ("flask", 0.9)
    } else if text.contains("django") {
        ("django", 0.8)
    } else if text.contains("uvicorn") || text.contains("gunicorn") {
        ("fastapi", 0.7)
    } else {
        ("python", 0.5)
    }
}

fn read_manifest(path: &Path) -> Option<serde_json::Value> {
    let text = fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

fn has_key(manifest: &serde_json::Value, table: &str, key: &str) -> bool {
    manifest.get(table).and_then(|table| table.get(key)).is_some()
}

/// Runtime dependencies name a server framework and no UI framework.
fn is_node_backend(path: &Path) -> bool {
    let Some(manifest) = read_manifest(path) else {
        return false;
    };
    let depends = |markers: &[&str]| markers.iter().any(|marker| has_key(&manifest, "dependencies", marker));
    depends(NODE_BACKEND_MARKERS) && !depends(NODE_FRONTEND_MARKERS)
}

struct FrontendGuess {
    framework: Option<&'static Framework>,
    command: String,
    confidence: f32,
}

fn frontend_framework(path: &Path) -> FrontendGuess {
    let Some(manifest) = read_manifest(path) else {
        return FrontendGuess {
            framework: None,
            command: "npm run dev".to_string(),
            confidence: 0.3,
        };
    };
    let script_command = SCRIPT_COMMANDS
        .iter()
        .find(|(script, _)| has_key(&manifest, "scripts", script))
        .map(|(_, command)| *command);

    let framework = FRONTEND_FRAMEWORKS.iter().find(|framework| {
        framework.markers.iter().any(|marker| {
            has_key(&manifest, "dependencies", marker) || has_key(&manifest, "devDependencies", marker)
        })
    });
    if let Some(framework) = framework {
        return FrontendGuess {
            framework: Some(framework),
            command: script_command.unwrap_or(framework.command).to_string(),
            confidence: 0.9,
        };
    }

    let (command, confidence) = if has_key(&manifest, "scripts", "dev") {
        ("npm run dev", 0.6)
    } else if has_key(&manifest, "scripts", "start") {
        ("npm start", 0.6)
    } else {
        ("npm run dev", 0.3)
    };
    FrontendGuess {
        framework: None,
        command: command.to_string(),
        confidence,
    }
}
