//! Development processes started outside portrack.
//!
//! A host process list is narrowed to interpreters, package runners and dev
//! servers, then each process is attributed to a stored project by its
//! working directory or by a project path on its command line.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::ports::{HostProcess, SystemProbe};
use crate::project::{ProjectDescriptor, ServiceRole};

/// Program names, without extension or version suffix, that run dev services.
const DEV_PROGRAMS: &[&str] = &[
    "python", "pythonw", "node", "npm", "npx", "yarn", "pnpm", "bun", "deno", "java", "go", "uvicorn",
    "gunicorn", "flask", "cmd", "powershell", "pwsh",
];

/// Command-line fragments of dev servers run through some other program.
const DEV_COMMAND_MARKERS: &[&str] = &[
    "uvicorn",
    "gunicorn",
    "flask",
    "manage.py",
    "vite",
    "webpack",
    "react-scripts",
    "next dev",
];

const NODE_PROGRAMS: &[&str] = &["node", "npm", "npx", "yarn", "pnpm", "bun"];
const PYTHON_PROGRAMS: &[&str] = &["python", "pythonw", "uvicorn", "gunicorn", "flask"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalProcess {
    pub pid: u32,
    pub name: String,
    pub cwd: Option<PathBuf>,
    pub command_line: String,
    pub project_id: Option<String>,
    pub service_id: Option<String>,
}

impl From<HostProcess> for ExternalProcess {
    fn from(process: HostProcess) -> Self {
        Self {
            pid: process.pid,
            name: process.name,
            cwd: process.cwd,
            command_line: process.command_line,
            project_id: None,
            service_id: None,
        }
    }
}

/// Dev-related processes on the host, this one excluded.
pub fn scan_processes(probe: &SystemProbe) -> Vec<ExternalProcess> {
    let me = std::process::id();
    let processes: Vec<ExternalProcess> = probe
        .processes()
        .into_iter()
        .filter(|process| process.pid != me && is_dev_process(&process.name, &process.command_line))
        .map(ExternalProcess::from)
        .collect();
    debug!(count = processes.len(), "dev processes found");
    processes
}

/// Lowercased program name with directory, `.exe` and version suffix removed:
/// `C:\Python311\python3.11.exe` becomes `python`.
fn program_stem(program: &str) -> String {
    let base = program.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(program);
    let base = base.to_lowercase();
    let base = base.strip_suffix(".exe").unwrap_or(&base);
    base.trim_end_matches(|c: char| c.is_ascii_digit() || c == '.').to_string()
}

fn first_token(command_line: &str) -> &str {
    command_line.split_whitespace().next().unwrap_or("")
}

fn is_dev_process(name: &str, command_line: &str) -> bool {
    let known = |program: &str| DEV_PROGRAMS.contains(&program_stem(program).as_str());
    if known(name) || known(first_token(command_line)) {
        return true;
    }
    let command_line = command_line.to_lowercase();
    DEV_COMMAND_MARKERS.iter().any(|marker| command_line.contains(marker))
}

/// Case-folded, forward slashes, no trailing slash.
fn normalize(path: &Path) -> String {
    path.to_string_lossy()
        .to_lowercase()
        .replace('\\', "/")
        .trim_end_matches('/')
        .to_string()
}

fn within(path: &str, root: &str) -> bool {
    path == root || path.strip_prefix(root).is_some_and(|rest| rest.starts_with('/'))
}

/// `root` appears in `command_line` as a whole path or a path prefix.
fn mentions(command_line: &str, root: &str) -> bool {
    command_line.match_indices(root).any(|(at, _)| {
        matches!(
            command_line[at + root.len()..].chars().next(),
            None | Some('/' | ' ' | '"' | '\'')
        )
    })
}

struct Evidence {
    cwd: Option<String>,
    command_line: String,
}

impl Evidence {
    fn of(process: &ExternalProcess) -> Self {
        Self {
            cwd: process.cwd.as_deref().map(normalize),
            command_line: process.command_line.to_lowercase().replace('\\', "/"),
        }
    }

    fn points_into(&self, root: &str) -> bool {
        if root.is_empty() {
            return false;
        }
        self.cwd.as_deref().is_some_and(|cwd| within(cwd, root)) || mentions(&self.command_line, root)
    }
}

/// Fills `project_id` and `service_id` of every process that points into a
/// stored project. The deepest matching project root wins; within it, the
/// deepest matching service directory, and on a tie the service whose role
/// fits the program.
pub fn match_to_projects(processes: &mut [ExternalProcess], projects: &[ProjectDescriptor]) {
    for process in processes.iter_mut() {
        let evidence = Evidence::of(process);
        let project = projects
            .iter()
            .map(|project| (normalize(&project.path), project))
            .filter(|(root, _)| evidence.points_into(root))
            .max_by_key(|(root, _)| root.len());
        let Some((_, project)) = project else {
            continue;
        };
        process.project_id = Some(project.id.clone());
        process.service_id = match_service(process, &evidence, project);
        debug!(
            pid = process.pid,
            project = %project.id,
            service = ?process.service_id,
            "process attributed"
        );
    }
}

/// Where a service runs, normalized; relative directories hang off `root`.
fn service_dir(root: &str, working_dir: &Path) -> String {
    let dir = normalize(working_dir);
    let dir = dir.trim_start_matches("./");
    if dir.is_empty() || dir == "." {
        root.to_string()
    } else if dir.starts_with('/') || dir.as_bytes().get(1) == Some(&b':') {
        dir.to_string()
    } else {
        format!("{root}/{dir}")
    }
}

fn match_service(process: &ExternalProcess, evidence: &Evidence, project: &ProjectDescriptor) -> Option<String> {
    let root = normalize(&project.path);
    let dirs: Vec<(&str, String, ServiceRole)> = project
        .services
        .iter()
        .map(|(id, service)| (id.as_str(), service_dir(&root, &service.working_dir), service.role))
        .collect();

    let deepest = dirs
        .iter()
        .filter(|(_, dir, _)| evidence.points_into(dir))
        .map(|(_, dir, _)| dir.len())
        .max();
    let candidates: Vec<&(&str, String, ServiceRole)> = match deepest {
        Some(depth) => dirs
            .iter()
            .filter(|(_, dir, _)| dir.len() == depth && evidence.points_into(dir))
            .collect(),
        None => dirs.iter().collect(),
    };
    if let (Some(_), [(id, _, _)]) = (deepest, candidates.as_slice()) {
        return Some(id.to_string());
    }

    let role = likely_role(process)?;
    candidates
        .iter()
        .find(|(_, _, candidate)| *candidate == role)
        .map(|(id, _, _)| id.to_string())
}

fn likely_role(process: &ExternalProcess) -> Option<ServiceRole> {
    let stems = [program_stem(&process.name), program_stem(first_token(&process.command_line))];
    let command_line = process.command_line.to_lowercase();
    if stems.iter().any(|stem| NODE_PROGRAMS.contains(&stem.as_str())) || command_line.contains("npm") {
        Some(ServiceRole::Frontend)
    } else if stems.iter().any(|stem| PYTHON_PROGRAMS.contains(&stem.as_str())) {
        Some(ServiceRole::Backend)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::ServiceDescriptor;

    fn process(pid: u32, name: &str, cwd: Option<&str>, command_line: &str) -> ExternalProcess {
        ExternalProcess {
            pid,
            name: name.to_string(),
            cwd: cwd.map(PathBuf::from),
            command_line: command_line.to_string(),
            project_id: None,
            service_id: None,
        }
    }

    fn projects() -> Vec<ProjectDescriptor> {
        vec![
            ProjectDescriptor::new("shop", "Shop", "/home/dev/shop")
                .with_service(
                    "frontend",
                    ServiceDescriptor::new("Web", ServiceRole::Frontend, "/home/dev/shop/web", "npm run dev"),
                )
                .with_service(
                    "backend",
                    ServiceDescriptor::new("API", ServiceRole::Backend, "/home/dev/shop/api", "python main.py"),
                ),
            ProjectDescriptor::new("admin", "Admin", "/home/dev/shop/tools/admin"),
            ProjectDescriptor::new("blog", "Blog", "C:\\Work\\Blog")
                .with_service("site", ServiceDescriptor::new("Site", ServiceRole::Frontend, ".", "npm start"))
                .with_service("server", ServiceDescriptor::new("Server", ServiceRole::Backend, ".", "python app.py")),
            ProjectDescriptor::new("empty", "Empty", ""),
        ]
    }

    fn attribution(process: &ExternalProcess) -> (Option<&str>, Option<&str>) {
        (process.project_id.as_deref(), process.service_id.as_deref())
    }

    #[test]
    fn program_stems() {
        assert_eq!(program_stem("C:\\Python311\\python3.11.exe"), "python");
        assert_eq!(program_stem("/usr/bin/python3"), "python");
        assert_eq!(program_stem("Node.exe"), "node");
        assert_eq!(program_stem("pwsh"), "pwsh");
    }

    #[test]
    fn dev_processes_by_name_or_command() {
        assert!(is_dev_process("node", "node server.js"));
        assert!(is_dev_process("MainThread", "/usr/bin/python3 -m http.server"));
        assert!(is_dev_process("sh", "sh -c vite --port 5173"));
        assert!(!is_dev_process("sshd", "sshd: dev@pts/0"));
        assert!(!is_dev_process("nodejs-helper", ""));
    }

    #[test]
    fn attributes_by_cwd_and_command_line() {
        let mut processes = vec![
            process(1, "node", Some("/home/dev/shop/web/src"), "node vite.js"),
            process(2, "python3", None, "python3 /home/dev/shop/api/main.py"),
            process(3, "node", Some("/home/dev/shopping"), "node index.js"),
            process(4, "python", Some("/home/dev/shop/tools/admin/"), "python manage.py runserver"),
            process(5, "java", Some("/home/dev/shop"), "java -jar tool.jar"),
        ];
        match_to_projects(&mut processes, &projects());
        assert_eq!(attribution(&processes[0]), (Some("shop"), Some("frontend")));
        assert_eq!(attribution(&processes[1]), (Some("shop"), Some("backend")));
        assert_eq!(attribution(&processes[2]), (None, None));
        assert_eq!(attribution(&processes[3]), (Some("admin"), None));
        assert_eq!(attribution(&processes[4]), (Some("shop"), None));
    }

    #[test]
    fn shared_service_directory_falls_back_to_program_role() {
        let mut processes = vec![
            process(1, "node.exe", Some("c:/work/blog"), "node.exe server.js"),
            process(2, "python.exe", Some("C:\\Work\\Blog\\"), "python.exe app.py"),
            process(3, "cmd.exe", None, "cmd.exe /c npm start --prefix \"C:\\Work\\Blog\""),
            process(4, "go.exe", Some("C:\\Work\\Blog"), "go run ."),
        ];
        match_to_projects(&mut processes, &projects());
        assert_eq!(attribution(&processes[0]), (Some("blog"), Some("site")));
        assert_eq!(attribution(&processes[1]), (Some("blog"), Some("server")));
        assert_eq!(attribution(&processes[2]), (Some("blog"), Some("site")));
        assert_eq!(attribution(&processes[3]), (Some("blog"), None));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn scan_excludes_this_process() {
        let me = std::process::id();
        assert!(scan_processes(&SystemProbe).iter().all(|process| process.pid != me));
    }
}
