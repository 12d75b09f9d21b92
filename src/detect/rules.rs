//! Artifact checks, as data.
//!
//! Each check names the files it may read, the literal-port patterns and the
//! environment-variable markers it looks for, and the confidence above which
//! its result ends the search.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use super::PortDetectionResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    /// `scripts.dev` / `scripts.start` / `scripts.serve` of package.json.
    PackageScripts,
    /// Whole-file text of the first candidate that yields a result.
    Text,
}

pub(crate) struct EnvRule {
    pub var: &'static str,
    /// Any of these substrings marks a read of `var`.
    pub markers: &'static [&'static str],
    /// Alternatively, any of these patterns.
    pub patterns: &'static [&'static str],
    pub confidence: f32,
    pub details: &'static str,
}

pub(crate) struct CheckSpec {
    pub name: &'static str,
    pub source: Source,
    pub files: &'static [&'static str],
    /// First capture group is the port.
    pub literals: &'static [&'static str],
    pub literal_confidence: f32,
    pub literal_details: &'static str,
    pub env: Option<EnvRule>,
    pub threshold: f32,
}

const ENV_FILES: &[&str] = &[".env", ".env.local", ".env.development", ".env.dev"];
const ENV_FILE_LITERALS: &[&str] = &[
    r"(?m)^PORT\s*=\s*(\d+)",
    r"(?m)^VITE_PORT\s*=\s*(\d+)",
    r"(?m)^REACT_APP_PORT\s*=\s*(\d+)",
    r"(?m)^VUE_APP_PORT\s*=\s*(\d+)",
];

pub(crate) const FRONTEND_CHECKS: &[CheckSpec] = &[
    CheckSpec {
        name: "package.json",
        source: Source::PackageScripts,
        files: &["package.json"],
        literals: &[
            r"--port[=\s]+(\d+)",
            r"-p[=\s]+(\d+)",
            r"PORT[=\s]+(\d+)",
            r"port[=\s]+(\d+)",
        ],
        literal_confidence: 0.9,
        literal_details: "port flag in run script",
        env: Some(EnvRule {
            var: "PORT",
            markers: &["PORT"],
            patterns: &[],
            confidence: 0.6,
            details: "run script reads PORT",
        }),
        threshold: 0.7,
    },
    CheckSpec {
        name: "vite config",
        source: Source::Text,
        files: &["vite.config.js", "vite.config.ts", "vite.config.mjs"],
        literals: &[
            r"server\s*:\s*\{[^}]*port\s*:\s*(\d+)",
            r"port\s*:\s*(\d+)",
            r"PORT\s*:\s*(\d+)",
        ],
        literal_confidence: 0.95,
        literal_details: "server.port in vite config",
        env: Some(EnvRule {
            var: "PORT",
            markers: &["process.env.PORT", "import.meta.env.PORT"],
            patterns: &[],
            confidence: 0.7,
            details: "vite config reads PORT",
        }),
        threshold: 0.8,
    },
    CheckSpec {
        name: "env files",
        source: Source::Text,
        files: ENV_FILES,
        literals: ENV_FILE_LITERALS,
        literal_confidence: 0.85,
        literal_details: "port variable in env file",
        env: None,
        threshold: 0.7,
    },
    CheckSpec {
        name: "vue config",
        source: Source::Text,
        files: &["vue.config.js"],
        literals: &[r"devServer\s*:\s*\{[^}]*port\s*:\s*(\d+)", r"port\s*:\s*(\d+)"],
        literal_confidence: 0.9,
        literal_details: "devServer.port in vue config",
        env: None,
        threshold: 0.8,
    },
    CheckSpec {
        name: "webpack config",
        source: Source::Text,
        files: &["webpack.config.js"],
        literals: &[r"devServer\s*:\s*\{[^}]*port\s*:\s*(\d+)"],
        literal_confidence: 0.9,
        literal_details: "devServer.port in webpack config",
        env: None,
        threshold: 0.7,
    },
    CheckSpec {
        name: "next config",
        source: Source::Text,
        files: &["next.config.js"],
        literals: &[],
        literal_confidence: 0.0,
        literal_details: "",
        env: Some(EnvRule {
            var: "PORT",
            markers: &["PORT"],
            patterns: &[],
            confidence: 0.7,
            details: "next.js takes its port from PORT",
        }),
        threshold: 0.8,
    },
];

pub(crate) const BACKEND_CHECKS: &[CheckSpec] = &[
    CheckSpec {
        name: "python entrypoint",
        source: Source::Text,
        files: &["main.py", "app.py", "run.py", "server.py"],
        literals: &[
            r"(?mi)uvicorn\.run\([^)]*port\s*=\s*(\d+)",
            r"(?mi)\.run\([^)]*port\s*=\s*(\d+)",
            r"(?mi)^PORT\s*=\s*(\d+)",
            r"(?mi)^port\s*=\s*(\d+)",
            r"(?mi)--port[=\s]+(\d+)",
        ],
        literal_confidence: 0.9,
        literal_details: "port literal in python source",
        env: Some(EnvRule {
            var: "PORT",
            markers: &[],
            patterns: &[
                r#"os\.environ(?:\[|\.get\()\s*["']PORT["']"#,
                r#"os\.getenv\(\s*["']PORT["']"#,
            ],
            confidence: 0.75,
            details: "python source reads PORT",
        }),
        threshold: 0.7,
    },
    CheckSpec {
        name: "env files",
        source: Source::Text,
        files: ENV_FILES,
        literals: ENV_FILE_LITERALS,
        literal_confidence: 0.85,
        literal_details: "port variable in env file",
        env: None,
        threshold: 0.7,
    },
    CheckSpec {
        name: "node entrypoint",
        source: Source::Text,
        files: &[
            "server.js",
            "app.js",
            "index.js",
            "src/server.js",
            "src/app.js",
            "src/index.js",
        ],
        literals: &[
            r"(?:const|let|var)\s+PORT\s*=\s*(\d+)",
            r"\.listen\(\s*(\d+)",
            r"port\s*:\s*(\d+)",
        ],
        literal_confidence: 0.85,
        literal_details: "port literal in node source",
        env: Some(EnvRule {
            var: "PORT",
            markers: &["process.env.PORT"],
            patterns: &[],
            confidence: 0.7,
            details: "node source reads PORT",
        }),
        threshold: 0.7,
    },
];

const PACKAGE_SCRIPTS: &[&str] = &["dev", "start", "serve"];

/// Regex cache keyed by pattern text; patterns that fail to compile are skipped.
fn compiled(pattern: &'static str) -> Option<&'static Regex> {
    static CACHE: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| {
        FRONTEND_CHECKS
            .iter()
            .chain(BACKEND_CHECKS)
            .flat_map(|check| {
                let env_patterns = check.env.as_ref().map(|env| env.patterns).unwrap_or(&[]);
                check.literals.iter().chain(env_patterns)
            })
            .filter_map(|pattern| Regex::new(pattern).ok().map(|re| (*pattern, re)))
            .collect()
    });
    cache
        .iter()
        .find(|(source, _)| *source == pattern)
        .map(|(_, re)| re)
}

/// First in-range port captured by any of `patterns`, in pattern order.
fn find_literal(text: &str, patterns: &[&'static str]) -> Option<u16> {
    patterns.iter().filter_map(|pattern| compiled(*pattern)).find_map(|re| {
        re.captures_iter(text)
            .filter_map(|caps| caps.get(1)?.as_str().parse::<u32>().ok())
            .find_map(|port| u16::try_from(port).ok().filter(|port| *port != 0))
    })
}

impl EnvRule {
    fn matches(&self, text: &str) -> bool {
        self.markers.iter().any(|marker| text.contains(marker))
            || self
                .patterns
                .iter()
                .filter_map(|pattern| compiled(*pattern))
                .any(|re| re.is_match(text))
    }
}

impl CheckSpec {
    /// Applies the check to `text`, labelling any result with `provenance`.
    fn apply(&self, text: &str, provenance: String) -> Option<PortDetectionResult> {
        if let Some(port) = find_literal(text, self.literals) {
            return Some(PortDetectionResult {
                port: Some(port),
                provenance,
                confidence: self.literal_confidence,
                env_var: None,
                details: self.literal_details.to_string(),
            });
        }
        let env = self.env.as_ref().filter(|env| env.matches(text))?;
        Some(PortDetectionResult {
            port: None,
            provenance,
            confidence: env.confidence,
            env_var: Some(env.var.to_string()),
            details: env.details.to_string(),
        })
    }

    pub(crate) fn evaluate(&self, dir: &Path) -> Option<PortDetectionResult> {
        match self.source {
            Source::PackageScripts => self.evaluate_scripts(dir),
            Source::Text => self.files.iter().find_map(|file| {
                let text = read_lossy(&dir.join(file))?;
                self.apply(&text, (*file).to_string())
            }),
        }
    }

    fn evaluate_scripts(&self, dir: &Path) -> Option<PortDetectionResult> {
        let file = self.files.first()?;
        let text = read_lossy(&dir.join(file))?;
        let manifest: serde_json::Value = match serde_json::from_str(&text) {
            Ok(manifest) => manifest,
            Err(err) => {
                debug!(dir = %dir.display(), error = %err, "unreadable package.json");
                return None;
            }
        };
        let scripts = manifest.get("scripts")?.as_object()?;
        PACKAGE_SCRIPTS.iter().find_map(|name| {
            let script = scripts.get(*name)?.as_str()?;
            self.apply(script, format!("{file} (scripts.{name})"))
        })
    }
}

fn read_lossy(path: &Path) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}
