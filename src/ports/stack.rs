//! Tech-stack classification and the port bands reserved per stack.

use std::fs;
use std::path::Path;

/// A band of ports reserved for a family of tech stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBand {
    pub key: &'static str,
    pub name: &'static str,
    pub start: u16,
    pub end: u16,
    pub stacks: &'static [&'static str],
}

impl PortBand {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn size(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }
}

/// Reserved bands, scanned in this order by `suggest_port`.
pub const PORT_BANDS: &[PortBand] = &[
    PortBand {
        key: "frontend_dev",
        name: "Frontend dev servers",
        start: 3000,
        end: 3999,
        stacks: &["react", "vue", "vite", "webpack", "create-react-app"],
    },
    PortBand {
        key: "frontend_vite",
        name: "Vite",
        start: 5170,
        end: 5199,
        stacks: &["vite"],
    },
    PortBand {
        key: "backend_python",
        name: "Python backends",
        start: 8000,
        end: 8099,
        stacks: &["fastapi", "flask", "django", "uvicorn"],
    },
    PortBand {
        key: "backend_node",
        name: "Node.js backends",
        start: 4000,
        end: 4099,
        stacks: &["express", "koa", "nestjs"],
    },
    OVERFLOW_BAND,
];

/// Catch-all band tried after the stack-specific ones.
pub const OVERFLOW_BAND: PortBand = PortBand {
    key: "custom",
    name: "Custom services",
    start: 9000,
    end: 9999,
    stacks: &["custom"],
};

/// Last resort range when every band is exhausted.
pub const HIGH_RANGE: (u16, u16) = (10000, 65535);

const DEFAULT_PORTS: &[(&str, u16)] = &[
    ("vite", 5173),
    ("react", 3000),
    ("vue", 8080),
    ("create-react-app", 3000),
    ("webpack-dev-server", 8080),
    ("fastapi", 8000),
    ("flask", 5000),
    ("django", 8000),
    ("uvicorn", 8000),
    ("express", 3000),
    ("nestjs", 3000),
];

/// Conventional port a stack's tooling binds when not told otherwise.
pub fn default_port(stack: &str) -> Option<u16> {
    DEFAULT_PORTS
        .iter()
        .find(|(name, _)| *name == stack)
        .map(|(_, port)| *port)
}

pub const CUSTOM_STACK: &str = "custom";

enum Outcome {
    Stack(&'static str),
    /// Interpreter running an entry file; the framework comes from requirements.txt.
    PythonManifest,
}

struct StackRule {
    any: &'static [&'static str],
    /// When non-empty, one of these must also appear.
    with_any: &'static [&'static str],
    outcome: Outcome,
}

const STACK_RULES: &[StackRule] = &[
    StackRule {
        any: &["npm run dev", "vite"],
        with_any: &[],
        outcome: Outcome::Stack("vite"),
    },
    StackRule {
        any: &["npm start", "react-scripts"],
        with_any: &[],
        outcome: Outcome::Stack("create-react-app"),
    },
    StackRule {
        any: &["vue-cli-service"],
        with_any: &[],
        outcome: Outcome::Stack("vue"),
    },
    StackRule {
        any: &["webpack-dev-server"],
        with_any: &[],
        outcome: Outcome::Stack("webpack-dev-server"),
    },
    StackRule {
        any: &["uvicorn", "fastapi"],
        with_any: &[],
        outcome: Outcome::Stack("fastapi"),
    },
    StackRule {
        any: &["flask"],
        with_any: &[],
        outcome: Outcome::Stack("flask"),
    },
    StackRule {
        any: &["django", "manage.py runserver"],
        with_any: &[],
        outcome: Outcome::Stack("django"),
    },
    StackRule {
        any: &["python"],
        with_any: &["main.py", "app.py", "run.py"],
        outcome: Outcome::PythonManifest,
    },
    StackRule {
        any: &["express"],
        with_any: &[],
        outcome: Outcome::Stack("express"),
    },
    StackRule {
        any: &["nest"],
        with_any: &[],
        outcome: Outcome::Stack("nestjs"),
    },
];

/// Classifies a start command into a tech-stack tag, `custom` when nothing matches.
pub fn detect_tech_stack(command: &str, working_dir: &Path) -> String {
    let command = command.to_lowercase();
    for rule in STACK_RULES {
        if !rule.any.iter().any(|needle| command.contains(needle)) {
            continue;
        }
        if !rule.with_any.is_empty() && !rule.with_any.iter().any(|needle| command.contains(needle)) {
            continue;
        }
        return match rule.outcome {
            Outcome::Stack(stack) => stack.to_string(),
            Outcome::PythonManifest => python_framework(working_dir).to_string(),
        };
    }
    CUSTOM_STACK.to_string()
}

fn python_framework(working_dir: &Path) -> &'static str {
    let Ok(manifest) = fs::read_to_string(working_dir.join("requirements.txt")) else {
        return "python";
    };
    let manifest = manifest.to_lowercase();
    if manifest.contains("fastapi") {
        "fastapi"
    } else if manifest.contains("flask") {
        "flask"
    } else {
        "python"
    }
}
