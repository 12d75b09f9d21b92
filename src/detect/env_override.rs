//! Port overrides spelled out in a service's start command.

use std::sync::OnceLock;

use regex::Regex;

/// Variable name reported for `--port` / `-p` flags.
pub const FLAG_VAR: &str = "PORT";

fn powershell_assignment() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$env:(\w+)\s*=\s*(\d+)").ok())
        .as_ref()
}

fn shell_assignment() -> Option<&'static Regex> {
    // Trailing `;` or `&` allows `set PORT=3000&& npm start`.
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z_]\w*)=(\d+)(?:$|[;&])").ok())
        .as_ref()
}

fn port_value(raw: &str) -> Option<u16> {
    raw.parse::<u16>().ok().filter(|port| *port != 0)
}

fn assignment(re: &Regex, text: &str) -> Option<(String, u16)> {
    let caps = re.captures(text)?;
    let port = port_value(caps.get(2)?.as_str())?;
    Some((caps.get(1)?.as_str().to_string(), port))
}

fn tokens(command: &str) -> Vec<String> {
    shell_words::split(command)
        .unwrap_or_else(|_| command.split_whitespace().map(str::to_string).collect())
}

/// Recognises an explicit port in `command`.
///
/// Idioms are tried in order: PowerShell `$env:VAR=N`, a leading `VAR=N cmd`,
/// `export`/`set`/`env VAR=N`, `--port N` / `--port=N`, then `-p N` / `-p=N`.
/// Flags report the variable as `PORT`.
pub fn detect_env_port_override(command: &str) -> Option<(String, u16)> {
    if let Some(found) = powershell_assignment().and_then(|re| assignment(re, command)) {
        return Some(found);
    }

    let tokens = tokens(command);
    let assign = shell_assignment()?;

    // `VAR=N` must be followed by the command it applies to.
    if tokens.len() > 1 {
        if let Some(found) = assignment(assign, &tokens[0]) {
            return Some(found);
        }
    }

    if let [keyword, rest @ ..] = tokens.as_slice() {
        if matches!(keyword.as_str(), "export" | "set" | "env") {
            if let Some(found) = rest.first().and_then(|token| assignment(assign, token)) {
                return Some(found);
            }
        }
    }

    flag_value(&tokens, "--port").or_else(|| flag_value(&tokens, "-p"))
        .map(|port| (FLAG_VAR.to_string(), port))
}

fn flag_value(tokens: &[String], flag: &str) -> Option<u16> {
    let inline = format!("{flag}=");
    tokens.iter().enumerate().find_map(|(idx, token)| {
        if token == flag {
            tokens.get(idx + 1).and_then(|value| port_value(value))
        } else {
            token.strip_prefix(&inline).and_then(port_value)
        }
    })
}
