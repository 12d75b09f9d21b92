//! Live OS socket probing.
//!
//! Availability is a transient loopback bind. Occupants come from the host's
//! listening-socket tables: procfs on Linux, `lsof` on macOS, `netstat` plus
//! `tasklist` on Windows. Anything the current user is not allowed to inspect
//! is reported as no occupant.
//!
//! The same sources list the host's processes with their working directories.

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::path::PathBuf;

use serde::Serialize;

/// Process holding a listening socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortOccupant {
    pub pid: u32,
    pub process_name: String,
    pub command_line: String,
}

/// A process running on the host, whoever started it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostProcess {
    pub pid: u32,
    pub name: String,
    pub command_line: String,
    /// `None` when the OS would not tell us.
    pub cwd: Option<PathBuf>,
}

/// Host socket inspection, injected into the registry.
pub trait PortProbe: Send + Sync {
    /// True iff binding `127.0.0.1:port` succeeds right now.
    fn is_port_available(&self, port: u16) -> bool;

    fn port_occupant(&self, port: u16) -> Option<PortOccupant>;

    /// Every listening port in `start..=end` with its occupant.
    fn occupied_ports(&self, start: u16, end: u16) -> BTreeMap<u16, PortOccupant>;
}

/// Probe backed by the real operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl PortProbe for SystemProbe {
    fn is_port_available(&self, port: u16) -> bool {
        // Port 0 would let the OS pick any free port.
        port != 0 && TcpListener::bind(("127.0.0.1", port)).is_ok()
    }

    fn port_occupant(&self, port: u16) -> Option<PortOccupant> {
        let pid = platform::listeners()
            .into_iter()
            .filter(|listener| listener.port == port)
            .map(|listener| listener.pid)
            .min()?;
        Some(describe(pid))
    }

    fn occupied_ports(&self, start: u16, end: u16) -> BTreeMap<u16, PortOccupant> {
        let mut pids: BTreeMap<u16, u32> = BTreeMap::new();
        for listener in platform::listeners() {
            if !(start..=end).contains(&listener.port) {
                continue;
            }
            pids.entry(listener.port)
                .and_modify(|pid| *pid = (*pid).min(listener.pid))
                .or_insert(listener.pid);
        }
        pids.into_iter()
            .map(|(port, pid)| (port, describe(pid)))
            .collect()
    }
}

impl SystemProbe {
    /// Every process visible to the current user.
    pub fn processes(&self) -> Vec<HostProcess> {
        platform::processes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Listener {
    port: u16,
    pid: u32,
}

fn describe(pid: u32) -> PortOccupant {
    match platform::identify(pid) {
        Some((process_name, command_line)) => PortOccupant {
            pid,
            process_name,
            command_line,
        },
        None => PortOccupant {
            pid,
            process_name: "unknown".to_string(),
            command_line: String::new(),
        },
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use std::collections::HashMap;
    use std::fs;

    use super::{HostProcess, Listener};

    const TCP_LISTEN: &str = "0A";

    pub(super) fn listeners() -> Vec<Listener> {
        let mut inodes: HashMap<u64, u16> = HashMap::new();
        for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
            let Ok(content) = fs::read_to_string(table) else {
                continue;
            };
            // First line is the column header.
            for line in content.lines().skip(1) {
                if let Some((port, inode)) = parse_socket_line(line) {
                    inodes.insert(inode, port);
                }
            }
        }
        if inodes.is_empty() {
            return Vec::new();
        }

        let Ok(entries) = fs::read_dir("/proc") else {
            return Vec::new();
        };
        let mut listeners = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            // Denied for other users' processes unless privileged.
            let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            for fd in fds.filter_map(Result::ok) {
                let Ok(link) = fs::read_link(fd.path()) else {
                    continue;
                };
                let Some(inode) = link.to_str().and_then(socket_inode) else {
                    continue;
                };
                if let Some(port) = inodes.get(&inode) {
                    listeners.push(Listener { port: *port, pid });
                }
            }
        }
        listeners
    }

    /// Parses one `/proc/net/tcp` row into (local port, inode) if it is listening.
    pub(super) fn parse_socket_line(line: &str) -> Option<(u16, u64)> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 || fields[3] != TCP_LISTEN {
            return None;
        }
        let (_, port) = fields[1].rsplit_once(':')?;
        let port = u16::from_str_radix(port, 16).ok()?;
        let inode = fields[9].parse::<u64>().ok()?;
        (inode != 0).then_some((port, inode))
    }

    fn socket_inode(link: &str) -> Option<u64> {
        link.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
    }

    pub(super) fn identify(pid: u32) -> Option<(String, String)> {
        let name = fs::read_to_string(format!("/proc/{pid}/comm")).ok()?;
        let command_line = fs::read(format!("/proc/{pid}/cmdline"))
            .map(|raw| {
                raw.split(|b| *b == 0)
                    .filter(|part| !part.is_empty())
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        Some((name.trim().to_string(), command_line))
    }

    pub(super) fn processes() -> Vec<HostProcess> {
        let Ok(entries) = fs::read_dir("/proc") else {
            return Vec::new();
        };
        entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let pid = entry.file_name().to_str()?.parse::<u32>().ok()?;
                // Gone between listing and reading.
                let (name, command_line) = identify(pid)?;
                Some(HostProcess {
                    pid,
                    name,
                    command_line,
                    cwd: fs::read_link(entry.path().join("cwd")).ok(),
                })
            })
            .collect()
    }
}

#[cfg(target_os = "macos")]
mod platform {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::process::Command;

    use super::{HostProcess, Listener};

    pub(super) fn listeners() -> Vec<Listener> {
        let output = match Command::new("lsof")
            .args(["-nP", "-iTCP", "-sTCP:LISTEN", "-F", "pn"])
            .output()
        {
            Ok(output) => output,
            Err(_) => return Vec::new(),
        };
        parse_lsof(&String::from_utf8_lossy(&output.stdout))
    }

    /// Field output: a `p<pid>` line opens a process block, `n<addr>:<port>` lines follow.
    pub(super) fn parse_lsof(stdout: &str) -> Vec<Listener> {
        let mut listeners = Vec::new();
        let mut current_pid: Option<u32> = None;
        for line in stdout.lines() {
            if let Some(pid) = line.strip_prefix('p') {
                current_pid = pid.parse().ok();
            } else if let Some(name) = line.strip_prefix('n') {
                let port = name.rsplit_once(':').and_then(|(_, port)| port.parse().ok());
                if let (Some(pid), Some(port)) = (current_pid, port) {
                    listeners.push(Listener { port, pid });
                }
            }
        }
        listeners
    }

    pub(super) fn identify(pid: u32) -> Option<(String, String)> {
        let pid = pid.to_string();
        let name = ps_field(&pid, "comm=")?;
        let name = name.rsplit('/').next().unwrap_or(&name).to_string();
        let command_line = ps_field(&pid, "command=").unwrap_or_default();
        Some((name, command_line))
    }

    fn ps_field(pid: &str, field: &str) -> Option<String> {
        let output = Command::new("ps").args(["-p", pid, "-o", field]).output().ok()?;
        if !output.status.success() {
            return None;
        }
        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!value.is_empty()).then_some(value)
    }

    pub(super) fn processes() -> Vec<HostProcess> {
        let names = ps_table("pid=,comm=");
        let mut command_lines: HashMap<u32, String> = ps_table("pid=,args=").into_iter().collect();
        let mut cwds = Command::new("lsof")
            .args(["-n", "-a", "-d", "cwd", "-F", "pn"])
            .output()
            .map(|output| parse_lsof_cwd(&String::from_utf8_lossy(&output.stdout)))
            .unwrap_or_default();
        names
            .into_iter()
            .map(|(pid, comm)| HostProcess {
                pid,
                name: comm.rsplit('/').next().unwrap_or(&comm).to_string(),
                command_line: command_lines.remove(&pid).unwrap_or_default(),
                cwd: cwds.remove(&pid),
            })
            .collect()
    }

    fn ps_table(format: &str) -> Vec<(u32, String)> {
        match Command::new("ps").args(["-axo", format]).output() {
            Ok(output) => parse_ps(&String::from_utf8_lossy(&output.stdout)),
            Err(_) => Vec::new(),
        }
    }

    /// Rows of `<pid> <value>`, the pid right-aligned.
    pub(super) fn parse_ps(stdout: &str) -> Vec<(u32, String)> {
        stdout
            .lines()
            .filter_map(|line| {
                let (pid, value) = line.trim_start().split_once(char::is_whitespace)?;
                Some((pid.parse().ok()?, value.trim().to_string()))
            })
            .collect()
    }

    /// `lsof -d cwd -F pn`: a `p<pid>` line, then the directory as `n<path>`.
    pub(super) fn parse_lsof_cwd(stdout: &str) -> HashMap<u32, PathBuf> {
        let mut cwds = HashMap::new();
        let mut current_pid: Option<u32> = None;
        for line in stdout.lines() {
            if let Some(pid) = line.strip_prefix('p') {
                current_pid = pid.parse().ok();
            } else if let (Some(path), Some(pid)) = (line.strip_prefix('n'), current_pid) {
                cwds.insert(pid, PathBuf::from(path));
            }
        }
        cwds
    }
}

#[cfg(windows)]
mod platform {
    use std::path::Path;
    use std::process::Command;

    use serde::Deserialize;

    use super::{HostProcess, Listener};

    pub(super) fn listeners() -> Vec<Listener> {
        let output = match Command::new("netstat").args(["-ano", "-p", "TCP"]).output() {
            Ok(output) => output,
            Err(_) => return Vec::new(),
        };
        let mut listeners = parse_netstat(&String::from_utf8_lossy(&output.stdout));
        if let Ok(output) = Command::new("netstat").args(["-ano", "-p", "TCPv6"]).output() {
            listeners.extend(parse_netstat(&String::from_utf8_lossy(&output.stdout)));
        }
        listeners
    }

    /// Rows look like `TCP 0.0.0.0:3000 0.0.0.0:0 LISTENING 4242`.
    pub(super) fn parse_netstat(stdout: &str) -> Vec<Listener> {
        stdout
            .lines()
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() < 5 || fields[0] != "TCP" || fields[3] != "LISTENING" {
                    return None;
                }
                let (_, port) = fields[1].rsplit_once(':')?;
                Some(Listener {
                    port: port.parse().ok()?,
                    pid: fields[4].parse().ok()?,
                })
            })
            .collect()
    }

    pub(super) fn identify(pid: u32) -> Option<(String, String)> {
        let filter = format!("PID eq {pid}");
        let output = Command::new("tasklist")
            .args(["/FI", &filter, "/FO", "CSV", "/NH"])
            .output()
            .ok()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let first = stdout.lines().next()?;
        let name = first.split("\",\"").next()?.trim_start_matches('"').to_string();
        if name.is_empty() || name.starts_with("INFO:") {
            return None;
        }
        Some((name, String::new()))
    }

    const PROCESS_QUERY: &str = "Get-CimInstance Win32_Process | \
        Select-Object ProcessId,Name,CommandLine,ExecutablePath | ConvertTo-Json -Compress";

    #[derive(Deserialize)]
    #[serde(rename_all = "PascalCase")]
    struct CimProcess {
        process_id: u32,
        name: Option<String>,
        command_line: Option<String>,
        executable_path: Option<String>,
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum CimRows {
        Many(Vec<CimProcess>),
        One(CimProcess),
    }

    pub(super) fn processes() -> Vec<HostProcess> {
        match Command::new("powershell")
            .args(["-NoProfile", "-Command", PROCESS_QUERY])
            .output()
        {
            Ok(output) => parse_cim_json(&String::from_utf8_lossy(&output.stdout)),
            Err(_) => Vec::new(),
        }
    }

    /// Windows does not expose another process's working directory; the
    /// executable's folder stands in for it.
    pub(super) fn parse_cim_json(stdout: &str) -> Vec<HostProcess> {
        let rows = match serde_json::from_str::<CimRows>(stdout.trim()) {
            Ok(CimRows::Many(rows)) => rows,
            Ok(CimRows::One(row)) => vec![row],
            Err(_) => return Vec::new(),
        };
        rows.into_iter()
            .map(|row| HostProcess {
                pid: row.process_id,
                name: row.name.unwrap_or_default(),
                command_line: row.command_line.unwrap_or_default(),
                cwd: row
                    .executable_path
                    .as_deref()
                    .and_then(|exe| Path::new(exe).parent())
                    .map(Path::to_path_buf),
            })
            .collect()
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
mod platform {
    use super::{HostProcess, Listener};

    pub(super) fn listeners() -> Vec<Listener> {
        Vec::new()
    }

    pub(super) fn identify(_pid: u32) -> Option<(String, String)> {
        None
    }

    pub(super) fn processes() -> Vec<HostProcess> {
        Vec::new()
    }
}
