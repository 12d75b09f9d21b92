//! Process execution and management.
//!
//! This module contains the `ProcessSupervisor`, which spawns service commands
//! through the host shell, drains their output into per-key ring buffers,
//! pushes every line to subscribers, and tears down whole process trees on stop.
//!
//! Each live process is driven by one reader task that owns the child handle.
//! The task multiplexes stdout, stderr and the exit status, so "running" is
//! reported through a watch channel rather than by polling.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Split};
use tokio::process::{Child, Command};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::events::{LogCallback, LogReceiver, SubscriberId, SubscriberSet};
use crate::lock;
use crate::output::{decode_line, LogBuffer, LogLine, StreamKind};
use crate::process::{ProcessSnapshot, ProcessSpec, ServiceKey};

// How long output is still drained after the child itself has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(1_000);
// Wait after the forced kill before giving up on confirmation.
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Exit state published by a reader task: `None` while running.
type ExitState = Option<Option<i32>>;

/// Supervises service processes keyed by (project, service).
///
/// Cloning is cheap; clones share the same process table.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    runtime: Handle,
    max_lines: usize,
    stop_grace: Duration,
    strip_ansi: bool,
    processes: Mutex<HashMap<ServiceKey, ManagedProcess>>,
    logs: Mutex<HashMap<ServiceKey, Arc<Mutex<LogBuffer>>>>,
    subscribers: SubscriberSet,
    next_generation: AtomicU64,
}

struct ManagedProcess {
    generation: u64,
    pid: Option<u32>,
    started_at: Instant,
    command: String,
    buffer: Arc<Mutex<LogBuffer>>,
    exit_rx: watch::Receiver<ExitState>,
    /// Taken by `stop`, which then owns the teardown.
    reader: Option<JoinHandle<()>>,
    /// Set while `stop` tears the tree down; the entry stays until it is done.
    stopping: bool,
}

impl ManagedProcess {
    fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }
}

impl ProcessSupervisor {
    /// Creates a supervisor whose reader tasks run on `runtime`.
    pub fn new(runtime: Handle, settings: &Settings) -> Self {
        Self {
            inner: Arc::new(Inner {
                runtime,
                max_lines: settings.max_lines,
                stop_grace: settings.stop_grace,
                strip_ansi: settings.strip_ansi,
                processes: Mutex::new(HashMap::new()),
                logs: Mutex::new(HashMap::new()),
                subscribers: SubscriberSet::new(),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Creates a supervisor on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current(settings: &Settings) -> Self {
        Self::new(Handle::current(), settings)
    }

    /// Starts `command` for `key` unless a live process already exists.
    ///
    /// Returns `false` when the command could not be spawned; the reason is
    /// delivered as a log line instead of an error.
    pub fn start(
        &self,
        key: &ServiceKey,
        command: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
    ) -> bool {
        let spec = ProcessSpec::new(command, working_dir).with_env(env.clone());
        self.start_spec(key, &spec)
    }

    /// Like [`start`](Self::start), from a prepared [`ProcessSpec`].
    ///
    /// Returns `false` without spawning while a `stop` of `key` is still in
    /// progress.
    pub fn start_spec(&self, key: &ServiceKey, spec: &ProcessSpec) -> bool {
        let failure = {
            let mut processes = lock(&self.inner.processes);
            if let Some(existing) = processes.get(key) {
                if existing.stopping {
                    let buffer = existing.buffer.clone();
                    drop(processes);
                    warn!(%key, "start refused; previous process is still stopping");
                    self.inner.emit(
                        key,
                        &buffer,
                        LogLine::system("error: failed to start: previous process is still stopping"),
                    );
                    return false;
                }
                if !existing.has_exited() {
                    debug!(%key, "already running; start is a no-op");
                    return true;
                }
            }
            if let Some(reader) = processes.remove(key).and_then(|stale| stale.reader) {
                reader.abort();
            }

            let buffer = Arc::new(Mutex::new(LogBuffer::new(self.inner.max_lines)));
            lock(&self.inner.logs).insert(key.clone(), buffer.clone());

            let header = vec![
                LogLine::system(format!("starting: {}", spec.command)),
                LogLine::system(format!("cwd: {}", spec.working_dir.display())),
            ];

            let mut command = shell_command(&spec.command);
            command
                .current_dir(&spec.working_dir)
                .envs(&spec.env)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            command.kill_on_drop(true);

            #[cfg(windows)]
            {
                const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
                command.creation_flags(CREATE_NEW_PROCESS_GROUP);
            }

            #[cfg(unix)]
            unsafe {
                command.pre_exec(|| {
                    let _ = libc::setpgid(0, 0);
                    Ok(())
                });
            }

            let spawned = {
                let _guard = self.inner.runtime.enter();
                command.spawn()
            };
            match spawned {
                Ok(child) => {
                    let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                    let pid = child.id();
                    let (exit_tx, exit_rx) = watch::channel(None);
                    let reader = self.inner.runtime.spawn(drive_process(
                        self.inner.clone(),
                        key.clone(),
                        generation,
                        child,
                        buffer.clone(),
                        header,
                        exit_tx,
                    ));
                    processes.insert(
                        key.clone(),
                        ManagedProcess {
                            generation,
                            pid,
                            started_at: Instant::now(),
                            command: spec.command.clone(),
                            buffer,
                            exit_rx,
                            reader: Some(reader),
                            stopping: false,
                        },
                    );
                    info!(%key, ?pid, command = %spec.command, "started process");
                    None
                }
                Err(err) => Some((buffer, header, err)),
            }
        };

        // Published only after the table lock is released.
        match failure {
            None => true,
            Some((buffer, header, err)) => {
                warn!(%key, command = %spec.command, error = %err, "failed to spawn process");
                for line in header {
                    self.inner.emit(key, &buffer, line);
                }
                self.inner.emit(
                    key,
                    &buffer,
                    LogLine::system(format!("error: failed to start: {err}")),
                );
                false
            }
        }
    }

    /// Stops the process tree for `key`: graceful request, grace window, forced kill.
    ///
    /// Always succeeds; termination problems are logged. The key stays
    /// registered until teardown finishes, so a concurrent `start` cannot
    /// spawn a second process for it. A second `stop` waits for the first.
    pub async fn stop(&self, key: &ServiceKey) -> bool {
        let claimed = {
            let mut processes = lock(&self.inner.processes);
            let Some(process) = processes.get_mut(key) else {
                return true;
            };
            if process.stopping {
                Err(process.exit_rx.clone())
            } else {
                process.stopping = true;
                Ok((
                    process.generation,
                    process.pid,
                    process.exit_rx.clone(),
                    process.reader.take(),
                    process.buffer.clone(),
                ))
            }
        };
        let (generation, pid, mut exit_rx, reader, buffer) = match claimed {
            Ok(claimed) => claimed,
            Err(mut exit_rx) => {
                wait_for_exit(&mut exit_rx, self.inner.stop_grace + KILL_CONFIRM_TIMEOUT).await;
                return true;
            }
        };

        if exit_rx.borrow().is_none() {
            if let Some(pid) = pid {
                debug!(%key, pid, "requesting termination of process tree");
                request_tree_termination(pid).await;
            }
            if !wait_for_exit(&mut exit_rx, self.inner.stop_grace).await {
                warn!(
                    %key,
                    grace_ms = self.inner.stop_grace.as_millis() as u64,
                    "grace window elapsed; force killing process tree"
                );
                if let Some(pid) = pid {
                    force_kill_tree(pid).await;
                }
                if !wait_for_exit(&mut exit_rx, KILL_CONFIRM_TIMEOUT).await {
                    warn!(%key, "process still running after forced kill");
                }
            }
        }

        // The reader owns the child; dropping it (kill_on_drop) is the last resort.
        if let Some(mut reader) = reader {
            if tokio::time::timeout(DRAIN_TIMEOUT * 2, &mut reader)
                .await
                .is_err()
            {
                warn!(%key, "reader task did not finish; aborting it");
                reader.abort();
            }
        }

        self.inner.emit(key, &buffer, LogLine::system("service stopped"));
        {
            let mut processes = lock(&self.inner.processes);
            if processes.get(key).is_some_and(|p| p.generation == generation) {
                processes.remove(key);
            }
        }
        info!(%key, "stopped process");
        true
    }

    /// Stops every managed process concurrently.
    pub async fn stop_all(&self) {
        let keys: Vec<ServiceKey> = lock(&self.inner.processes).keys().cloned().collect();
        let mut tasks = JoinSet::new();
        for key in keys {
            let supervisor = self.clone();
            tasks.spawn_on(async move { supervisor.stop(&key).await }, &self.inner.runtime);
        }
        while tasks.join_next().await.is_some() {}
    }

    pub fn is_running(&self, key: &ServiceKey) -> bool {
        lock(&self.inner.processes)
            .get(key)
            .map(|process| !process.has_exited())
            .unwrap_or(false)
    }

    /// Current ring buffer contents for `key`, oldest first.
    pub fn get_logs(&self, key: &ServiceKey) -> Vec<String> {
        self.inner
            .buffer(key)
            .map(|buffer| lock(&buffer).texts())
            .unwrap_or_default()
    }

    pub fn subscribe(&self, key: &ServiceKey, callback: LogCallback) -> SubscriberId {
        self.inner.subscribers.subscribe(key, callback)
    }

    /// Subscribes with a bounded queue; lines are dropped when it is full.
    pub fn subscribe_channel(&self, key: &ServiceKey, capacity: usize) -> LogReceiver {
        self.inner.subscribers.subscribe_channel(key, capacity)
    }

    pub fn unsubscribe(&self, key: &ServiceKey, id: SubscriberId) -> bool {
        self.inner.subscribers.unsubscribe(key, id)
    }

    /// Keys with a live process, sorted.
    pub fn running_keys(&self) -> Vec<ServiceKey> {
        let mut keys: Vec<ServiceKey> = lock(&self.inner.processes)
            .iter()
            .filter(|(_, process)| !process.has_exited())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn snapshot(&self, key: &ServiceKey) -> Option<ProcessSnapshot> {
        lock(&self.inner.processes)
            .get(key)
            .map(|process| ProcessSnapshot {
                key: key.clone(),
                pid: process.pid,
                started_at: process.started_at,
                command: process.command.clone(),
            })
    }
}

impl Inner {
    fn buffer(&self, key: &ServiceKey) -> Option<Arc<Mutex<LogBuffer>>> {
        lock(&self.logs).get(key).cloned()
    }

    fn emit(&self, key: &ServiceKey, buffer: &Mutex<LogBuffer>, line: LogLine) {
        lock(buffer).push(line.clone());
        self.subscribers.publish(key, &line);
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    // A leading PowerShell call operator is meaningless to cmd.exe.
    let trimmed = command.trim_start();
    let command = trimmed.strip_prefix('&').map(str::trim_start).unwrap_or(trimmed);
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").raw_arg(command);
    cmd
}

async fn drive_process(
    inner: Arc<Inner>,
    key: ServiceKey,
    generation: u64,
    mut child: Child,
    buffer: Arc<Mutex<LogBuffer>>,
    header: Vec<LogLine>,
    exit_tx: watch::Sender<ExitState>,
) {
    for line in header {
        inner.emit(&key, &buffer, line);
    }

    let mut stdout = child.stdout.take().map(|s| BufReader::new(s).split(b'\n'));
    let mut stderr = child.stderr.take().map(|s| BufReader::new(s).split(b'\n'));
    let mut exit: ExitState = None;
    let mut drain_deadline: Option<tokio::time::Instant> = None;

    loop {
        if stdout.is_none() && stderr.is_none() && exit.is_some() {
            break;
        }
        let deadline = drain_deadline.unwrap_or_else(far_future);
        tokio::select! {
            segment = next_segment(&mut stdout), if stdout.is_some() => match segment {
                Some(raw) => inner.emit(&key, &buffer, LogLine::new(decode_line(&raw, inner.strip_ansi), StreamKind::Stdout)),
                None => stdout = None,
            },
            segment = next_segment(&mut stderr), if stderr.is_some() => match segment {
                Some(raw) => inner.emit(&key, &buffer, LogLine::new(decode_line(&raw, inner.strip_ansi), StreamKind::Stderr)),
                None => stderr = None,
            },
            status = child.wait(), if exit.is_none() => {
                let code = match status {
                    Ok(status) => status.code(),
                    Err(err) => {
                        debug!(%key, error = %err, "failed to wait on child");
                        None
                    }
                };
                exit = Some(code);
                let _ = exit_tx.send(Some(code));
                drain_deadline = Some(tokio::time::Instant::now() + DRAIN_TIMEOUT);
            },
            _ = tokio::time::sleep_until(deadline), if drain_deadline.is_some() => break,
        }
    }

    let code = exit.flatten();
    let detected_exit = {
        let mut processes = lock(&inner.processes);
        match processes.get(&key) {
            // A stopping entry is removed by `stop` itself.
            Some(process) if process.generation == generation && !process.stopping => {
                processes.remove(&key);
                true
            }
            _ => false,
        }
    };
    if detected_exit {
        info!(%key, ?code, "process exited");
        let text = match code {
            Some(code) => format!("process exited (code {code})"),
            None => "process exited".to_string(),
        };
        inner.emit(&key, &buffer, LogLine::system(text));
    }
}

async fn next_segment<R>(lines: &mut Option<Split<BufReader<R>>>) -> Option<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_segment().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

fn far_future() -> tokio::time::Instant {
    tokio::time::Instant::now() + Duration::from_secs(60 * 60 * 24)
}

async fn wait_for_exit(exit_rx: &mut watch::Receiver<ExitState>, timeout: Duration) -> bool {
    if timeout.is_zero() {
        return exit_rx.borrow().is_some();
    }
    match tokio::time::timeout(timeout, exit_rx.wait_for(|state| state.is_some())).await {
        Ok(Ok(_)) => true,
        // Sender gone means the reader task ended, and with it the child.
        Ok(Err(_)) => true,
        Err(_) => false,
    }
}

#[cfg(unix)]
async fn request_tree_termination(pid: u32) {
    send_signal(pid, libc::SIGTERM);
}

#[cfg(unix)]
async fn force_kill_tree(pid: u32) {
    send_signal(pid, libc::SIGKILL);
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) {
    unsafe {
        let pid = pid as i32;
        if libc::kill(-pid, signal) != 0 {
            debug!(pid, signal, error = %std::io::Error::last_os_error(), "group signal failed");
        }
        let _ = libc::kill(pid, signal);
    }
}

#[cfg(windows)]
async fn request_tree_termination(pid: u32) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // The child was spawned in its own process group, so CTRL_BREAK reaches the whole group.
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
    run_taskkill(pid, false).await;
}

#[cfg(windows)]
async fn force_kill_tree(pid: u32) {
    run_taskkill(pid, true).await;
}

#[cfg(windows)]
async fn run_taskkill(pid: u32, force: bool) {
    let mut command = Command::new("taskkill");
    if force {
        command.arg("/F");
    }
    command
        .args(["/T", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    match command.status().await {
        Ok(status) if !status.success() => debug!(pid, ?status, "taskkill reported failure"),
        Ok(_) => {}
        Err(err) => warn!(pid, error = %err, "failed to run taskkill"),
    }
}

#[cfg(not(any(unix, windows)))]
async fn request_tree_termination(_pid: u32) {}

#[cfg(not(any(unix, windows)))]
async fn force_kill_tree(_pid: u32) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn settings(max_lines: usize, grace_ms: u64) -> Settings {
        Settings {
            data_dir: PathBuf::from("unused"),
            max_lines,
            stop_grace: Duration::from_millis(grace_ms),
            strip_ansi: true,
            channel_capacity: 16,
        }
    }

    fn supervisor() -> ProcessSupervisor {
        ProcessSupervisor::current(&settings(500, 2_000))
    }

    fn key(service: &str) -> ServiceKey {
        ServiceKey::new("test-project", service)
    }

    fn tmp() -> PathBuf {
        std::env::temp_dir()
    }

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }

    #[tokio::test]
    async fn start_runs_and_stop_clears() {
        let sup = supervisor();
        let k = key("sleeper");
        assert!(sup.start(&k, "sleep 30", &tmp(), &HashMap::new()));
        assert!(sup.is_running(&k));
        assert_eq!(sup.running_keys(), vec![k.clone()]);

        assert!(sup.stop(&k).await);
        assert!(!sup.is_running(&k));
        assert!(sup.running_keys().is_empty());
        let logs = sup.get_logs(&k);
        assert_eq!(logs.first().map(String::as_str), Some("starting: sleep 30"));
        assert_eq!(logs.last().map(String::as_str), Some("service stopped"));
    }

    #[tokio::test]
    async fn start_is_idempotent_for_live_key() {
        let sup = supervisor();
        let k = key("idem");
        assert!(sup.start(&k, "sleep 30", &tmp(), &HashMap::new()));
        let first = sup.snapshot(&k).and_then(|s| s.pid);
        assert!(sup.start(&k, "sleep 30", &tmp(), &HashMap::new()));
        let second = sup.snapshot(&k).and_then(|s| s.pid);
        assert!(first.is_some());
        assert_eq!(first, second);
        sup.stop(&k).await;
    }

    #[tokio::test]
    async fn stop_unknown_key_is_noop_success() {
        let sup = supervisor();
        assert!(sup.stop(&key("never-started")).await);
        assert!(sup.get_logs(&key("never-started")).is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_returns_false_and_logs_once() {
        let sup = supervisor();
        let k = key("broken");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        sup.subscribe(
            &k,
            Arc::new(move |_key: &ServiceKey, line: &LogLine| {
                sink.lock().unwrap().push(line.text.clone())
            }),
        );
        let missing = tmp().join("portrack-does-not-exist-dir");
        assert!(!sup.start(&k, "echo hi", &missing, &HashMap::new()));
        assert!(!sup.is_running(&k));
        let errors: Vec<String> = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|line| line.starts_with("error:"))
            .cloned()
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(sup.get_logs(&k).iter().any(|l| l.starts_with("error:")));
    }

    #[tokio::test]
    async fn env_overrides_win_over_inherited() {
        let sup = supervisor();
        let k = key("env");
        let mut env = HashMap::new();
        env.insert("HOME".to_string(), "/portrack-home".to_string());
        env.insert("PORT".to_string(), "4321".to_string());
        assert!(sup.start(&k, "echo \"$HOME $PORT\"", &tmp(), &env));
        assert!(
            eventually(|| sup
                .get_logs(&k)
                .iter()
                .any(|l| l == "/portrack-home 4321"))
            .await
        );
    }

    #[tokio::test]
    async fn detects_exit_and_keeps_last_capacity_lines() {
        let sup = ProcessSupervisor::current(&settings(50, 2_000));
        let k = key("chatty");
        assert!(sup.start(&k, "seq 1 200", &tmp(), &HashMap::new()));
        assert!(eventually(|| !sup.is_running(&k)).await);
        assert!(
            eventually(|| sup
                .get_logs(&k)
                .last()
                .map(|l| l.starts_with("process exited"))
                .unwrap_or(false))
            .await
        );
        let logs = sup.get_logs(&k);
        assert_eq!(logs.len(), 50);
        let expected: Vec<String> = (152..=200).map(|n| n.to_string()).collect();
        assert_eq!(&logs[..49], expected.as_slice());
        assert_eq!(logs[49], "process exited (code 0)");
    }

    #[tokio::test]
    async fn merges_stdout_and_stderr() {
        let sup = supervisor();
        let k = key("merged");
        assert!(sup.start(&k, "echo out; echo err 1>&2", &tmp(), &HashMap::new()));
        assert!(
            eventually(|| {
                let logs = sup.get_logs(&k);
                logs.contains(&"out".to_string()) && logs.contains(&"err".to_string())
            })
            .await
        );
    }

    #[tokio::test]
    async fn subscribers_receive_lines_until_unsubscribed() {
        let sup = supervisor();
        let k = key("subscribed");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = sup.subscribe(
            &k,
            Arc::new(move |_key: &ServiceKey, line: &LogLine| {
                sink.lock().unwrap().push(line.text.clone())
            }),
        );
        assert!(sup.start(&k, "echo one", &tmp(), &HashMap::new()));
        assert!(eventually(|| seen.lock().unwrap().contains(&"one".to_string())).await);
        assert!(sup.unsubscribe(&k, id));
        sup.stop(&k).await;
        assert!(!seen.lock().unwrap().contains(&"service stopped".to_string()));
    }

    #[tokio::test]
    async fn stubborn_process_is_force_killed_after_grace() {
        let sup = ProcessSupervisor::current(&settings(500, 300));
        let k = key("stubborn");
        assert!(sup.start(&k, "trap '' TERM; sleep 60", &tmp(), &HashMap::new()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        assert!(sup.stop(&k).await);
        assert!(!sup.is_running(&k));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn stop_terminates_descendants() {
        let sup = supervisor();
        let k = key("tree");
        assert!(sup.start(&k, "sleep 60 & echo $!; wait", &tmp(), &HashMap::new()));
        let mut grandchild = None;
        for _ in 0..500 {
            grandchild = sup
                .get_logs(&k)
                .iter()
                .find_map(|line| line.trim().parse::<u32>().ok());
            if grandchild.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let grandchild = grandchild.expect("grandchild pid printed");
        sup.stop(&k).await;
        let gone = eventually(|| {
            match std::fs::read_to_string(format!("/proc/{grandchild}/stat")) {
                Err(_) => true,
                Ok(stat) => stat
                    .rsplit(')')
                    .next()
                    .map(|rest| rest.trim_start().starts_with('Z'))
                    .unwrap_or(false),
            }
        })
        .await;
        assert!(gone, "grandchild {grandchild} survived stop");
    }

    #[tokio::test]
    async fn start_during_stop_is_refused_until_teardown_finishes() {
        let sup = ProcessSupervisor::current(&settings(500, 1_000));
        let k = key("racing");
        assert!(sup.start(&k, "trap '' TERM; sleep 30", &tmp(), &HashMap::new()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let old_pid = sup.snapshot(&k).and_then(|s| s.pid);

        let stopping = {
            let sup = sup.clone();
            let k = k.clone();
            tokio::spawn(async move { sup.stop(&k).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!sup.start(&k, "sleep 30", &tmp(), &HashMap::new()));
        assert_eq!(sup.snapshot(&k).and_then(|s| s.pid), old_pid);
        assert!(sup.is_running(&k));

        assert!(stopping.await.unwrap());
        assert!(!sup.is_running(&k));
        assert!(sup.snapshot(&k).is_none());
        let logs = sup.get_logs(&k);
        assert_eq!(logs.first().map(String::as_str), Some("starting: trap '' TERM; sleep 30"));
        assert_eq!(logs.last().map(String::as_str), Some("service stopped"));
        assert_eq!(logs.iter().filter(|l| l.starts_with("error:")).count(), 1);

        assert!(sup.start(&k, "sleep 30", &tmp(), &HashMap::new()));
        assert_ne!(sup.snapshot(&k).and_then(|s| s.pid), old_pid);
        assert!(!sup.get_logs(&k).contains(&"service stopped".to_string()));
        sup.stop(&k).await;
    }

    #[tokio::test]
    async fn concurrent_stops_both_wait_for_exit() {
        let sup = ProcessSupervisor::current(&settings(500, 300));
        let k = key("double-stop");
        assert!(sup.start(&k, "trap '' TERM; sleep 30", &tmp(), &HashMap::new()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let (first, second) = tokio::join!(sup.stop(&k), sup.stop(&k));
        assert!(first && second);
        assert!(!sup.is_running(&k));
        let stopped = sup.get_logs(&k).iter().filter(|l| *l == "service stopped").count();
        assert_eq!(stopped, 1);
    }

    #[tokio::test]
    async fn stop_all_stops_everything() {
        let sup = supervisor();
        for name in ["a", "b", "c"] {
            assert!(sup.start(&key(name), "sleep 30", &tmp(), &HashMap::new()));
        }
        assert_eq!(sup.running_keys().len(), 3);
        sup.stop_all().await;
        assert!(sup.running_keys().is_empty());
    }

    #[tokio::test]
    async fn restart_after_exit_resets_buffer() {
        let sup = supervisor();
        let k = key("again");
        assert!(sup.start(&k, "echo first", &tmp(), &HashMap::new()));
        assert!(eventually(|| !sup.is_running(&k)).await);
        assert!(sup.start(&k, "echo second", &tmp(), &HashMap::new()));
        assert!(eventually(|| sup.get_logs(&k).contains(&"second".to_string())).await);
        assert!(!sup.get_logs(&k).contains(&"first".to_string()));
    }
}
