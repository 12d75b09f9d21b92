//! portrack: run local dev services and keep their ports from colliding.
//!
//! This is the entry point of the command-line front end. It parses arguments,
//! resolves configuration, and drives the library's supervisor, registry and
//! detector for one subcommand.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use portrack::config::{self, Config, Settings};
use portrack::{
    match_to_projects, plan_service_port, scan_processes, DetectedService, LogEvent, PortRegistry,
    PortSourceDetector, ProcessSupervisor, ProjectStore, ServiceKey, ServiceRole, StreamKind,
    SystemProbe,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum RoleArg {
    Frontend,
    Backend,
    Other,
}

impl From<RoleArg> for ServiceRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Frontend => ServiceRole::Frontend,
            RoleArg::Backend => ServiceRole::Backend,
            RoleArg::Other => ServiceRole::Other,
        }
    }
}

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "portrack",
    version,
    about = "Run local dev services and arbitrate their ports",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to portrack.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ignore any portrack.toml in the current directory.
    #[arg(long, global = true)]
    no_config: bool,
    /// Directory holding port_allocations.json and projects.json.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Max log lines kept per service.
    #[arg(long, global = true)]
    max_lines: Option<usize>,
    /// Time to wait after the termination request before force-killing (ms).
    #[arg(long, global = true)]
    stop_grace_ms: Option<u64>,
    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,
    /// Enable debug logging (overrides RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Detect the port a service in DIR will bind.
    Detect {
        dir: PathBuf,
        #[arg(long, value_enum, default_value = "other")]
        role: RoleArg,
        /// Start command; an explicit port in it wins over files.
        #[arg(long)]
        command: Option<String>,
    },
    /// Detect the services of the project in DIR and store it.
    Add {
        dir: PathBuf,
        /// Project id; defaults to a slug of the directory name.
        #[arg(long)]
        id: Option<String>,
        /// Print what was detected without storing it.
        #[arg(long)]
        dry_run: bool,
    },
    /// Classify a start command into a tech stack.
    Stack {
        command: String,
        #[arg(long, default_value = ".")]
        cwd: PathBuf,
    },
    /// Check whether a port is free and who holds it.
    Probe { port: u16 },
    /// List listening ports with their processes.
    Scan {
        #[arg(long, default_value_t = 1024)]
        from: u16,
        #[arg(long, default_value_t = 65535)]
        to: u16,
    },
    /// Suggest a port for a tech stack.
    Suggest {
        stack: String,
        #[arg(long)]
        project: String,
        #[arg(long)]
        exclude: Vec<u16>,
    },
    /// List port allocations.
    Allocations,
    /// Drop the allocation of a port.
    Release { port: u16 },
    /// Allocation counts by stack, project and band.
    Stats,
    /// Report ports claimed by more than one configured service.
    Conflicts,
    /// List dev processes running outside portrack and the projects they belong to.
    Processes,
    /// Start a project's enabled services and stream their output.
    Up {
        project: String,
        /// Prepend elapsed time to each line.
        #[arg(long)]
        timestamp: bool,
        /// Disable colored prefixes.
        #[arg(long)]
        no_color: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let settings = resolve_settings(&cli)?;

    match &cli.command {
        Commands::Detect { dir, role, command } => {
            let detector = PortSourceDetector::new();
            let result = detector.resolve_service_port(dir, (*role).into(), command.as_deref().unwrap_or(""));
            if cli.json {
                return print_json(&result);
            }
            match (result.port, result.env_var.as_deref()) {
                (Some(port), _) => println!("port {port}"),
                (None, Some(var)) => println!("port from ${var}"),
                (None, None) => println!("no port found"),
            }
            println!("source: {} (confidence {:.2})", result.provenance, result.confidence);
            println!("details: {}", result.details);
        }
        Commands::Add { dir, id, dry_run } => {
            let detected = PortSourceDetector::new().detect_project(dir);
            if detected.is_empty() {
                warn!(dir = %dir.display(), "no frontend or backend service found");
            }
            if *dry_run {
                if cli.json {
                    return print_json(&detected);
                }
                for service in [&detected.frontend, &detected.backend].into_iter().flatten() {
                    print_detected(service);
                }
                return Ok(());
            }
            let store = open_store(&settings)?;
            let id = id.clone().unwrap_or_else(|| store.unused_id(&detected.name));
            let project = store
                .upsert(detected.into_descriptor(id))
                .context("failed to save project")?;
            info!(project = %project.id, services = project.services.len(), "project stored");
            if cli.json {
                return print_json(&project);
            }
            println!("added {} ({})", project.id, project.path.display());
            for (service_id, service) in &project.services {
                let port = service.port().map_or_else(|| "-".to_string(), |port| port.to_string());
                println!("  {service_id}: {}  port {port}  [{}]", service.start_command, service.tech_stack);
            }
        }
        Commands::Stack { command, cwd } => {
            let stack = portrack::ports::detect_tech_stack(command, cwd);
            let default = portrack::ports::default_port(&stack);
            if cli.json {
                return print_json(&serde_json::json!({ "techStack": stack, "defaultPort": default }));
            }
            match default {
                Some(port) => println!("{stack} (default port {port})"),
                None => println!("{stack}"),
            }
        }
        Commands::Probe { port } => {
            let registry = open_registry(&settings);
            let available = registry.is_port_available(*port);
            let occupant = if available { None } else { registry.get_port_occupant(*port) };
            if cli.json {
                return print_json(&serde_json::json!({
                    "port": port,
                    "available": available,
                    "occupant": occupant,
                    "allocation": registry.allocation(*port),
                }));
            }
            match (available, occupant) {
                (true, _) => println!("port {port}: available"),
                (false, Some(o)) => println!("port {port}: in use by {} (pid {}) {}", o.process_name, o.pid, o.command_line),
                (false, None) => println!("port {port}: in use (occupant unknown)"),
            }
            if let Some(allocation) = registry.allocation(*port) {
                println!(
                    "allocated to {}/{} ({})",
                    allocation.project_name, allocation.service_name, allocation.tech_stack
                );
            }
        }
        Commands::Scan { from, to } => {
            let registry = open_registry(&settings);
            let occupied = registry.scan_occupied_ports(*from, *to);
            if cli.json {
                return print_json(&occupied);
            }
            for (port, occupant) in &occupied {
                println!(
                    "{:>5}  {:>7}  {:<16} {}",
                    port, occupant.pid, occupant.process_name, occupant.command_line
                );
            }
        }
        Commands::Suggest { stack, project, exclude } => {
            let registry = open_registry(&settings);
            let exclude: HashSet<u16> = exclude.iter().copied().collect();
            let port = registry
                .suggest_port(stack, project, &exclude)
                .context("no port could be suggested")?;
            if cli.json {
                return print_json(&serde_json::json!({ "port": port }));
            }
            println!("{port}");
        }
        Commands::Allocations => {
            let registry = open_registry(&settings);
            let allocations = registry.allocations();
            if cli.json {
                return print_json(&allocations);
            }
            for a in &allocations {
                println!(
                    "{:>5}  {}/{}  {}  last used {}",
                    a.port,
                    a.project_name,
                    a.service_name,
                    a.tech_stack,
                    a.last_used_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::Release { port } => {
            let registry = open_registry(&settings);
            let released = registry.release(*port).context("failed to update allocations")?;
            if cli.json {
                return print_json(&serde_json::json!({ "port": port, "released": released }));
            }
            if released {
                println!("released {port}");
            } else {
                println!("port {port} was not allocated");
            }
        }
        Commands::Stats => {
            let registry = open_registry(&settings);
            let stats = registry.statistics();
            if cli.json {
                return print_json(&stats);
            }
            println!("allocated: {}", stats.total_allocated);
            for (stack, count) in &stats.by_tech_stack {
                println!("  stack {stack}: {count}");
            }
            for (project, count) in &stats.by_project {
                println!("  project {project}: {count}");
            }
            for band in &stats.bands {
                println!(
                    "  {} {}-{}: {}/{}",
                    band.name, band.start, band.end, band.allocated, band.total
                );
            }
        }
        Commands::Conflicts => {
            let store = open_store(&settings)?;
            let registry = open_registry(&settings);
            let conflicts = registry.check_conflicts(&store.all());
            if cli.json {
                return print_json(&conflicts);
            }
            if conflicts.is_empty() {
                println!("no conflicts");
            }
            for conflict in &conflicts {
                println!("port {}:", conflict.port);
                for c in &conflict.claimants {
                    println!("  {}/{}  {}", c.project_name, c.service_name, c.command);
                }
            }
        }
        Commands::Processes => {
            let store = open_store(&settings)?;
            let mut processes = scan_processes(&SystemProbe);
            match_to_projects(&mut processes, &store.all());
            if cli.json {
                return print_json(&processes);
            }
            for process in &processes {
                let owner = match (&process.project_id, &process.service_id) {
                    (Some(project), Some(service)) => format!("{project}/{service}"),
                    (Some(project), None) => project.clone(),
                    (None, _) => "-".to_string(),
                };
                println!(
                    "{:>7}  {:<16} {:<20} {}",
                    process.pid, process.name, owner, process.command_line
                );
            }
        }
        Commands::Up {
            project,
            timestamp,
            no_color,
        } => {
            let colors = !no_color && std::io::stdout().is_terminal();
            run_up(&settings, project, *timestamp, colors).await?;
        }
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Config file values, then CLI flags on top.
fn resolve_settings(cli: &Cli) -> Result<Settings> {
    let mut config: Config = config::discover_config(cli.config.as_deref(), cli.no_config)?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    if let Some(max_lines) = cli.max_lines {
        config.max_lines = Some(max_lines);
    }
    if let Some(grace) = cli.stop_grace_ms {
        config.stop_grace_ms = Some(grace);
    }
    Ok(Settings::from_config(&config))
}

fn open_registry(settings: &Settings) -> PortRegistry {
    PortRegistry::open(settings.allocations_path())
}

fn open_store(settings: &Settings) -> Result<ProjectStore> {
    let path = settings.projects_path();
    ProjectStore::open(path.clone()).with_context(|| format!("failed to open {}", path.display()))
}

fn print_detected(service: &DetectedService) {
    let port = service.port.map_or_else(|| "-".to_string(), |port| port.to_string());
    println!("{}: {}", service.display_name, service.working_dir.display());
    println!("  command: {}", service.command);
    println!(
        "  port: {port} from {} (confidence {:.2})",
        service.port_source.provenance, service.port_source.confidence
    );
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_up(settings: &Settings, project_id: &str, timestamp: bool, colors: bool) -> Result<()> {
    let store = open_store(settings)?;
    let project = store
        .get(project_id)
        .ok_or_else(|| anyhow!("unknown project '{project_id}'"))?;
    let registry = open_registry(settings);
    let detector = PortSourceDetector::new();
    let supervisor = ProcessSupervisor::current(settings);

    let names: Vec<String> = project
        .services
        .iter()
        .filter(|(_, service)| service.enabled)
        .map(|(id, _)| id.clone())
        .collect();
    if names.is_empty() {
        return Err(anyhow!("project '{project_id}' has no enabled services"));
    }
    let output = OutputState::new(&names, timestamp, colors);
    let (line_tx, mut line_rx) = mpsc::channel::<LogEvent>(settings.channel_capacity);

    for service_id in &names {
        let service = project.service(service_id)?;
        let plan = match plan_service_port(&detector, &registry, &project, service_id) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(service = %service_id, error = %err, "no port for service; skipped");
                continue;
            }
        };
        if let Err(err) = store.assign_port(&project.id, service_id, plan.assignment.clone()) {
            warn!(service = %service_id, error = %err, "failed to record port");
        }

        let key = ServiceKey::new(project.id.clone(), service_id.clone());
        let mut receiver = supervisor.subscribe_channel(&key, settings.channel_capacity);
        let forward = line_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if forward.send(event).await.is_err() {
                    break;
                }
            }
        });

        let mut env: HashMap<String, String> = service
            .env_overrides
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let var = plan.detection.env_var.clone().unwrap_or_else(|| "PORT".to_string());
        env.insert(var, plan.port.to_string());

        info!(service = %service_id, port = plan.port, stack = %plan.tech_stack, "starting service");
        if supervisor.start(&key, &service.start_command, &service.working_dir, &env) {
            if let Err(err) = registry.update_last_used(plan.port) {
                warn!(port = plan.port, error = %err, "failed to update allocation");
            }
        }
    }
    drop(line_tx);
    if let Err(err) = store.mark_run(&project.id) {
        warn!(error = %err, "failed to record run time");
    }

    let mut shutdown = spawn_signal_listener();
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            Some(event) = line_rx.recv() => output.print(&event),
            _ = &mut shutdown => {
                info!("shutting down");
                break;
            }
            _ = ticker.tick() => {
                if supervisor.running_keys().is_empty() {
                    break;
                }
            }
        }
    }
    supervisor.stop_all().await;
    // Stop lines are already queued by now.
    while let Ok(event) = line_rx.try_recv() {
        output.print(&event);
    }
    Ok(())
}

fn spawn_signal_listener() -> tokio::sync::oneshot::Receiver<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                    let _ = tx.send(());
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        let _ = tx.send(());
    });
    rx
}

/// Prefixes streamed lines with the service name.
struct OutputState {
    start: Instant,
    timestamp: bool,
    colors: bool,
    width: usize,
    index: BTreeMap<String, usize>,
}

const PREFIX_COLORS: &[&str] = &["cyan", "magenta", "yellow", "green", "blue", "red"];

impl OutputState {
    fn new(services: &[String], timestamp: bool, colors: bool) -> Self {
        Self {
            start: Instant::now(),
            timestamp,
            colors,
            width: services.iter().map(String::len).max().unwrap_or(0) + 2,
            index: services
                .iter()
                .enumerate()
                .map(|(idx, name)| (name.clone(), idx))
                .collect(),
        }
    }

    fn print(&self, event: &LogEvent) {
        println!("{}", self.format_line(&event.key.service_id, &event.line.text, event.line.stream));
    }

    fn format_line(&self, service: &str, text: &str, stream: StreamKind) -> String {
        let mut prefix = apply_prefix_length(format!("[{service}]"), Some(self.width));
        if self.colors {
            let color = self
                .index
                .get(service)
                .map(|idx| PREFIX_COLORS[idx % PREFIX_COLORS.len()]);
            prefix = apply_color(&prefix, color);
        }
        let marker = if stream == StreamKind::System { "~ " } else { "" };
        if self.timestamp {
            format!("{} {prefix} {marker}{text}", self.elapsed())
        } else {
            format!("{prefix} {marker}{text}")
        }
    }

    fn elapsed(&self) -> String {
        let secs = self.start.elapsed().as_secs();
        format!("{:02}:{:02}", secs / 60, secs % 60)
    }
}

fn apply_prefix_length(prefix: String, length: Option<usize>) -> String {
    let Some(length) = length else { return prefix };
    let mut out = prefix;
    if out.len() < length {
        out.push_str(&" ".repeat(length - out.len()));
    }
    out
}

fn apply_color(prefix: &str, color: Option<&str>) -> String {
    let code = match color.unwrap_or("").to_lowercase().as_str() {
        "red" => "31",
        "green" => "32",
        "yellow" => "33",
        "blue" => "34",
        "magenta" => "35",
        "cyan" => "36",
        _ => "0",
    };
    if code == "0" {
        prefix.to_string()
    } else {
        format!("\u{1b}[{}m{}\u{1b}[0m", code, prefix)
    }
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}
