use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use wave_agents::PtySessionHost;
use wave_core::{load_wave_config, ConfigError, GateKind, Issue, IssueId, NewIssue, WaveConfig};
use wave_notify::DirectoryInbox;
use waved::{RuntimeError, ServiceError, WaveController, WaveReport, WaveRuntime, WaveService};

const DEFAULT_CONFIG_PATH: &str = "wave.toml";
const CONFIG_ENV: &str = "WAVE_CONFIG";

#[derive(Parser)]
#[command(name = "wave", about = "Parallel work orchestration over a git repository")]
struct Cli {
    /// Path to wave.toml. Workers inherit it through WAVE_CONFIG.
    #[arg(long, global = true, env = CONFIG_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drain the backlog: spawn workers, verify, merge.
    Run {
        /// Run a single controller tick and exit.
        #[arg(long)]
        once: bool,
    },
    /// Add an issue to the backlog.
    Add {
        id: String,
        title: String,
        /// Lower runs first.
        #[arg(long, default_value_t = wave_core::DEFAULT_PRIORITY)]
        priority: i64,
        #[arg(long = "blocked-by")]
        blocked_by: Vec<String>,
        /// Verification gate required before merge (repeatable).
        #[arg(long = "gate")]
        gates: Vec<GateKind>,
    },
    /// List every issue.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Print the ready-set in scheduling order.
    Ready,
    /// Show one issue with its gate results and events.
    Show { id: String },
    /// Mark an in-progress issue closed (run by workers).
    Close {
        id: String,
        #[arg(long, default_value = "")]
        summary: String,
    },
    /// Tell a running controller an issue is done.
    Notify {
        id: String,
        #[arg(long, default_value = "")]
        summary: String,
    },
    /// Reopen a closed issue, or unblock a blocked one.
    Reopen {
        id: String,
        #[arg(long, default_value = "")]
        reason: String,
    },
    /// Record that `id` waits on `on`.
    Depend { id: String, on: String },
}

#[derive(Debug, thiserror::Error)]
enum MainError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("failed to resolve config path {path}: {source}")]
    ResolveConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize output: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("{count} issue(s) halted on merge conflicts")]
    MergeConflicts { count: usize },
    #[error(transparent)]
    Setup(#[from] anyhow::Error),
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("wave: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<(), MainError> {
    let cli = Cli::parse();
    let config_path = absolute_path(&cli.config)?;
    let config = load_config(&config_path)?;

    match cli.command {
        Command::Run { once } => run_wave(config, &config_path, once),
        Command::Add {
            id,
            title,
            priority,
            blocked_by,
            gates,
        } => {
            let mut new = NewIssue::new(id, title).with_priority(priority);
            for dep in blocked_by {
                new = new.blocked_by(dep);
            }
            for gate in gates {
                new = new.with_gate(gate);
            }
            let service = WaveService::open(config)?;
            let issue = service.add_issue(new, Utc::now())?;
            println!("added {} (priority {})", issue.id, issue.priority);
            Ok(())
        }
        Command::List { json } => {
            let service = WaveService::open(config)?;
            let issues = service.list()?;
            if json {
                print_json(&issues)
            } else {
                print_issues(&issues);
                Ok(())
            }
        }
        Command::Ready => {
            let service = WaveService::open(config)?;
            print_issues(&service.ready()?);
            Ok(())
        }
        Command::Show { id } => {
            let service = WaveService::open(config)?;
            print_json(&service.show(&IssueId::new(id))?)
        }
        Command::Close { id, summary } => {
            let service = WaveService::open(config)?;
            service.close(&IssueId::new(id), &summary, Utc::now())?;
            Ok(())
        }
        Command::Notify { id, summary } => {
            let service = WaveService::open(config)?;
            let path = service.notify(&IssueId::new(id), &summary)?;
            debug!(path = %path.display(), "notification written");
            Ok(())
        }
        Command::Reopen { id, reason } => {
            let service = WaveService::open(config)?;
            service.reopen(&IssueId::new(id), &reason, Utc::now())?;
            Ok(())
        }
        Command::Depend { id, on } => {
            let service = WaveService::open(config)?;
            let id = IssueId::new(id);
            let on = IssueId::new(on);
            if !service.depend(&id, &on, Utc::now())? {
                println!("{id} already waits on {on}");
            }
            Ok(())
        }
    }
}

fn run_wave(config: WaveConfig, config_path: &Path, once: bool) -> Result<(), MainError> {
    // Worker and gate sessions inherit the environment; `wave close` run
    // inside a workspace resolves the same config through it.
    env::set_var(CONFIG_ENV, config_path);

    let shutdown = install_shutdown_flag()?;
    let inbox = DirectoryInbox::new(config.inbox_dir());
    let service = WaveService::open(config)?;
    let runtime = WaveRuntime::from_service(&service, Arc::new(PtySessionHost::default()))?;
    let mut controller = WaveController::new(runtime, Box::new(inbox));

    let report = if once {
        controller.run_once(Utc::now())?
    } else {
        controller.run(&shutdown)?
    };
    print_report(&report);
    if report.has_conflicts() {
        return Err(MainError::MergeConflicts {
            count: report.conflicts.len(),
        });
    }
    Ok(())
}

fn install_shutdown_flag() -> anyhow::Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&flag))
            .with_context(|| format!("failed to register handler for signal {signal}"))?;
    }
    Ok(flag)
}

fn absolute_path(path: &Path) -> Result<PathBuf, MainError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = env::current_dir().map_err(|source| MainError::ResolveConfig {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(cwd.join(path))
}

/// Loads the config file, or falls back to defaults rooted next to where
/// the file would have been.
fn load_config(path: &Path) -> Result<WaveConfig, MainError> {
    if path.exists() {
        return Ok(load_wave_config(path)?);
    }
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    warn!(config = %path.display(), "config file not found, using defaults");
    let mut config = WaveConfig::default();
    config.anchor(base);
    Ok(config)
}

fn print_issues(issues: &[Issue]) {
    for issue in issues {
        let mut line = format!(
            "{:<20} {:<12} p{:<3} {}",
            issue.id.0,
            issue.status.as_str(),
            issue.priority,
            issue.title
        );
        if issue.is_archived() {
            line.push_str(" [merged]");
        }
        if !issue.blocking_ids.is_empty() {
            let deps = issue
                .blocking_ids
                .iter()
                .map(|id| id.0.as_str())
                .collect::<Vec<_>>()
                .join(",");
            line.push_str(&format!(" (after {deps})"));
        }
        println!("{line}");
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), MainError> {
    let rendered =
        serde_json::to_string_pretty(value).map_err(|source| MainError::Serialize { source })?;
    println!("{rendered}");
    Ok(())
}

fn print_report(report: &WaveReport) {
    info!(
        ticks = report.ticks,
        archived = report.archived.len(),
        blocked = report.blocked.len(),
        interrupted = report.interrupted,
        "run complete"
    );
    for id in &report.blocked {
        println!("blocked: {id}");
    }
    for (id, files) in &report.conflicts {
        println!("conflict: {id} ({})", files.join(", "));
    }
}
