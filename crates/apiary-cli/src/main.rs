//! apiary - operator CLI over the task coordination store.
//!
//! Every command prints JSON on stdout; logs go to stderr.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use apiary_core::app::App;
use apiary_core::domain::{Actor, EventKind, Priority, TaskId, TaskStatus, WatchEvent, WorkerId};
use apiary_core::ports::{IdGenerator, SystemClock, UlidGenerator};
use apiary_core::{ApiaryConfig, AppBuilder, NewTask, Task};

const DEFAULT_DB: &str = ".apiary";

#[derive(Parser, Debug)]
#[command(name = "apiary")]
#[command(about = "Shared task coordination store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// sled database directory (overrides storage.path)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a new pending task
    Create {
        #[arg(short, long)]
        title: String,
        #[arg(short, long, default_value = "")]
        description: String,
        #[arg(short, long, default_value = "medium")]
        priority: Priority,
        /// Task that must complete first (repeatable)
        #[arg(long = "depends-on")]
        depends_on: Vec<TaskId>,
        /// key=value metadata; value is parsed as JSON, else kept as a string (repeatable)
        #[arg(short, long = "meta")]
        meta: Vec<String>,
        /// Use this id instead of generating one
        #[arg(long)]
        id: Option<TaskId>,
    },
    /// Show one task
    Show { id: TaskId },
    /// List tasks, optionally in one status
    List {
        #[arg(short, long)]
        status: Option<TaskStatus>,
    },
    /// Claim the next available task, or a specific one
    Claim {
        #[arg(short, long)]
        worker: WorkerId,
        /// Bands to try, in order (repeatable; default from config)
        #[arg(short, long = "band")]
        bands: Vec<Priority>,
        #[arg(long)]
        id: Option<TaskId>,
    },
    /// Mark a claimed task completed
    Complete {
        id: TaskId,
        #[arg(short, long)]
        worker: WorkerId,
    },
    /// Mark a claimed task failed
    Fail {
        id: TaskId,
        #[arg(short, long, required_unless_present = "reaper")]
        worker: Option<WorkerId>,
        /// Act as the reaper (lease must have expired)
        #[arg(long, conflicts_with = "worker")]
        reaper: bool,
        #[arg(short, long)]
        reason: Option<String>,
    },
    /// Give a claimed task back to pending
    Release {
        id: TaskId,
        #[arg(short, long)]
        worker: WorkerId,
    },
    /// Requeue a failed task if the retry policy allows it
    Retry { id: TaskId },
    /// Run one reaper sweep
    Reap,
    /// Task counts per status
    Counts,
    /// Follow changes under a key prefix
    ///
    /// Only changes made by this process are seen. sled locks the database
    /// for as long as the watch runs, so other apiary commands against the
    /// same --db cannot open it until the watch exits. Pass --reap to run the
    /// reaper here and see its moves.
    Watch {
        #[arg(default_value = "")]
        prefix: String,
        /// Stop after this many events
        #[arg(short = 'n', long)]
        count: Option<usize>,
        /// Run the reaper loop in this process while watching
        #[arg(long)]
        reap: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<ApiaryConfig> {
    let mut config = match &cli.config {
        Some(path) => ApiaryConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ApiaryConfig::default(),
    };
    if let Some(db) = &cli.db {
        config.storage.path = Some(db.clone());
    }
    if config.storage.path.is_none() {
        config.storage.path = Some(PathBuf::from(DEFAULT_DB));
    }
    Ok(config)
}

fn parse_meta(entry: &str) -> Result<(String, serde_json::Value)> {
    let Some((key, raw)) = entry.split_once('=') else {
        bail!("metadata {entry:?} is not key=value");
    };
    if key.is_empty() {
        bail!("metadata {entry:?} has an empty key");
    }
    let value = serde_json::from_str(raw)
        .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct EventView {
    key: String,
    kind: EventKind,
    revision: u64,
    task: Option<Task>,
}

impl EventView {
    fn from_event(event: WatchEvent) -> Result<Self> {
        let task = event
            .task()
            .transpose()
            .with_context(|| format!("decoding {}", event.key))?;
        Ok(Self {
            key: event.key,
            kind: event.kind,
            revision: event.revision,
            task,
        })
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let app = AppBuilder::new(config).build().context("opening store")?;
    let board = app.board();

    match cli.command {
        Commands::Create {
            title,
            description,
            priority,
            depends_on,
            meta,
            id,
        } => {
            let id = id.unwrap_or_else(|| UlidGenerator::new(SystemClock).generate_task_id());
            let mut new = NewTask::new(id, title)
                .description(description)
                .priority(priority);
            for dep in depends_on {
                new = new.depends_on(dep);
            }
            for entry in &meta {
                let (key, value) = parse_meta(entry)?;
                new = new.metadata(key, value);
            }
            print_json(&board.create(new)?)?;
        }
        Commands::Show { id } => print_json(&board.get(id)?)?,
        Commands::List { status } => print_json(&board.list(status)?)?,
        Commands::Claim { worker, bands, id } => {
            let claimed = match id {
                Some(id) => Some(board.claim_task(id, &worker)?),
                None if bands.is_empty() => app.coordinator().claim_next(&worker).await?,
                None => app.coordinator().claim(&worker, &bands).await?,
            };
            print_json(&claimed)?;
        }
        Commands::Complete { id, worker } => print_json(&board.complete(id, &worker)?)?,
        Commands::Fail {
            id,
            worker,
            reaper,
            reason,
        } => {
            let actor = match (worker, reaper) {
                (Some(worker), false) => Actor::Worker(worker),
                (None, true) => Actor::Reaper,
                _ => bail!("give exactly one of --worker or --reaper"),
            };
            print_json(&board.fail(id, &actor, reason)?)?;
        }
        Commands::Release { id, worker } => print_json(&board.release(id, &worker)?)?,
        Commands::Retry { id } => print_json(&board.retry(id, &Actor::Operator)?)?,
        Commands::Reap => print_json(&app.reaper().sweep()?)?,
        Commands::Counts => print_json(&board.counts()?)?,
        Commands::Watch {
            prefix,
            count,
            reap,
        } => watch_prefix(&app, prefix, count, reap).await?,
    }

    app.board().store().flush()?;
    Ok(())
}

async fn watch_prefix(app: &App, prefix: String, count: Option<usize>, reap: bool) -> Result<()> {
    let mut subscription = app.board().watch(prefix);
    info!(
        subscription = subscription.id(),
        prefix = subscription.prefix(),
        "watching"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = reap.then(|| tokio::spawn(app.reaper().run(shutdown_rx)));

    let mut seen = 0;
    loop {
        if count.is_some_and(|n| seen >= n) {
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                debug!("interrupted");
                break;
            }
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let line = serde_json::to_string(&EventView::from_event(event)?)?;
                println!("{line}");
                seen += 1;
            }
        }
    }

    subscription.unsubscribe();
    let _ = shutdown_tx.send(true);
    if let Some(handle) = reaper {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .context("reaper did not stop")??;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    run(cli).await
}
