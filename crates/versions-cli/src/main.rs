//! Versions CLI
//!
//! - `watch`: watch a directory tree and record one snapshot per change batch
//! - `replay`: feed recorded batches (JSON lines) through the same pipeline
//! - `serve`: read-only HTTP queries over a session log
//! - `sessions`: list session logs under the state directory

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use versions_store::{Session, StateLayout};
use versions_watch::{
    BatchSource, FsResolver, JsonLinesSource, NotifyTransport, RunnerSummary, SnapshotBuilder,
    WatchRunner,
};

mod config;
mod query_server;

use config::{ServeConfig, WatchConfig, DEFAULT_LISTEN};

#[derive(Parser)]
#[command(name = "versions")]
#[command(
    author,
    version,
    about = "Versions: content-addressed snapshots of a watched directory tree"
)]
struct Cli {
    #[command(flatten)]
    dirs: DirArgs,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct DirArgs {
    /// Session logs directory (default `~/.watcher`).
    #[arg(long, global = true, env = "VERSIONS_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Blob directory (default `~/.snapshots`).
    #[arg(long, global = true, env = "VERSIONS_SNAPSHOT_DIR")]
    snapshot_dir: Option<PathBuf>,
}

impl DirArgs {
    fn layout(&self) -> Result<StateLayout> {
        StateLayout::with_overrides(self.state_dir.clone(), self.snapshot_dir.clone())
            .context("failed to resolve state directories")
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a directory tree and record a snapshot for every change batch.
    ///
    /// The first batch enumerates the whole tree. Stop with ctrl-c; the batch
    /// in flight is finished first.
    Watch {
        /// Directory to watch
        #[arg(default_value = ".")]
        root: PathBuf,

        /// Quiet window (ms) used to coalesce filesystem events.
        #[arg(long, default_value_t = 200)]
        debounce_ms: u64,

        /// How long (ms) to wait for a batch before re-checking for shutdown.
        #[arg(long, default_value_t = 1000)]
        receive_timeout_ms: u64,
    },

    /// Replay recorded change batches (one JSON object per line) into a new session.
    Replay {
        /// JSON-lines file, or `-` for stdin
        input: PathBuf,

        /// Directory that file names in the batches are relative to
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },

    /// Serve read-only HTTP queries over a session.
    Serve(ServeArgs),

    /// List session logs, newest first.
    Sessions {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug, Clone)]
struct ServeArgs {
    /// Listen address (use `127.0.0.1:0` to auto-pick a free port).
    #[arg(long, env = "VERSIONS_LISTEN", default_value_t = DEFAULT_LISTEN)]
    listen: SocketAddr,

    /// Session to serve: `latest`, a session id, or an unambiguous id prefix.
    #[arg(long, default_value = "latest", conflicts_with = "wal")]
    session: String,

    /// Serve this session log directly instead of looking it up.
    #[arg(long)]
    wal: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Watch {
            root,
            debounce_ms,
            receive_timeout_ms,
        } => {
            let config = WatchConfig::from_millis(root, debounce_ms, receive_timeout_ms);
            cmd_watch(&cli.dirs, &config)
        }
        Commands::Replay { input, root } => cmd_replay(&cli.dirs, &input, root),
        Commands::Serve(args) => cmd_serve(&cli.dirs, args),
        Commands::Sessions { json } => cmd_sessions(&cli.dirs, json),
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .init();
}

/// Flip `flag` on the first ctrl-c. The watch loop polls it between batches.
fn install_ctrl_c(flag: Arc<AtomicBool>) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow!("failed to initialize signal runtime: {e}"))?;
    std::thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            rt.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("shutdown requested, finishing current batch");
                        flag.store(true, Ordering::SeqCst);
                    }
                    Err(e) => warn!(error = %e, "failed to listen for ctrl-c"),
                }
            })
        })
        .context("failed to spawn signal thread")?;
    Ok(())
}

fn cmd_watch(dirs: &DirArgs, config: &WatchConfig) -> Result<()> {
    let transport = NotifyTransport::new(&config.root, config.debounce)
        .with_context(|| format!("failed to watch {}", config.root.display()))?;
    let resolver = FsResolver::new(transport.root());
    let summary = run_session(dirs, transport, resolver, config.receive_timeout)?;
    print_summary(&summary)
}

fn cmd_replay(dirs: &DirArgs, input: &Path, root: PathBuf) -> Result<()> {
    let reader: Box<dyn BufRead> = if input.as_os_str() == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = File::open(input)
            .with_context(|| format!("failed to open {}", input.display()))?;
        Box::new(BufReader::new(file))
    };
    let root = root
        .canonicalize()
        .with_context(|| format!("failed to resolve {}", root.display()))?;
    let summary = run_session(
        dirs,
        JsonLinesSource::new(reader),
        FsResolver::new(root),
        versions_watch::DEFAULT_RECEIVE_TIMEOUT,
    )?;
    print_summary(&summary)
}

fn run_session<S: BatchSource>(
    dirs: &DirArgs,
    source: S,
    resolver: FsResolver,
    receive_timeout: std::time::Duration,
) -> Result<RunnerSummary> {
    let layout = dirs.layout()?;
    let Session { id, graph, content } = layout
        .start_session()
        .context("failed to start session")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    install_ctrl_c(shutdown.clone())?;

    let builder = SnapshotBuilder::new(graph, content, resolver);
    let mut runner = WatchRunner::new(source, builder)
        .with_receive_timeout(receive_timeout)
        .with_shutdown(shutdown);
    let summary = runner.run()?;

    info!(
        session = %id,
        wal = %layout.wal_path(&id).display(),
        snapshots = summary.snapshots,
        "session closed"
    );
    Ok(summary)
}

fn print_summary(summary: &RunnerSummary) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(summary)?);
    if summary.storage_failures > 0 {
        warn!(
            storage_failures = summary.storage_failures,
            "some batches were abandoned"
        );
    }
    if summary.malformed > 0 {
        warn!(malformed = summary.malformed, "some batches could not be parsed");
    }
    Ok(())
}

fn cmd_serve(dirs: &DirArgs, args: ServeArgs) -> Result<()> {
    let layout = dirs.layout()?;
    let wal_path = match args.wal {
        Some(path) => path,
        None => {
            let session = layout
                .resolve_session(&args.session)
                .with_context(|| format!("no session matching `{}`", args.session))?;
            info!(session = %session.id, "serving session");
            session.wal_path
        }
    };
    let config = ServeConfig::new(wal_path, layout.snapshot_dir.clone()).with_listen(args.listen);
    query_server::cmd_serve(config)
}

fn cmd_sessions(dirs: &DirArgs, json: bool) -> Result<()> {
    let layout = dirs.layout()?;
    let sessions = layout.list_sessions()?;

    if json {
        let rows: Vec<serde_json::Value> = sessions
            .iter()
            .map(|s| {
                serde_json::json!({
                    "id": s.id.to_string(),
                    "wal_path": s.wal_path.display().to_string(),
                    "size_bytes": s.size_bytes,
                    "modified": s.modified.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if sessions.is_empty() {
        println!("no sessions under {}", layout.state_dir.display());
        return Ok(());
    }
    for s in &sessions {
        println!(
            "{}  {:>10}  {}  {}",
            s.id,
            s.size_bytes,
            s.modified.format("%Y-%m-%d %H:%M:%S"),
            s.wal_path.display()
        );
    }
    Ok(())
}
