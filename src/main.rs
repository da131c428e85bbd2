use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use claude_trace_lib::config::Config;
use claude_trace_lib::db::queries;
use claude_trace_lib::export::{self, ExportFormat};
use claude_trace_lib::ingest::import_metrics;
use claude_trace_lib::metrics::stats::{aggregate_statistics, compare_sessions, compute_statistics};
use claude_trace_lib::metrics::timeline::build_timeline;
use claude_trace_lib::metrics::tokens::TokenBreakdown;
use claude_trace_lib::models::{ResourceSnapshot, ResourceSummary, SessionFilter, StageUsage};
use claude_trace_lib::monitor::{self, ResourceMonitor, StageStart, SystemSampler};
use claude_trace_lib::watcher::{discovery, TranscriptWatcher};
use claude_trace_lib::{init_tracing, run_hook, Context, TraceError, TraceResult};

#[derive(Parser)]
#[command(name = "claude-trace")]
#[command(about = "Rebuild Claude Code sessions from transcripts and OpenTelemetry metrics")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path (defaults to config.toml in the data directory)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Process the hook payload on stdin (default)
    Hook,

    /// Poll a transcript and ingest appended lines until interrupted
    Watch {
        /// Transcript to watch (defaults to the most recent one)
        path: Option<PathBuf>,

        /// Session id (defaults to the transcript's file name)
        #[arg(short, long)]
        session: Option<String>,

        /// Also record resource snapshots, one stage per turn
        #[arg(short, long)]
        resources: bool,

        /// Process whose memory and disk traffic to record (defaults to this one)
        #[arg(long)]
        pid: Option<u32>,
    },

    /// Record resource snapshots for a session until interrupted
    Monitor {
        session_id: String,

        /// Name of a stage spanning the whole run
        #[arg(short, long)]
        stage: Option<String>,

        #[arg(long)]
        pid: Option<u32>,
    },

    /// Show recorded resource usage of a session
    Resource {
        session_id: String,

        /// Include individual snapshots
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show which transcript, metrics and resource data exist for a session
    FindLogs { session_id: String },

    /// Ingest a transcript once
    Ingest {
        path: PathBuf,

        #[arg(short, long)]
        session: Option<String>,
    },

    /// Import a session's metrics file
    ImportMetrics { session_id: String },

    /// List stored sessions
    Sessions {
        /// Only sessions active within this many days
        #[arg(short, long)]
        days: Option<i64>,

        #[arg(short, long)]
        limit: Option<u32>,
    },

    /// Show statistics for a session
    Stats { session_id: String },

    /// Show statistics summed over stored sessions
    Aggregate {
        #[arg(short, long)]
        days: Option<i64>,
    },

    /// Compare sessions side by side
    Compare {
        #[arg(required = true)]
        session_ids: Vec<String>,
    },

    /// Show a session's event timeline
    Timeline { session_id: String },

    /// Show a session's tokens by turn and model
    Tokens { session_id: String },

    /// Export sessions to CSV or JSON
    Export {
        #[arg(short, long, default_value = "json")]
        format: String,

        #[arg(short, long)]
        days: Option<i64>,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },

    /// Export a session's tool calls to CSV
    ExportTools {
        session_id: String,

        /// Only this tool
        #[arg(short, long)]
        tool: Option<String>,

        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },

    /// Delete a session and everything recorded for it
    Delete { session_id: String },

    /// Session to metrics-file mappings
    Mapping {
        #[command(subcommand)]
        command: MappingCommands,
    },
}

#[derive(Subcommand)]
enum MappingCommands {
    /// Map a session to a metrics file
    Register {
        session_id: String,
        path: PathBuf,
        #[arg(short, long)]
        description: Option<String>,
    },
    /// Print the metrics file of a session, registering the default if needed
    Ensure {
        session_id: String,
        #[arg(short, long)]
        description: Option<String>,
    },
    /// Print the metrics file of a session without registering anything
    Resolve { session_id: String },
    /// List all mappings
    List,
    /// Remove a session's mapping
    Remove { session_id: String },
}

#[derive(Serialize)]
struct ResourceReport {
    summary: ResourceSummary,
    stages: Vec<StageUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshots: Option<Vec<ResourceSnapshot>>,
}

fn sampler(pid: Option<u32>) -> SystemSampler {
    match pid {
        Some(pid) => SystemSampler::for_process(Some(sysinfo::Pid::from_u32(pid))),
        None => SystemSampler::new(),
    }
}

/// Token cancelled on Ctrl-C
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });
    cancel
}

fn filter(days: Option<i64>, limit: Option<u32>) -> SessionFilter {
    let mut filter = days.map(SessionFilter::last_days).unwrap_or_default();
    filter.limit = limit;
    filter
}

fn print_json<T: Serialize>(value: &T) -> TraceResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn session_id_for(path: &std::path::Path, explicit: Option<String>) -> TraceResult<String> {
    match explicit {
        Some(id) => Ok(id),
        None => discovery::session_id_from_path(path)
            .ok_or_else(|| TraceError::InvalidInput(format!("no session id for {:?}", path))),
    }
}

async fn run(cli: Cli) -> TraceResult<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let command = cli.command.unwrap_or(Commands::Hook);
    if let Commands::Hook = command {
        return print_json(&run_hook(std::io::stdin().lock(), config)?);
    }

    let ctx = Context::open(config)?;

    match command {
        Commands::Hook => {}
        Commands::Watch {
            path,
            session,
            resources,
            pid,
        } => {
            let path = match path {
                Some(path) => path,
                None => discovery::latest_transcript(&ctx.config.projects_dir())?
                    .ok_or_else(|| TraceError::InvalidInput("no transcript found".to_string()))?,
            };
            let session_id = session_id_for(&path, session)?;
            let watcher = TranscriptWatcher::new(path, session_id.clone(), ctx.config.poll_interval());
            let cancel = interrupt_token();

            let (stage_tx, stage_rx) = mpsc::unbounded_channel();
            let watch = watcher.run(&ctx.db, cancel.clone(), |report| {
                tracing::info!(
                    "{} new lines, {} turns updated",
                    report.lines_read,
                    report.turns
                );
                if let Some(turn) = report.last_turn.filter(|_| resources) {
                    let _ = stage_tx.send(StageStart::turn(turn));
                }
            });

            if resources {
                let mut monitor = ResourceMonitor::new(&ctx.db, &session_id, sampler(pid));
                let record = monitor.run(ctx.config.resource_interval(), cancel.clone(), stage_rx);
                tokio::join!(watch, record);
            } else {
                watch.await;
            }
        }
        Commands::Monitor {
            session_id,
            stage,
            pid,
        } => {
            let (stage_tx, stage_rx) = mpsc::unbounded_channel();
            if let Some(stage) = stage {
                let _ = stage_tx.send(StageStart {
                    stage_id: stage.clone(),
                    stage_name: stage,
                });
            }
            drop(stage_tx);

            let mut monitor = ResourceMonitor::new(&ctx.db, &session_id, sampler(pid));
            monitor
                .run(ctx.config.resource_interval(), interrupt_token(), stage_rx)
                .await;
            print_json(&monitor.summary())?;
        }
        Commands::Resource { session_id, verbose } => {
            let summary = monitor::session_resource_summary(&ctx.db, &session_id)?.ok_or_else(|| {
                TraceError::InvalidInput(format!("no resource data recorded for {}", session_id))
            })?;
            let (stages, snapshots) = ctx.db.with_connection(|conn| {
                let stages = queries::get_stage_usage(conn, &session_id)?;
                let snapshots = if verbose {
                    Some(queries::get_resource_snapshots(conn, &session_id)?)
                } else {
                    None
                };
                Ok((stages, snapshots))
            })?;
            print_json(&ResourceReport {
                summary,
                stages,
                snapshots,
            })?;
        }
        Commands::FindLogs { session_id } => {
            print_json(&ctx.find_logs(&session_id)?)?;
        }
        Commands::Ingest { path, session } => {
            let session_id = session_id_for(&path, session)?;
            print_json(&ctx.process_session(&path, &session_id)?)?;
        }
        Commands::ImportMetrics { session_id } => {
            print_json(&import_metrics(&ctx.db, &ctx.mappings, &ctx.collector, &session_id)?)?;
        }
        Commands::Sessions { days, limit } => {
            let sessions = ctx
                .db
                .with_connection(|conn| queries::list_sessions(conn, &filter(days, limit)))?;
            print_json(&sessions)?;
        }
        Commands::Stats { session_id } => {
            let stats = compute_statistics(&ctx.db, &session_id)?
                .ok_or_else(|| TraceError::SessionNotFound(session_id.clone()))?;
            print_json(&stats)?;
        }
        Commands::Aggregate { days } => {
            print_json(&aggregate_statistics(&ctx.db, &filter(days, None))?)?;
        }
        Commands::Compare { session_ids } => {
            print_json(&compare_sessions(&ctx.db, &session_ids)?)?;
        }
        Commands::Timeline { session_id } => {
            let detail = ctx
                .db
                .with_connection(|conn| queries::get_session_detail(conn, &session_id))?
                .ok_or_else(|| TraceError::SessionNotFound(session_id.clone()))?;
            print_json(&build_timeline(&detail))?;
        }
        Commands::Tokens { session_id } => {
            let detail = ctx
                .db
                .with_connection(|conn| queries::get_session_detail(conn, &session_id))?
                .ok_or_else(|| TraceError::SessionNotFound(session_id.clone()))?;
            print_json(&TokenBreakdown::from_detail(&detail))?;
        }
        Commands::Export { format, days, out } => {
            let format: ExportFormat = format.parse()?;
            let path = export::export_sessions(&ctx.db, &filter(days, None), format, &out)?;
            println!("{}", path.display());
        }
        Commands::ExportTools { session_id, tool, out } => {
            let path = export::export_tool_uses(&ctx.db, &session_id, tool.as_deref(), &out)?;
            println!("{}", path.display());
        }
        Commands::Delete { session_id } => {
            let deleted = ctx
                .db
                .with_connection(|conn| queries::delete_session(conn, &session_id))?;
            if !deleted {
                return Err(TraceError::SessionNotFound(session_id));
            }
            tracing::info!("Deleted session {}", session_id);
        }
        Commands::Mapping { command } => match command {
            MappingCommands::Register {
                session_id,
                path,
                description,
            } => {
                print_json(&ctx.mappings.register(&session_id, &path, description.as_deref())?)?;
            }
            MappingCommands::Ensure {
                session_id,
                description,
            } => {
                let path = ctx.mappings.get_or_create(&session_id, description.as_deref())?;
                println!("{}", path.display());
            }
            MappingCommands::Resolve { session_id } => {
                println!("{}", ctx.mappings.resolve(&session_id)?.display());
            }
            MappingCommands::List => print_json(&ctx.mappings.list()?)?,
            MappingCommands::Remove { session_id } => {
                if !ctx.mappings.remove(&session_id)? {
                    return Err(TraceError::SessionNotFound(session_id));
                }
            }
        },
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
