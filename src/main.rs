use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::{Local, Utc};
use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod db;
mod evolution;
mod ingest;
mod models;
mod report;
mod session;

use evolution::{AnalysisWindow, EvolutionSeries};
use models::{Cluster, ClusterRecord, Session, SessionConfig, SessionStatus, TimePoint};
use session::{SessionEvent, SessionView};

#[derive(Parser)]
#[command(name = "zone-opinion-evolution")]
#[command(about = "Opinion evolution series for zone analysis sessions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Csv,
    Markdown,
}

#[derive(clap::Args)]
struct OutputArgs {
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,
    /// Write to this file instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,
    /// Align buckets to UTC instead of the local time zone
    #[arg(long)]
    utc: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a realistic demo session
    Seed,
    /// Import points (and optionally clusters) for a session from CSV files
    Import {
        #[arg(long)]
        session: Uuid,
        #[arg(long)]
        points: PathBuf,
        #[arg(long)]
        clusters: Option<PathBuf>,
    },
    /// Build the opinion evolution series of a stored session
    Evolution {
        #[arg(long)]
        session: Uuid,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Build the series from API response files, without a database
    #[command(group(
        ArgGroup::new("window")
            .args(["session_json", "start"])
            .required(true)
            .multiple(false)
    ))]
    Chart {
        #[arg(long)]
        points: PathBuf,
        #[arg(long)]
        clusters: PathBuf,
        #[arg(long)]
        session_json: Option<PathBuf>,
        #[arg(long, requires = "end")]
        start: Option<String>,
        #[arg(long, requires = "start")]
        end: Option<String>,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Follow a running session and emit the series once it completes
    Watch {
        #[arg(long)]
        session: Uuid,
        #[arg(long, default_value_t = 5)]
        interval_secs: u64,
        #[arg(long, default_value_t = 720)]
        max_polls: usize,
        /// Override the start of the session's analysis window
        #[arg(long, requires = "end")]
        start: Option<String>,
        #[arg(long, requires = "start")]
        end: Option<String>,
        #[command(flatten)]
        output: OutputArgs,
    },
}

async fn connect() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to the analysis Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

fn evolve(
    window: &AnalysisWindow,
    clusters: &[Cluster],
    points: &[TimePoint],
    utc: bool,
) -> EvolutionSeries {
    if utc {
        evolution::build_evolution(window, clusters, points, &Utc)
    } else {
        evolution::build_evolution(window, clusters, points, &Local)
    }
}

fn emit(
    output: &OutputArgs,
    session: &Session,
    clusters: &[Cluster],
    series: &EvolutionSeries,
) -> anyhow::Result<()> {
    let rendered = match output.format {
        OutputFormat::Json => report::render_json(series)?,
        OutputFormat::Csv => report::render_csv(series, clusters)?,
        OutputFormat::Markdown => report::build_report(session, clusters, series),
    };

    match &output.out {
        Some(path) => {
            std::fs::write(path, rendered)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Series written to {}.", path.display());
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

fn to_clusters(records: &[ClusterRecord]) -> Vec<Cluster> {
    records.iter().map(ClusterRecord::to_cluster).collect()
}

async fn stored_series(
    pool: &PgPool,
    session: &Session,
    window: &AnalysisWindow,
    utc: bool,
) -> anyhow::Result<(Vec<Cluster>, EvolutionSeries)> {
    let clusters = to_clusters(&db::fetch_clusters(pool, session.id).await?);
    let points = db::fetch_time_points(pool, session.id).await?;
    info!(
        session = %session.id,
        clusters = clusters.len(),
        points = points.len(),
        "loaded session results"
    );
    let series = evolve(window, &clusters, &points, utc);
    Ok((clusters, series))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::InitDb => {
            let pool = connect().await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let pool = connect().await?;
            let session_id = db::seed(&pool).await?;
            println!("Seed session {session_id} inserted.");
        }
        Commands::Import {
            session,
            points,
            clusters,
        } => {
            let pool = connect().await?;
            db::fetch_session(&pool, session).await?;
            let inserted = db::import_csv(&pool, session, &points, clusters.as_deref()).await?;
            println!("Inserted {inserted} points from {}.", points.display());
        }
        Commands::Evolution { session, output } => {
            let pool = connect().await?;
            let session = db::fetch_session(&pool, session).await?;
            if session.status != SessionStatus::Completed {
                warn!(
                    session = %session.id,
                    status = session.status.as_str(),
                    "session has not completed, series may be partial"
                );
            }
            let window = AnalysisWindow::from_config(&session.config)?;
            let (clusters, series) = stored_series(&pool, &session, &window, output.utc).await?;
            emit(&output, &session, &clusters, &series)?;
        }
        Commands::Chart {
            points,
            clusters,
            session_json,
            start,
            end,
            output,
        } => {
            let session = match (session_json, start, end) {
                (Some(path), _, _) => ingest::load_session_json(&path)?,
                (None, Some(start_date), Some(end_date)) => Session {
                    id: Uuid::nil(),
                    zone: String::new(),
                    status: SessionStatus::Completed,
                    progress: 100.0,
                    config: SessionConfig {
                        start_date,
                        end_date,
                    },
                },
                _ => anyhow::bail!("either --session-json or --start and --end are required"),
            };
            let window = AnalysisWindow::from_config(&session.config)?;
            let clusters = to_clusters(&ingest::load_clusters_json(&clusters)?);
            let records = ingest::load_points_json(&points)?;
            let (time_points, summary) = ingest::to_time_points(&records);
            if summary.skipped > 0 {
                warn!(
                    skipped = summary.skipped,
                    accepted = summary.accepted,
                    "some points were skipped"
                );
            }
            let series = evolve(&window, &clusters, &time_points, output.utc);
            emit(&output, &session, &clusters, &series)?;
        }
        Commands::Watch {
            session,
            interval_secs,
            max_polls,
            start,
            end,
            output,
        } => {
            let pool = connect().await?;
            let override_window = match (start, end) {
                (Some(start), Some(end)) => Some(AnalysisWindow::from_config(&SessionConfig {
                    start_date: start,
                    end_date: end,
                })?),
                _ => None,
            };
            let mut view = SessionView::default();

            for poll in 0..max_polls.max(1) {
                let current = db::fetch_session(&pool, session).await?;
                let event = if view.session_id.is_none() {
                    SessionEvent::Loaded(current.clone())
                } else {
                    SessionEvent::StatusChanged {
                        status: current.status,
                        progress: current.progress,
                    }
                };
                view = session::apply(&view, event);
                if let (Some(window), true) = (override_window, poll == 0) {
                    view = session::apply(&view, SessionEvent::WindowChanged(window));
                }
                info!(
                    poll,
                    status = view.status.as_str(),
                    progress = view.progress,
                    "session status"
                );

                if view.needs_results {
                    let window = match (view.window, &view.window_error) {
                        (Some(window), _) => window,
                        (None, Some(err)) => {
                            anyhow::bail!("session has no valid analysis window: {err}")
                        }
                        (None, None) => anyhow::bail!("session has no valid analysis window"),
                    };
                    let (clusters, series) =
                        stored_series(&pool, &current, &window, output.utc).await?;
                    emit(&output, &current, &clusters, &series)?;
                    view = session::apply(&view, SessionEvent::ResultsLoaded);
                }

                if view.status.is_terminal() {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(interval_secs)).await;
            }

            match view.status {
                SessionStatus::Completed => {}
                SessionStatus::Failed | SessionStatus::Cancelled => {
                    anyhow::bail!("session {session} ended as {}", view.status.as_str())
                }
                status => println!(
                    "Session {session} still {} after {max_polls} polls.",
                    status.as_str()
                ),
            }
        }
    }

    Ok(())
}
