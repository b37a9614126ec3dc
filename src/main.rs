use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use roster_sync::config::{EngineConfig, HttpSourceConfig};
use roster_sync::db::{self, PgDataSource};
use roster_sync::http::HttpDataSource;
use roster_sync::report;
use roster_sync::source::{DataSource, InMemoryDataSource};
use roster_sync::stats::StatisticsAggregator;
use roster_sync::{Mutation, MutationError, RosterEngine, Student, StudentId};

#[derive(Parser)]
#[command(name = "roster-sync")]
#[command(about = "Live student roster sync with grade and attendance statistics", long_about = None)]
struct Cli {
    /// Where the roster lives
    #[arg(long, value_enum, default_value_t = SourceKind::Http, global = true)]
    source: SourceKind,
    #[arg(
        long,
        env = "ROSTER_BASE_URL",
        default_value = "http://localhost:8080/students/",
        global = true
    )]
    base_url: String,
    /// Accept self-signed TLS certificates from the roster service
    #[arg(long, global = true)]
    insecure: bool,
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,
    #[arg(long, env = "ROSTER_CSV", global = true)]
    roster_csv: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum SourceKind {
    Http,
    Postgres,
    Csv,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the roster and print every published change until interrupted
    Watch {
        /// Also follow one student's full record
        #[arg(long)]
        student: Option<StudentId>,
        /// Override the poll interval for roster and statistics, in seconds
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Compute statistics once and print them
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Write a markdown statistics report
    Report {
        #[arg(long, default_value = "roster-report.md")]
        out: PathBuf,
    },
    /// Append a grade to a student
    AddGrade { id: StudentId, grade: f64 },
    /// Record one attended (or missed) session
    AddAttendance {
        id: StudentId,
        #[arg(long)]
        absent: bool,
    },
    /// Register a new student
    Register {
        name: String,
        age: u32,
        #[arg(long)]
        id: Option<StudentId>,
    },
    /// Change a student's name or age
    Update {
        id: StudentId,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        age: Option<u32>,
    },
    /// Delete a student
    Delete { id: StudentId },
    /// Create or upgrade the database schema
    InitDb,
    /// Load sample students into the database
    Seed,
    /// Import students from a CSV file into the database
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = EngineConfig::from_env()?;

    match cli.command {
        Commands::InitDb => {
            let pool = db::connect(require_database_url(&cli)?).await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let pool = db::connect(require_database_url(&cli)?).await?;
            let written = db::seed(&pool).await?;
            println!("Seeded {written} students.");
        }
        Commands::Import { ref csv } => {
            let pool = db::connect(require_database_url(&cli)?).await?;
            let written = db::import_csv(&pool, csv).await?;
            println!("Imported {written} students from {}.", csv.display());
        }
        Commands::Watch {
            student,
            interval_secs,
        } => {
            if let Some(secs) = interval_secs {
                anyhow::ensure!(secs > 0, "--interval-secs must be greater than zero");
                config.roster_interval = Duration::from_secs(secs);
                config.statistics_interval = Duration::from_secs(secs);
                config.detail_interval = Duration::from_secs(secs);
            }
            let (source, label) = open_source(&cli).await?;
            println!("Watching {label} (Ctrl-C to stop).");
            watch(RosterEngine::new(source, config), student).await?;
        }
        Commands::Stats { json } => {
            let (source, label) = open_source(&cli).await?;
            let students = source
                .fetch_all_detailed()
                .await
                .with_context(|| format!("failed to fetch roster from {label}"))?;
            let stats = StatisticsAggregator::new(config.thresholds).compute(&students);

            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print_statistics(&stats);
            }
        }
        Commands::Report { ref out } => {
            let (source, label) = open_source(&cli).await?;
            let students = source
                .fetch_all_detailed()
                .await
                .with_context(|| format!("failed to fetch roster from {label}"))?;
            let stats = StatisticsAggregator::new(config.thresholds).compute(&students);
            let report = report::build_report(&label, Utc::now(), &config.thresholds, &stats);
            std::fs::write(out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::AddGrade { id, grade } => {
            let (source, _) = open_source(&cli).await?;
            let mutation = Mutation::AddGrade {
                student_id: id,
                grade,
            };
            run_mutation(source, config, mutation, &format!("Grade {grade} added to student {id}."))
                .await?;
        }
        Commands::AddAttendance { id, absent } => {
            let (source, _) = open_source(&cli).await?;
            let mutation = Mutation::AddAttendance {
                student_id: id,
                present: !absent,
            };
            let mark = if absent { "Absence" } else { "Presence" };
            run_mutation(source, config, mutation, &format!("{mark} recorded for student {id}."))
                .await?;
        }
        Commands::Register { ref name, age, id } => {
            let (source, _) = open_source(&cli).await?;
            let student = Student::new(id.unwrap_or(0), name.clone(), age);
            run_mutation(
                source,
                config,
                Mutation::Register(student),
                &format!("Registered {name}."),
            )
            .await?;
        }
        Commands::Update { id, ref name, age } => {
            anyhow::ensure!(
                name.is_some() || age.is_some(),
                "nothing to update, pass --name and/or --age"
            );
            let (source, _) = open_source(&cli).await?;
            let mut student = source
                .fetch_by_id(id)
                .await?
                .with_context(|| format!("student {id} not found"))?;
            if let Some(name) = name {
                student.name = name.clone();
            }
            if let Some(age) = age {
                student.age = age;
            }
            run_mutation(
                source,
                config,
                Mutation::Update(student),
                &format!("Student {id} updated."),
            )
            .await?;
        }
        Commands::Delete { id } => {
            let (source, _) = open_source(&cli).await?;
            run_mutation(
                source,
                config,
                Mutation::Delete { student_id: id },
                &format!("Student {id} deleted."),
            )
            .await?;
        }
    }

    Ok(())
}

fn require_database_url(cli: &Cli) -> anyhow::Result<&str> {
    cli.database_url
        .as_deref()
        .context("DATABASE_URL must be set to a production Postgres instance")
}

async fn open_source(cli: &Cli) -> anyhow::Result<(Arc<dyn DataSource>, String)> {
    match cli.source {
        SourceKind::Http => {
            let config = HttpSourceConfig {
                base_url: cli.base_url.clone(),
                accept_invalid_certs: cli.insecure,
                ..HttpSourceConfig::default()
            };
            let source = HttpDataSource::new(&config).context("failed to build HTTP client")?;
            let label = source.base_url().to_string();
            Ok((Arc::new(source), label))
        }
        SourceKind::Postgres => {
            let pool = db::connect(require_database_url(cli)?).await?;
            Ok((Arc::new(PgDataSource::new(pool)), "postgres".to_string()))
        }
        SourceKind::Csv => {
            let path = cli
                .roster_csv
                .as_ref()
                .context("--roster-csv (or ROSTER_CSV) is required for the csv source")?;
            let source = InMemoryDataSource::from_csv(path)?;
            Ok((Arc::new(source), path.display().to_string()))
        }
    }
}

async fn run_mutation(
    source: Arc<dyn DataSource>,
    config: EngineConfig,
    mutation: Mutation,
    success: &str,
) -> anyhow::Result<()> {
    let engine = RosterEngine::new(source, config);
    let outcome = engine.submit_mutation(mutation).outcome().await;
    engine.shutdown().await;

    match outcome {
        Ok(()) => {
            println!("{success}");
            Ok(())
        }
        Err(err) => anyhow::bail!(describe_mutation_error(&err)),
    }
}

fn describe_mutation_error(err: &MutationError) -> String {
    match err {
        MutationError::NotFound(id) => format!("No student with id {id} exists."),
        MutationError::WriteFailed { student_id, reason } => {
            format!("The roster service refused the change to student {student_id}: {reason}")
        }
        MutationError::Transport(reason) => {
            format!("Could not reach the roster service: {reason}")
        }
        other => other.to_string(),
    }
}

async fn watch(engine: RosterEngine, student: Option<StudentId>) -> anyhow::Result<()> {
    let mut roster = engine.subscribe_roster();
    let mut stats = engine.subscribe_statistics();
    let mut failures = engine.subscribe_failures();
    let mut detail = engine.subscribe_student();

    engine.start_polling()?;
    if let Some(id) = student {
        engine.watch_student(id)?;
    }

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            result = &mut interrupted => {
                result.context("failed to listen for Ctrl-C")?;
                break;
            }
            Ok(()) = roster.changed() => {
                let snapshot = roster.borrow_and_update().clone();
                println!(
                    "[{}] roster: {} students",
                    snapshot.fetched_at().format("%H:%M:%S"),
                    snapshot.len()
                );
                for summary in snapshot.entries() {
                    println!("  #{} {} ({})", summary.id, summary.name, summary.age);
                }
            }
            Ok(()) = stats.changed() => {
                let current = stats.borrow_and_update().clone();
                if let Some(current) = current {
                    print_statistics(&current);
                }
            }
            Ok(()) = detail.changed() => {
                let current = detail.borrow_and_update().clone();
                if let Some(student) = current {
                    println!(
                        "student #{} {}: grades {:?}, attendance {:.0}%",
                        student.id,
                        student.name,
                        student.grades,
                        student.attendance_rate()
                    );
                }
            }
            Ok(()) = failures.changed() => {
                let current = failures.borrow_and_update().clone();
                if let Some(failure) = current {
                    eprintln!("{} poll failed: {}", failure.scheduler, failure.message);
                }
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}

fn print_statistics(stats: &roster_sync::StatisticsResult) {
    let format = |value: Option<f64>| {
        value
            .map(|v| format!("{v:.2}"))
            .unwrap_or_else(|| "n/a".to_string())
    };
    println!(
        "statistics: mean grade {}, mean age {}, best {}, worst {}, passed {}, failed {}",
        format(stats.mean_grade_overall),
        format(stats.mean_age),
        stats.max_label(),
        stats.min_label(),
        stats.passed.len(),
        stats.failed.len()
    );
}
