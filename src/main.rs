//! Session Guard for Zentinel
//!
//! Scores recorded sessions and inspects lockout settings.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use zentinel_session_guard::clock::SystemClock;
use zentinel_session_guard::lockout::BlockScheduler;
use zentinel_session_guard::replay::{replay, SessionRecording};
use zentinel_session_guard::report::{Reporter, TracingSink};
use zentinel_session_guard::GuardConfig;

#[derive(Parser, Debug)]
#[command(name = "session-guard")]
#[command(author, version, about = "Session risk scoring for Zentinel")]
struct Args {
    /// Path to configuration file (JSON or YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable JSON logging format
    #[arg(long, global = true)]
    json_logs: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Score a recorded session and print the assessment as JSON
    Score {
        /// Recorded session file (JSON)
        #[arg(short, long)]
        session: PathBuf,

        /// Jitter weights with this seed instead of using them as configured
        #[arg(long)]
        seed: Option<u64>,

        /// Also emit the assessment as a risk event on the log
        #[arg(long)]
        report: bool,
    },
    /// Print the lockout duration for successive blocks
    Lockout {
        /// Number of consecutive blocks to show
        #[arg(short = 'n', long, default_value_t = 8)]
        count: u32,
    },
}

fn init_logging(json: bool, level: &str) {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so stdout stays machine-readable.
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, &args.log_level);

    let config = match &args.config {
        Some(path) => GuardConfig::from_path(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => GuardConfig::default(),
    };

    match args.command {
        Command::Score {
            session,
            seed,
            report: emit_report,
        } => {
            let content = std::fs::read_to_string(&session)
                .with_context(|| format!("reading session {}", session.display()))?;
            let recording: SessionRecording = serde_json::from_str(&content)
                .with_context(|| format!("parsing session {}", session.display()))?;

            let weights = match seed {
                Some(seed) => config.weights.jittered(&mut StdRng::seed_from_u64(seed)),
                None => config.weights.clone(),
            };

            info!(
                session = %session.display(),
                events = recording.events.len(),
                "Scoring recorded session"
            );
            let report = replay(&recording, &config, &weights).await;
            if emit_report {
                Reporter::new(Arc::new(TracingSink)).emit(report.event());
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Lockout { count } => {
            let scheduler = BlockScheduler::new(&config.lockout, Arc::new(SystemClock));
            for block in 1..=count.max(1) {
                let duration_ms = scheduler.lockout_duration(block);
                println!("{block}\t{duration_ms}\t{}", format_duration(duration_ms));
            }
        }
    }

    Ok(())
}

fn format_duration(ms: u64) -> String {
    let secs = ms / 1000;
    match secs {
        s if s >= 86_400 => format!("{}d {}h", s / 86_400, (s % 86_400) / 3600),
        s if s >= 3600 => format!("{}h {}m", s / 3600, (s % 3600) / 60),
        s if s >= 60 => format!("{}m {}s", s / 60, s % 60),
        s => format!("{s}s"),
    }
}
