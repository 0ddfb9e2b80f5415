use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::{self, error::RecvError};

use speedwatch::config::{LogFormat, LoggingConfig, SpeedwatchConfig};
use speedwatch::measure::MeasurementOutcome;
use speedwatch::report;
use speedwatch::scheduler::interval_from_secs;
use speedwatch::session::{Session, SessionError, SessionEvent};

#[derive(Parser)]
#[command(
    name = "speedwatch",
    about = "Internet speed test with history, CSV export and recurring measurement",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single speed test (Ctrl-C stops at the next phase)
    Run {
        /// Write the result to a CSV file
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Re-run the speed test on a fixed interval until Ctrl-C
    Watch {
        /// Seconds between runs
        #[arg(long)]
        interval: Option<f64>,

        /// Export the collected history to a CSV file on exit
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Start the HTTP API (optionally with the recurring schedule)
    Serve {
        /// Bind address
        #[arg(long)]
        bind: Option<String>,

        /// Seconds between scheduled runs
        #[arg(long)]
        interval: Option<f64>,

        /// Start the schedule immediately
        #[arg(long)]
        schedule: bool,
    },
}

fn init_tracing(logging: &LoggingConfig, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json || logging.format == LogFormat::Json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Print session events to stdout until the channel closes.
async fn print_events(mut rx: broadcast::Receiver<SessionEvent>) {
    loop {
        match rx.recv().await {
            Ok(SessionEvent::Status { phase, .. }) => println!("{}", phase.status_label()),
            Ok(SessionEvent::Completed { result, .. }) => {
                println!("Completed: {}", result.timestamp());
                println!("  {}", report::format_result(&result));
            }
            Ok(SessionEvent::Cancelled { .. }) => println!("Stopped"),
            Ok(SessionEvent::Failed { phase, message, .. }) => {
                println!("Error during {}: {}", phase, message)
            }
            Ok(SessionEvent::ScheduleError { message }) => println!("Scheduled run failed: {}", message),
            Ok(SessionEvent::Started { .. }) => println!("Starting test..."),
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }
}

fn export(session: &Session, path: &Path) -> Result<()> {
    let rows = session
        .export_csv(path)
        .with_context(|| format!("Failed to export history to {}", path.display()))?;
    println!("Saved {} result(s) to {}", rows, path.display());
    Ok(())
}

async fn run_once(session: Session, csv: Option<PathBuf>) -> Result<()> {
    let mut events = session.subscribe();
    let mut handle = session.start_measurement()?;
    println!("Starting test...");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stopping = false;

    let joined = loop {
        tokio::select! {
            biased;
            ev = events.recv() => {
                if let Ok(SessionEvent::Status { phase, .. }) = ev {
                    println!("{}", phase.status_label());
                }
            }
            res = &mut handle => break res,
            _ = &mut ctrl_c, if !stopping => {
                stopping = true;
                println!("Stopping...");
                session.cancel();
            }
        }
    };
    while let Ok(ev) = events.try_recv() {
        if let SessionEvent::Status { phase, .. } = ev {
            println!("{}", phase.status_label());
        }
    }

    match joined.context("Measurement task failed")? {
        Ok(MeasurementOutcome::Completed(result)) => {
            println!("Completed: {}", result.timestamp());
            println!("  {}", report::format_result(&result));
            if let Some(path) = csv {
                export(&session, &path)?;
            }
            Ok(())
        }
        Ok(MeasurementOutcome::Cancelled) => {
            println!("Stopped");
            Ok(())
        }
        Err(e @ SessionError::Probe(_)) => Err(e.into()),
        Err(e) => Err(e).context("Speed test could not start"),
    }
}

async fn watch(session: Session, interval: Duration, csv: Option<PathBuf>) -> Result<()> {
    let printer = tokio::spawn(print_events(session.subscribe()));
    session.start_schedule(interval)?;
    println!(
        "Measuring every {}s. Press Ctrl-C to stop.",
        interval.as_secs_f64()
    );

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    session.stop_schedule();
    session.cancel();
    printer.abort();

    let history = session.history();
    println!("\nHistory ({} result(s)):", history.len());
    for entry in &history {
        println!("  {}", report::format_history_line(entry));
    }
    if let Some(path) = csv {
        export(&session, &path)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SpeedwatchConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging, cli.json_logs);

    let session = speedwatch::build_session(&config)?;

    match cli.command {
        Commands::Run { csv } => {
            tracing::info!("Running speed test");
            run_once(session, csv).await?;
        }
        Commands::Watch { interval, csv } => {
            let secs = interval.unwrap_or(config.schedule.interval_secs);
            let interval = interval_from_secs(secs)?;
            tracing::info!(interval_secs = secs, "Starting recurring speed test");
            watch(session, interval, csv).await?;
        }
        Commands::Serve {
            bind,
            interval,
            schedule,
        } => {
            let bind = bind.unwrap_or_else(|| config.api.bind.clone());
            let secs = interval.unwrap_or(config.schedule.interval_secs);
            let interval = interval_from_secs(secs)?;
            if schedule || config.schedule.autostart {
                session.start_schedule(interval)?;
            }
            tracing::info!(%bind, "Starting speedwatch API");
            speedwatch::serve(&bind, session, interval).await?;
        }
    }

    Ok(())
}
