use std::env;
use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use coursebook::app::Platform;
use coursebook::config::Config;
use coursebook::csv::{read_bookings, read_sessions, write_report, write_sessions};
use coursebook::gateway::simulated::SimulatedProvider;
use coursebook::Error;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_env("COURSEBOOK_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let [sessions, bookings] = args.as_slice() else {
        eprintln!("usage: coursebook <sessions.csv> <bookings.csv>");
        return ExitCode::from(2);
    };

    match run(sessions, bookings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(code = %e.code(), "{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(sessions_path: &str, bookings_path: &str) -> Result<(), Error> {
    let config = Config::from_env()?;
    config.validate()?;

    for path in [sessions_path, bookings_path] {
        if !path.ends_with(".csv") {
            warn!(path, "input file seems to not be a csv file");
        }
    }

    let mut sessions = Vec::new();
    for result in read_sessions(sessions_path, Utc::now())? {
        match result {
            Ok(seed) => sessions.push(seed),
            Err(e) => warn!("{e}"),
        }
    }
    let mut orders = Vec::new();
    for result in read_bookings(bookings_path)? {
        match result {
            Ok(order) => orders.push(order),
            Err(e) => warn!("{e}"),
        }
    }

    let platform = Arc::new(Platform::new(config, Arc::new(SimulatedProvider::new())));
    let summary = platform.run_batch(sessions, orders).await?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    write_sessions(
        &mut out,
        summary
            .sessions
            .iter()
            .map(|(label, session)| (label.as_str(), session)),
    )?;
    writeln!(out).map_err(coursebook::csv::CsvError::from)?;
    write_report(&mut out, &summary.report)?;
    Ok(())
}
