use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::model::{Participant, Session, SessionStatus};
use crate::reconciliation::ReconciliationReport;
use crate::Amount;

/// Errors that can occur when reading input files or writing tables
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("{path}: cannot open: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: current seats {current} exceed capacity {capacity}")]
    OverCapacity {
        line: usize,
        current: u32,
        capacity: u32,
    },

    #[error("failed to write csv: {0}")]
    Write(#[from] csv::Error),

    #[error("failed to flush output: {0}")]
    Flush(#[from] io::Error),
}

/// A session to seed, keyed by the label booking rows refer to.
#[derive(Debug, Clone)]
pub struct SessionSeed {
    pub label: String,
    pub session: Session,
}

/// Whether the simulated card confirms or declines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Card {
    #[default]
    Ok,
    Decline,
}

/// One booking to place, optionally followed by a refund.
#[derive(Debug, Clone)]
pub struct BookingOrder {
    pub line: usize,
    pub session: String,
    pub email: String,
    pub participants: Vec<Participant>,
    pub total: Amount,
    pub card: Card,
    pub refund: Option<Amount>,
}

#[derive(Debug, Deserialize)]
struct SessionRow {
    label: String,
    course: String,
    price: Amount,
    capacity: u32,
    #[serde(default)]
    current: Option<u32>,
    #[serde(default)]
    status: Option<SessionStatus>,
    starts_in_days: i64,
}

#[derive(Debug, Deserialize)]
struct BookingRow {
    session: String,
    email: String,
    participants: String,
    total: Amount,
    #[serde(default)]
    card: Option<Card>,
    #[serde(default)]
    refund: Option<Amount>,
}

#[derive(Debug, Serialize)]
struct SessionOutputRow<'a> {
    session: &'a str,
    course: &'a str,
    capacity: u32,
    booked: u32,
    available: u32,
    status: SessionStatus,
}

#[derive(Debug, Serialize)]
struct ReportRow {
    payments: usize,
    payments_amount: Amount,
    refunds: usize,
    refunds_amount: Amount,
    net_amount: Amount,
}

fn open(path: &Path) -> Result<csv::Reader<std::fs::File>, CsvError> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })
}

/// Read sessions, scheduling each `starts_in_days` after `now`
pub fn read_sessions(
    path: impl AsRef<Path>,
    now: DateTime<Utc>,
) -> Result<impl Iterator<Item = Result<SessionSeed, CsvError>>, CsvError> {
    let reader = open(path.as_ref())?;

    Ok(reader
        .into_deserialize::<SessionRow>()
        .enumerate()
        .map(move |(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            let current = row.current.unwrap_or(0);
            if current > row.capacity {
                return Err(CsvError::OverCapacity {
                    line,
                    current,
                    capacity: row.capacity,
                });
            }

            let mut session = Session::published(
                row.course,
                row.price,
                row.capacity,
                now + Duration::days(row.starts_in_days),
            );
            session.current_capacity = current;
            if let Some(status) = row.status {
                session.status = status;
            }
            session.recompute_status();
            Ok(SessionSeed {
                label: row.label,
                session,
            })
        }))
}

/// Read booking orders. Participants are `;`-separated names
pub fn read_bookings(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<BookingOrder, CsvError>>, CsvError> {
    let reader = open(path.as_ref())?;

    Ok(reader
        .into_deserialize::<BookingRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2;
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            let participants = row
                .participants
                .split(';')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(|name| Participant {
                    name: name.to_string(),
                    email: None,
                })
                .collect();
            Ok(BookingOrder {
                line,
                session: row.session,
                email: row.email,
                participants,
                total: row.total,
                card: row.card.unwrap_or_default(),
                refund: row.refund,
            })
        }))
}

/// Write the per-session capacity table
pub fn write_sessions<'a, W: io::Write>(
    out: W,
    sessions: impl IntoIterator<Item = (&'a str, &'a Session)>,
) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(out);

    for (label, session) in sessions {
        writer.serialize(SessionOutputRow {
            session: label,
            course: &session.course_name,
            capacity: session.max_capacity,
            booked: session.current_capacity,
            available: session.available_spots(),
            status: session.status,
        })?;
    }

    writer.flush()?;
    Ok(())
}

/// Write the reconciliation totals as a single-row table
pub fn write_report<W: io::Write>(out: W, report: &ReconciliationReport) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(out);
    writer.serialize(ReportRow {
        payments: report.payments_count,
        payments_amount: report.payments_amount,
        refunds: report.refunds_count,
        refunds_amount: report.refunds_amount,
        net_amount: report.net_amount,
    })?;
    writer.flush()?;
    Ok(())
}
