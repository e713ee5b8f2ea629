//! Feature-date window resolution.
//!
//! The observed `[MIN(event_date), MAX(event_date)]` range is narrowed by the
//! job's day offsets, then corrected back to the full range whenever the
//! offsets produce an empty, inverted or out-of-bounds window. The result is an
//! immutable [`DateWindow`] that every aggregate stage receives explicitly.

use chrono::{Duration, NaiveDate};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::job::MetricsJobError;
use crate::params::{JobParams, SourceTables};

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const DATES_INTERVAL_TABLE: &str = "temp.dates_interval";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateBounds {
    pub min: NaiveDate,
    pub max: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowCorrection {
    /// Offsets produced an empty or inverted window.
    EmptyOrInverted,
    /// Offsets pushed the window past the observed bounds.
    OutOfBounds,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub min_date: NaiveDate,
    pub max_date: NaiveDate,
    pub lookback_days: i64,
    pub corrections: Vec<WindowCorrection>,
}

impl DateWindow {
    pub fn is_full_range(&self, bounds: &DateBounds) -> bool {
        self.min_date == bounds.min && self.max_date == bounds.max
    }

    pub fn min_date_sql(&self) -> String {
        self.min_date.format(DATE_FORMAT).to_string()
    }

    pub fn max_date_sql(&self) -> String {
        self.max_date.format(DATE_FORMAT).to_string()
    }

    /// SQLite `date()` modifier that maps a feature date to its window start.
    pub fn end_date_modifier(&self) -> String {
        format!("-{} days", self.lookback_days)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateInterval {
    pub input_date: NaiveDate,
    pub end_date: NaiveDate,
}

pub fn observed_date_bounds(
    conn: &Connection,
    sources: &SourceTables,
) -> Result<Option<DateBounds>, MetricsJobError> {
    let (min, max): (Option<String>, Option<String>) = conn.query_row(
        &format!(
            "SELECT MIN(event_date), MAX(event_date) FROM {}",
            sources.event.sql_ident()
        ),
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    match (min, max) {
        (Some(min), Some(max)) => Ok(Some(DateBounds {
            min: parse_date(&min)?,
            max: parse_date(&max)?,
        })),
        _ => Ok(None),
    }
}

pub fn resolve_date_window(bounds: &DateBounds, params: &JobParams) -> DateWindow {
    let mut corrections = Vec::new();
    let shifted_max = Duration::try_days(params.interval_max_date)
        .and_then(|offset| bounds.max.checked_sub_signed(offset));
    let shifted_min = Duration::try_days(params.interval_min_date)
        .and_then(|offset| bounds.min.checked_add_signed(offset));

    let (mut min_date, mut max_date) = match (shifted_min, shifted_max) {
        (Some(min_date), Some(max_date)) => (min_date, max_date),
        _ => {
            corrections.push(WindowCorrection::EmptyOrInverted);
            (bounds.min, bounds.max)
        }
    };

    if corrections.is_empty()
        && (min_date >= bounds.max || max_date <= bounds.min || min_date >= max_date)
    {
        corrections.push(WindowCorrection::EmptyOrInverted);
        min_date = bounds.min;
        max_date = bounds.max;
    }

    // Evaluated even after the first correction; it is then a no-op.
    if max_date > bounds.max || min_date < bounds.min {
        corrections.push(WindowCorrection::OutOfBounds);
        min_date = bounds.min;
        max_date = bounds.max;
    }

    DateWindow {
        min_date,
        max_date,
        lookback_days: params.interval_end_date,
        corrections,
    }
}

/// Materializes one `(input_date, end_date)` row per distinct event date in the window.
pub fn stage_date_intervals(
    conn: &Connection,
    sources: &SourceTables,
    window: &DateWindow,
) -> Result<Vec<DateInterval>, MetricsJobError> {
    conn.execute_batch(&format!(
        "
        DROP TABLE IF EXISTS {DATES_INTERVAL_TABLE};
        CREATE TEMP TABLE dates_interval (
            input_date TEXT NOT NULL PRIMARY KEY,
            end_date TEXT NOT NULL
        );
        "
    ))?;

    conn.execute(
        &format!(
            "
            INSERT INTO {DATES_INTERVAL_TABLE} (input_date, end_date)
            SELECT DISTINCT
                event_date,
                date(event_date, ?3)
            FROM {event}
            WHERE event_date BETWEEN ?1 AND ?2
            ",
            event = sources.event.sql_ident()
        ),
        params![
            window.min_date_sql(),
            window.max_date_sql(),
            window.end_date_modifier()
        ],
    )?;

    let mut stmt = conn.prepare(&format!(
        "SELECT input_date, end_date FROM {DATES_INTERVAL_TABLE} ORDER BY input_date DESC"
    ))?;
    let mut rows = stmt.query([])?;
    let mut intervals = Vec::new();
    while let Some(row) = rows.next()? {
        let input_date: String = row.get(0)?;
        let end_date: String = row.get(1)?;
        intervals.push(DateInterval {
            input_date: parse_date(&input_date)?,
            end_date: parse_date(&end_date)?,
        });
    }

    info!(
        component = "window",
        event = "metrics.window.intervals_staged",
        feature_dates = intervals.len(),
        lookback_days = window.lookback_days
    );

    Ok(intervals)
}

pub fn log_window_resolved(bounds: &DateBounds, window: &DateWindow) {
    if window.corrections.is_empty() {
        info!(
            component = "window",
            event = "metrics.window.resolved",
            observed_min = %bounds.min,
            observed_max = %bounds.max,
            min_date = %window.min_date,
            max_date = %window.max_date,
            lookback_days = window.lookback_days
        );
    } else {
        warn!(
            component = "window",
            event = "metrics.window.fallback_full_range",
            observed_min = %bounds.min,
            observed_max = %bounds.max,
            corrections = ?window.corrections,
            lookback_days = window.lookback_days
        );
    }
}

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate, MetricsJobError> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|_| MetricsJobError::InvalidDate(raw.to_string()))
}
