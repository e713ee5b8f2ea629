//! Metrics backfill job: stages the date window and aggregates, projects the
//! feature rows and appends them to the sink.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::aggregates::{build_all_stages, StageContext, StageSummary};
use crate::metrics::{project_feature_rows, FeatureRow};
use crate::params::{JobParams, ParamsError};
use crate::sink::{append_feature_rows, ensure_sink_table, SinkError};
use crate::window::{
    log_window_resolved, observed_date_bounds, resolve_date_window, stage_date_intervals,
    DateBounds, DateWindow,
};

#[derive(Debug, Error)]
pub enum MetricsJobError {
    #[error("invalid job parameters: {0}")]
    Params(#[from] ParamsError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("invalid event_date value '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub observed_bounds: Option<DateBounds>,
    pub window: Option<DateWindow>,
    pub feature_dates: Vec<NaiveDate>,
    pub dropped_feature_dates: Vec<NaiveDate>,
    pub stages: Vec<StageSummary>,
    pub rows: Vec<FeatureRow>,
    pub rows_inserted: u64,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MetricsBackfillJob {
    params: JobParams,
}

impl MetricsBackfillJob {
    pub fn new(params: JobParams) -> Result<Self, MetricsJobError> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &JobParams {
        &self.params
    }

    /// Runs the whole pipeline once. Every call appends a fresh set of rows.
    pub fn run(
        &self,
        conn: &mut Connection,
        processed_at: DateTime<Utc>,
    ) -> Result<JobReport, MetricsJobError> {
        let sources = self.params.source_tables();
        let sink = self.params.sink_table();

        info!(
            component = "job",
            event = "metrics.job.start",
            event_table = %sources.event.path(),
            device_table = %sources.device.path(),
            sink_table = %sink.path(),
            interval_max_date = self.params.interval_max_date,
            interval_min_date = self.params.interval_min_date,
            interval_end_date = self.params.interval_end_date
        );

        ensure_sink_table(conn, &sink)?;

        let mut report = JobReport {
            observed_bounds: None,
            window: None,
            feature_dates: Vec::new(),
            dropped_feature_dates: Vec::new(),
            stages: Vec::new(),
            rows: Vec::new(),
            rows_inserted: 0,
            processed_at,
        };

        let Some(bounds) = observed_date_bounds(conn, &sources)? else {
            warn!(
                component = "job",
                event = "metrics.job.empty_input",
                event_table = %sources.event.path()
            );
            return Ok(report);
        };

        let window = resolve_date_window(&bounds, &self.params);
        log_window_resolved(&bounds, &window);

        let intervals = stage_date_intervals(conn, &sources, &window)?;
        let ctx = StageContext {
            sources: &sources,
            window: &window,
        };
        let stages = build_all_stages(conn, &ctx)?;
        let rows = project_feature_rows(conn, processed_at)?;

        let projected: BTreeSet<NaiveDate> = rows.iter().map(|row| row.feature_date).collect();
        let mut feature_dates: Vec<NaiveDate> =
            intervals.iter().map(|interval| interval.input_date).collect();
        feature_dates.sort_unstable();
        let dropped: Vec<NaiveDate> = feature_dates
            .iter()
            .copied()
            .filter(|date| !projected.contains(date))
            .collect();
        if !dropped.is_empty() {
            warn!(
                component = "job",
                event = "metrics.job.feature_dates_dropped",
                dropped = dropped.len(),
                first_dropped = %dropped[0]
            );
        }

        let rows_inserted = append_feature_rows(conn, &sink, &rows)?;

        info!(
            component = "job",
            event = "metrics.job.finish",
            feature_dates = feature_dates.len(),
            dropped_feature_dates = dropped.len(),
            rows_inserted = rows_inserted
        );

        report.observed_bounds = Some(bounds);
        report.window = Some(window);
        report.feature_dates = feature_dates;
        report.dropped_feature_dates = dropped;
        report.stages = stages;
        report.rows = rows;
        report.rows_inserted = rows_inserted;
        Ok(report)
    }
}
