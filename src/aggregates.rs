//! Intermediate aggregate stages.
//!
//! Each stage materializes one connection-private `TEMP` table keyed by
//! `feature_date` (engagement additionally by `user_pseudo_id` and
//! `session_id`). Stages read the source relations joined against
//! `temp.dates_interval`, so [`crate::window::stage_date_intervals`] must run
//! first. The [`DateWindow`] is bound into every stage's filter.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::job::MetricsJobError;
use crate::params::SourceTables;
use crate::warehouse::count_rows;
use crate::window::{DateWindow, DATES_INTERVAL_TABLE};

pub const PURCHASE_EVENT: &str = "purchase";
pub const IN_APP_PURCHASE_EVENT: &str = "in_app_purchase";
pub const FIRST_VISIT_EVENT: &str = "first_visit";
pub const UNSET_TRANSACTION_ID: &str = "(not set)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateStage {
    Engagement,
    Revenue,
    ActiveUsers,
    FirstPurchasers,
    NewUsers,
}

impl AggregateStage {
    pub const ALL: [AggregateStage; 5] = [
        Self::Engagement,
        Self::Revenue,
        Self::ActiveUsers,
        Self::FirstPurchasers,
        Self::NewUsers,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Engagement => "engagement",
            Self::Revenue => "revenue",
            Self::ActiveUsers => "active_users",
            Self::FirstPurchasers => "first_purchasers",
            Self::NewUsers => "new_users",
        }
    }

    pub fn table(self) -> String {
        format!("temp.{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: AggregateStage,
    pub rows: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub sources: &'a SourceTables,
    pub window: &'a DateWindow,
}

impl StageContext<'_> {
    /// Valid-device events joined to every feature date whose trailing window contains them.
    fn windowed_events(&self) -> String {
        format!(
            "
            {event} AS E
            INNER JOIN {device} AS D ON E.device_type_id = D.device_type_id
            INNER JOIN {DATES_INTERVAL_TABLE} AS DI
                ON E.event_date BETWEEN DI.end_date AND DI.input_date
            ",
            event = self.sources.event.sql_ident(),
            device = self.sources.device.sql_ident(),
        )
    }
}

pub fn build_all_stages(
    conn: &Connection,
    ctx: &StageContext<'_>,
) -> Result<Vec<StageSummary>, MetricsJobError> {
    AggregateStage::ALL
        .iter()
        .map(|stage| build_stage(conn, ctx, *stage))
        .collect()
}

pub fn build_stage(
    conn: &Connection,
    ctx: &StageContext<'_>,
    stage: AggregateStage,
) -> Result<StageSummary, MetricsJobError> {
    match stage {
        AggregateStage::Engagement => build_engagement(conn, ctx),
        AggregateStage::Revenue => build_revenue(conn, ctx),
        AggregateStage::ActiveUsers => build_active_users(conn, ctx),
        AggregateStage::FirstPurchasers => build_first_purchasers(conn, ctx),
        AggregateStage::NewUsers => build_new_users(conn, ctx),
    }
}

/// Per-session engagement, revenue and conversion flags.
pub fn build_engagement(
    conn: &Connection,
    ctx: &StageContext<'_>,
) -> Result<StageSummary, MetricsJobError> {
    let insert = format!(
        "
        INSERT INTO temp.engagement
        SELECT
            E.user_pseudo_id,
            DI.input_date,
            E.ga_session_id,
            MAX(E.engagement_time_msec),
            COALESCE(SUM(E.ecommerce_purchase_revenue_in_usd), 0.0),
            MAX(CASE
                WHEN E.event_name = '{PURCHASE_EVENT}'
                 AND E.ecommerce_transaction_id IS NULL
                THEN 1 ELSE 0 END),
            MAX(CASE
                WHEN E.event_name = '{PURCHASE_EVENT}'
                 AND E.ga_session_id IS NOT NULL
                 AND E.ecommerce_transaction_id IS NOT NULL
                 AND E.ecommerce_transaction_id <> '{UNSET_TRANSACTION_ID}'
                THEN 1 ELSE 0 END)
        FROM {events}
        WHERE E.ga_session_id IS NOT NULL
          AND D.device_os IS NOT NULL
          AND DI.input_date BETWEEN ?1 AND ?2
        GROUP BY E.user_pseudo_id, DI.input_date, E.ga_session_id
        ",
        events = ctx.windowed_events()
    );

    materialize(
        conn,
        ctx.window,
        AggregateStage::Engagement,
        "
        user_pseudo_id TEXT NOT NULL,
        feature_date TEXT NOT NULL,
        session_id INTEGER NOT NULL,
        engagement_time_msec INTEGER,
        purchase_revenue_in_usd REAL NOT NULL,
        has_invalid_transactions INTEGER NOT NULL,
        converted_in_session INTEGER NOT NULL,
        PRIMARY KEY (user_pseudo_id, feature_date, session_id)
        ",
        &insert,
    )
}

/// Per-date revenue over valid transactions: daily sums, then total/max/min per feature date.
pub fn build_revenue(
    conn: &Connection,
    ctx: &StageContext<'_>,
) -> Result<StageSummary, MetricsJobError> {
    let insert = format!(
        "
        INSERT INTO temp.revenue
        SELECT
            feature_date,
            SUM(revenue_per_day),
            MAX(revenue_per_day),
            MIN(revenue_per_day),
            COUNT(*)
        FROM (
            SELECT
                DI.input_date AS feature_date,
                E.event_date AS event_date,
                COALESCE(SUM(E.ecommerce_purchase_revenue_in_usd), 0.0) AS revenue_per_day
            FROM {events}
            WHERE E.ga_session_id IS NOT NULL
              AND D.device_os IS NOT NULL
              AND E.event_name = '{PURCHASE_EVENT}'
              AND E.ecommerce_transaction_id IS NOT NULL
              AND E.ecommerce_transaction_id <> '{UNSET_TRANSACTION_ID}'
              AND DI.input_date BETWEEN ?1 AND ?2
            GROUP BY DI.input_date, E.event_date
        )
        GROUP BY feature_date
        ",
        events = ctx.windowed_events()
    );

    materialize(
        conn,
        ctx.window,
        AggregateStage::Revenue,
        "
        feature_date TEXT NOT NULL PRIMARY KEY,
        sum_revenue_per_day REAL NOT NULL,
        max_daily_revenue REAL NOT NULL,
        min_daily_revenue REAL NOT NULL,
        revenue_days INTEGER NOT NULL
        ",
        &insert,
    )
}

/// Average daily active users per feature date.
///
/// Distinct engaged users are divided by the day span between the first and
/// last observed event dates of the window. The projection later rounds this
/// average and uses it as if it were a user count; that conflation is kept
/// as-is so the published KPIs stay comparable with historical runs.
pub fn build_active_users(
    conn: &Connection,
    ctx: &StageContext<'_>,
) -> Result<StageSummary, MetricsJobError> {
    let insert = format!(
        "
        INSERT INTO temp.active_users
        SELECT
            DI.input_date,
            safe_divide(
                COUNT(DISTINCT CASE WHEN E.engagement_time_msec > 0 THEN E.user_pseudo_id END),
                CAST(julianday(MAX(E.event_date)) - julianday(MIN(E.event_date)) AS INTEGER)
            ),
            CAST(julianday(MAX(E.event_date)) - julianday(MIN(E.event_date)) AS INTEGER),
            COUNT(DISTINCT CASE
                WHEN E.engagement_time_msec > 0
                 AND E.event_date > date(DI.input_date, '-7 days')
                THEN E.user_pseudo_id END),
            COUNT(DISTINCT CASE
                WHEN E.engagement_time_msec > 0
                 AND E.event_date > date(DI.input_date, '-30 days')
                THEN E.user_pseudo_id END)
        FROM {events}
        WHERE D.device_os IS NOT NULL
          AND DI.input_date BETWEEN ?1 AND ?2
        GROUP BY DI.input_date
        ",
        events = ctx.windowed_events()
    );

    materialize(
        conn,
        ctx.window,
        AggregateStage::ActiveUsers,
        "
        feature_date TEXT NOT NULL PRIMARY KEY,
        active_users REAL,
        observed_days INTEGER NOT NULL,
        weekly_active_users INTEGER NOT NULL,
        monthly_active_users INTEGER NOT NULL
        ",
        &insert,
    )
}

/// Users whose first-ever purchase falls inside a feature date's window.
///
/// Ranking runs over the whole event relation; the window only filters the
/// rank-1 events afterwards.
pub fn build_first_purchasers(
    conn: &Connection,
    ctx: &StageContext<'_>,
) -> Result<StageSummary, MetricsJobError> {
    let insert = format!(
        "
        INSERT INTO temp.first_purchasers
        SELECT
            DI.input_date,
            COUNT(DISTINCT R.user_pseudo_id)
        FROM (
            SELECT
                E.user_pseudo_id AS user_pseudo_id,
                E.event_date AS event_date,
                RANK() OVER (
                    PARTITION BY E.user_pseudo_id
                    ORDER BY E.event_timestamp ASC
                ) AS purchase_rank
            FROM {event} AS E
            INNER JOIN {device} AS D ON E.device_type_id = D.device_type_id
            WHERE E.event_name IN ('{PURCHASE_EVENT}', '{IN_APP_PURCHASE_EVENT}')
              AND E.ga_session_id IS NOT NULL
              AND D.device_os IS NOT NULL
        ) AS R
        INNER JOIN {DATES_INTERVAL_TABLE} AS DI
            ON R.event_date BETWEEN DI.end_date AND DI.input_date
        WHERE R.purchase_rank = 1
          AND DI.input_date BETWEEN ?1 AND ?2
        GROUP BY DI.input_date
        ",
        event = ctx.sources.event.sql_ident(),
        device = ctx.sources.device.sql_ident(),
    );

    materialize(
        conn,
        ctx.window,
        AggregateStage::FirstPurchasers,
        "
        feature_date TEXT NOT NULL PRIMARY KEY,
        first_time_purchasers INTEGER NOT NULL
        ",
        &insert,
    )
}

/// Users whose earliest in-window event is `first_visit`, plus all distinct users seen.
pub fn build_new_users(
    conn: &Connection,
    ctx: &StageContext<'_>,
) -> Result<StageSummary, MetricsJobError> {
    // `first_visit` wins timestamp ties with the session events logged alongside it.
    let insert = format!(
        "
        INSERT INTO temp.new_users
        SELECT
            feature_date,
            COUNT(DISTINCT CASE
                WHEN first_seen = 1 AND event_name = '{FIRST_VISIT_EVENT}'
                THEN user_pseudo_id END),
            COUNT(DISTINCT user_pseudo_id)
        FROM (
            SELECT
                E.user_pseudo_id AS user_pseudo_id,
                DI.input_date AS feature_date,
                E.event_name AS event_name,
                ROW_NUMBER() OVER (
                    PARTITION BY E.user_pseudo_id, DI.input_date
                    ORDER BY
                        E.event_timestamp ASC,
                        CASE WHEN E.event_name = '{FIRST_VISIT_EVENT}' THEN 0 ELSE 1 END ASC
                ) AS first_seen
            FROM {events}
            WHERE D.device_os IS NOT NULL
              AND DI.input_date BETWEEN ?1 AND ?2
        )
        GROUP BY feature_date
        ",
        events = ctx.windowed_events()
    );

    materialize(
        conn,
        ctx.window,
        AggregateStage::NewUsers,
        "
        feature_date TEXT NOT NULL PRIMARY KEY,
        new_users INTEGER NOT NULL,
        total_users INTEGER NOT NULL
        ",
        &insert,
    )
}

fn materialize(
    conn: &Connection,
    window: &DateWindow,
    stage: AggregateStage,
    columns: &str,
    insert: &str,
) -> Result<StageSummary, MetricsJobError> {
    let table = stage.table();
    conn.execute_batch(&format!(
        "
        DROP TABLE IF EXISTS {table};
        CREATE TEMP TABLE {name} ({columns});
        ",
        name = stage.as_str()
    ))?;
    conn.execute(insert, params![window.min_date_sql(), window.max_date_sql()])?;

    let rows = count_rows(conn, &table)?;
    info!(
        component = "aggregates",
        event = "metrics.stage.built",
        stage = stage.as_str(),
        rows = rows
    );

    Ok(StageSummary { stage, rows })
}
