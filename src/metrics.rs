//! Output feature rows: column schema, fingerprint and the final projection.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::job::MetricsJobError;
use crate::window::parse_date;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    Date,
    Int64,
    Float64,
    Timestamp,
}

impl FeatureDType {
    pub fn sqlite_type(self) -> &'static str {
        match self {
            Self::Date | Self::Timestamp => "TEXT",
            Self::Int64 => "INTEGER",
            Self::Float64 => "REAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeatureColumn {
    pub name: &'static str,
    pub dtype: FeatureDType,
}

const fn column(name: &'static str, dtype: FeatureDType) -> FeatureColumn {
    FeatureColumn { name, dtype }
}

pub const FEATURE_COLUMNS: [FeatureColumn; 27] = [
    column("feature_date", FeatureDType::Date),
    column("purchasers_users", FeatureDType::Int64),
    column("average_daily_purchasers", FeatureDType::Float64),
    column("active_users", FeatureDType::Int64),
    column("dau", FeatureDType::Float64),
    column("wau", FeatureDType::Float64),
    column("mau", FeatureDType::Float64),
    column("dau_per_mau", FeatureDType::Float64),
    column("dau_per_wau", FeatureDType::Float64),
    column("wau_per_mau", FeatureDType::Float64),
    column("users_engagement_duration_seconds", FeatureDType::Float64),
    column("average_engagement_time", FeatureDType::Float64),
    column("average_engagement_time_per_session", FeatureDType::Float64),
    column("average_sessions_per_user", FeatureDType::Float64),
    column("arppu", FeatureDType::Float64),
    column("arpu", FeatureDType::Float64),
    column("average_daily_revenue", FeatureDType::Float64),
    column("max_daily_revenue", FeatureDType::Float64),
    column("min_daily_revenue", FeatureDType::Float64),
    column("new_users", FeatureDType::Int64),
    column("returning_users", FeatureDType::Int64),
    column("first_time_purchasers", FeatureDType::Int64),
    column("first_time_purchaser_conversion", FeatureDType::Float64),
    column("first_time_purchasers_per_new_user", FeatureDType::Float64),
    column("avg_user_conversion_rate", FeatureDType::Float64),
    column("avg_session_conversion_rate", FeatureDType::Float64),
    column("processed_timestamp", FeatureDType::Timestamp),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub feature_date: NaiveDate,
    pub purchasers_users: i64,
    pub average_daily_purchasers: f64,
    pub active_users: i64,
    pub dau: f64,
    pub wau: f64,
    pub mau: f64,
    pub dau_per_mau: f64,
    pub dau_per_wau: f64,
    pub wau_per_mau: f64,
    pub users_engagement_duration_seconds: f64,
    pub average_engagement_time: f64,
    pub average_engagement_time_per_session: f64,
    pub average_sessions_per_user: f64,
    pub arppu: f64,
    pub arpu: f64,
    pub average_daily_revenue: f64,
    pub max_daily_revenue: f64,
    pub min_daily_revenue: f64,
    pub new_users: i64,
    pub returning_users: i64,
    pub first_time_purchasers: i64,
    pub first_time_purchaser_conversion: f64,
    pub first_time_purchasers_per_new_user: f64,
    pub avg_user_conversion_rate: f64,
    pub avg_session_conversion_rate: f64,
    pub processed_timestamp: DateTime<Utc>,
}

pub fn feature_schema() -> FeatureSchema {
    let columns = FEATURE_COLUMNS.to_vec();
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{FEATURE_SCHEMA_VERSION};columns:"));
    for column in &columns {
        hasher.update(column.name.as_bytes());
        hasher.update(format!(":{:?};", column.dtype));
    }

    FeatureSchema {
        version: FEATURE_SCHEMA_VERSION,
        fingerprint: hex::encode(hasher.finalize()),
        columns,
    }
}

// `active_count` is the rounded average from the active users stage. It
// feeds every per-user denominator even though it is not a user count.
const PROJECTION_SQL: &str = "
    WITH sessions AS (
        SELECT
            feature_date,
            COUNT(DISTINCT CASE
                WHEN has_invalid_transactions = 0 AND purchase_revenue_in_usd > 0
                THEN user_pseudo_id END) AS purchasers,
            COUNT(*) AS session_count,
            COUNT(DISTINCT user_pseudo_id) AS engaged_users,
            SUM(converted_in_session) AS converted_sessions,
            COALESCE(SUM(engagement_time_msec), 0) / 1000.0 AS engagement_seconds
        FROM temp.engagement
        GROUP BY feature_date
    ),
    joined AS (
        SELECT
            S.*,
            AU.active_users AS active_average,
            CAST(COALESCE(ROUND(AU.active_users), 0) AS INTEGER) AS active_count,
            AU.observed_days AS observed_days,
            AU.weekly_active_users AS weekly_active_users,
            AU.monthly_active_users AS monthly_active_users,
            RV.sum_revenue_per_day AS revenue,
            RV.max_daily_revenue AS max_daily_revenue,
            RV.min_daily_revenue AS min_daily_revenue,
            RV.revenue_days AS revenue_days,
            FP.first_time_purchasers AS first_time_purchasers,
            NU.new_users AS new_users,
            NU.total_users AS total_users
        FROM sessions AS S
        INNER JOIN temp.active_users AS AU ON AU.feature_date = S.feature_date
        INNER JOIN temp.revenue AS RV ON RV.feature_date = S.feature_date
        INNER JOIN temp.first_purchasers AS FP ON FP.feature_date = S.feature_date
        INNER JOIN temp.new_users AS NU ON NU.feature_date = S.feature_date
    )
    SELECT
        feature_date,
        COALESCE(purchasers, 0),
        COALESCE(safe_divide(purchasers, observed_days), 0.0),
        active_count,
        COALESCE(active_average, 0.0),
        COALESCE(weekly_active_users, 0.0),
        COALESCE(monthly_active_users, 0.0),
        COALESCE(safe_divide(active_average, monthly_active_users), 0.0),
        COALESCE(safe_divide(active_average, weekly_active_users), 0.0),
        COALESCE(safe_divide(weekly_active_users, monthly_active_users), 0.0),
        COALESCE(engagement_seconds, 0.0),
        COALESCE(safe_divide(engagement_seconds, active_count), 0.0),
        COALESCE(safe_divide(engagement_seconds, session_count), 0.0),
        COALESCE(safe_divide(session_count, engaged_users), 0.0),
        COALESCE(safe_divide(revenue, purchasers), 0.0),
        COALESCE(safe_divide(revenue, active_count), 0.0),
        COALESCE(safe_divide(revenue, revenue_days), 0.0),
        COALESCE(max_daily_revenue, 0.0),
        COALESCE(min_daily_revenue, 0.0),
        COALESCE(new_users, 0),
        COALESCE(total_users - new_users, 0),
        COALESCE(first_time_purchasers, 0),
        COALESCE(safe_divide(first_time_purchasers, active_count), 0.0),
        COALESCE(safe_divide(first_time_purchasers, new_users), 0.0),
        COALESCE(safe_divide(purchasers, active_count), 0.0),
        COALESCE(safe_divide(converted_sessions, session_count), 0.0)
    FROM joined
    ORDER BY feature_date ASC
";

/// Joins the staged aggregates into one row per feature date.
pub fn project_feature_rows(
    conn: &Connection,
    processed_at: DateTime<Utc>,
) -> Result<Vec<FeatureRow>, MetricsJobError> {
    let mut stmt = conn.prepare(PROJECTION_SQL)?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(feature_row(row, processed_at)?);
    }

    info!(
        component = "metrics",
        event = "metrics.projection.built",
        rows = out.len(),
        processed_at = %processed_at.to_rfc3339()
    );

    Ok(out)
}

fn feature_row(row: &Row<'_>, processed_at: DateTime<Utc>) -> Result<FeatureRow, MetricsJobError> {
    let feature_date: String = row.get(0)?;
    Ok(FeatureRow {
        feature_date: parse_date(&feature_date)?,
        purchasers_users: row.get(1)?,
        average_daily_purchasers: row.get(2)?,
        active_users: row.get(3)?,
        dau: row.get(4)?,
        wau: row.get(5)?,
        mau: row.get(6)?,
        dau_per_mau: row.get(7)?,
        dau_per_wau: row.get(8)?,
        wau_per_mau: row.get(9)?,
        users_engagement_duration_seconds: row.get(10)?,
        average_engagement_time: row.get(11)?,
        average_engagement_time_per_session: row.get(12)?,
        average_sessions_per_user: row.get(13)?,
        arppu: row.get(14)?,
        arpu: row.get(15)?,
        average_daily_revenue: row.get(16)?,
        max_daily_revenue: row.get(17)?,
        min_daily_revenue: row.get(18)?,
        new_users: row.get(19)?,
        returning_users: row.get(20)?,
        first_time_purchasers: row.get(21)?,
        first_time_purchaser_conversion: row.get(22)?,
        first_time_purchasers_per_new_user: row.get(23)?,
        avg_user_conversion_rate: row.get(24)?,
        avg_session_conversion_rate: row.get(25)?,
        processed_timestamp: processed_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_order_and_fingerprint_are_deterministic() {
        let a = feature_schema();
        let b = feature_schema();
        assert_eq!(a, b);
        assert_eq!(a.version, FEATURE_SCHEMA_VERSION);
        assert_eq!(a.columns.len(), 27);
        assert_eq!(a.columns[0].name, "feature_date");
        assert_eq!(a.columns[26].name, "processed_timestamp");
        assert_eq!(a.fingerprint.len(), 64);
    }

    #[test]
    fn column_names_are_unique() {
        let mut names: Vec<&str> = FEATURE_COLUMNS.iter().map(|c| c.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), FEATURE_COLUMNS.len());
    }
}
