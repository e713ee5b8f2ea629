//! Insert-only sink for feature rows.
//!
//! Rows are appended; nothing is updated or deduplicated, so running the job
//! twice over the same window stores every feature date twice.

use std::io::Write;

use rusqlite::{params_from_iter, types::Value, Connection};
use thiserror::Error;
use tracing::info;

use crate::metrics::{feature_schema, FeatureRow};
use crate::params::TableRef;
use crate::warehouse::{table_columns, table_exists};
use crate::window::DATE_FORMAT;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink table {table} is missing columns: {missing:?}")]
    SchemaMismatch { table: String, missing: Vec<String> },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Creates the sink table if missing, otherwise checks it carries every feature column.
pub fn ensure_sink_table(conn: &Connection, sink: &TableRef) -> Result<(), SinkError> {
    let schema = feature_schema();

    if !table_exists(conn, sink)? {
        let columns = schema
            .columns
            .iter()
            .map(|column| format!("{} {}", column.name, column.dtype.sqlite_type()))
            .collect::<Vec<_>>()
            .join(",\n    ");
        conn.execute_batch(&format!(
            "CREATE TABLE {} (\n    {columns}\n);",
            sink.sql_ident()
        ))?;
        info!(
            component = "sink",
            event = "metrics.sink.created",
            table = %sink.path(),
            fingerprint = %schema.fingerprint
        );
        return Ok(());
    }

    let existing = table_columns(conn, sink)?;
    let missing: Vec<String> = schema
        .columns
        .iter()
        .filter(|column| !existing.iter().any(|name| name == column.name))
        .map(|column| column.name.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(SinkError::SchemaMismatch {
            table: sink.path(),
            missing,
        });
    }

    Ok(())
}

/// Appends rows in one transaction and returns how many were inserted.
pub fn append_feature_rows(
    conn: &mut Connection,
    sink: &TableRef,
    rows: &[FeatureRow],
) -> Result<u64, SinkError> {
    if rows.is_empty() {
        return Ok(0);
    }

    let schema = feature_schema();
    let column_list = schema
        .columns
        .iter()
        .map(|column| column.name)
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=schema.columns.len())
        .map(|idx| format!("?{idx}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({column_list}) VALUES ({placeholders})",
        sink.sql_ident()
    );

    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(&sql)?;
        for row in rows {
            stmt.execute(params_from_iter(row_values(row)))?;
        }
    }
    tx.commit()?;

    info!(
        component = "sink",
        event = "metrics.sink.appended",
        table = %sink.path(),
        rows = rows.len()
    );

    Ok(rows.len() as u64)
}

pub fn write_feature_rows_csv<W: Write>(writer: W, rows: &[FeatureRow]) -> Result<(), SinkError> {
    let mut out = csv::Writer::from_writer(writer);
    for row in rows {
        out.serialize(row)?;
    }
    out.flush()?;
    Ok(())
}

fn row_values(row: &FeatureRow) -> Vec<Value> {
    vec![
        Value::Text(row.feature_date.format(DATE_FORMAT).to_string()),
        Value::Integer(row.purchasers_users),
        Value::Real(row.average_daily_purchasers),
        Value::Integer(row.active_users),
        Value::Real(row.dau),
        Value::Real(row.wau),
        Value::Real(row.mau),
        Value::Real(row.dau_per_mau),
        Value::Real(row.dau_per_wau),
        Value::Real(row.wau_per_mau),
        Value::Real(row.users_engagement_duration_seconds),
        Value::Real(row.average_engagement_time),
        Value::Real(row.average_engagement_time_per_session),
        Value::Real(row.average_sessions_per_user),
        Value::Real(row.arppu),
        Value::Real(row.arpu),
        Value::Real(row.average_daily_revenue),
        Value::Real(row.max_daily_revenue),
        Value::Real(row.min_daily_revenue),
        Value::Integer(row.new_users),
        Value::Integer(row.returning_users),
        Value::Integer(row.first_time_purchasers),
        Value::Real(row.first_time_purchaser_conversion),
        Value::Real(row.first_time_purchasers_per_new_user),
        Value::Real(row.avg_user_conversion_rate),
        Value::Real(row.avg_session_conversion_rate),
        Value::Text(row.processed_timestamp.to_rfc3339()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::FEATURE_COLUMNS;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn sample_row() -> FeatureRow {
        FeatureRow {
            feature_date: NaiveDate::from_ymd_opt(2024, 3, 8).expect("valid date"),
            purchasers_users: 1,
            average_daily_purchasers: 0.25,
            active_users: 1,
            dau: 0.71,
            wau: 5.0,
            mau: 5.0,
            dau_per_mau: 0.142,
            dau_per_wau: 0.142,
            wau_per_mau: 1.0,
            users_engagement_duration_seconds: 12.5,
            average_engagement_time: 12.5,
            average_engagement_time_per_session: 2.5,
            average_sessions_per_user: 1.0,
            arppu: 42.0,
            arpu: 42.0,
            average_daily_revenue: 42.0,
            max_daily_revenue: 42.0,
            min_daily_revenue: 42.0,
            new_users: 2,
            returning_users: 3,
            first_time_purchasers: 1,
            first_time_purchaser_conversion: 1.0,
            first_time_purchasers_per_new_user: 0.5,
            avg_user_conversion_rate: 1.0,
            avg_session_conversion_rate: 0.2,
            processed_timestamp: Utc
                .with_ymd_and_hms(2024, 3, 11, 6, 0, 0)
                .single()
                .expect("valid timestamp"),
        }
    }

    #[test]
    fn row_values_follow_schema_order() {
        let values = row_values(&sample_row());
        assert_eq!(values.len(), FEATURE_COLUMNS.len());
        assert_eq!(values[0], Value::Text("2024-03-08".to_string()));
        assert_eq!(values[19], Value::Integer(2));
        assert_eq!(
            values[26],
            Value::Text("2024-03-11T06:00:00+00:00".to_string())
        );
    }

    #[test]
    fn csv_export_writes_header_and_rows() {
        let mut buf = Vec::new();
        write_feature_rows_csv(&mut buf, &[sample_row()]).expect("csv export");
        let text = String::from_utf8(buf).expect("utf8 csv");
        let mut lines = text.lines();
        let header = lines.next().expect("header line");
        assert!(header.starts_with("feature_date,purchasers_users,"));
        assert!(header.ends_with(",processed_timestamp"));
        let first = lines.next().expect("data line");
        assert!(first.starts_with("2024-03-08,1,0.25,"));
        assert!(lines.next().is_none());
    }

    #[test]
    fn existing_sink_missing_columns_is_rejected() {
        let conn = Connection::open_in_memory().expect("in-memory sqlite");
        let sink = TableRef::new("fs", "features", "metrics");
        conn.execute_batch(&format!(
            "CREATE TABLE {} (feature_date TEXT, dau REAL)",
            sink.sql_ident()
        ))
        .expect("create partial sink");

        let err = ensure_sink_table(&conn, &sink).expect_err("schema mismatch");
        match err {
            SinkError::SchemaMismatch { table, missing } => {
                assert_eq!(table, "fs.features.metrics");
                assert_eq!(missing.len(), FEATURE_COLUMNS.len() - 2);
                assert!(missing.contains(&"processed_timestamp".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn append_is_insert_only() {
        let mut conn = Connection::open_in_memory().expect("in-memory sqlite");
        let sink = TableRef::new("fs", "features", "metrics");
        ensure_sink_table(&conn, &sink).expect("create sink");
        ensure_sink_table(&conn, &sink).expect("existing sink is compatible");

        let rows = vec![sample_row()];
        assert_eq!(append_feature_rows(&mut conn, &sink, &rows).expect("append"), 1);
        assert_eq!(append_feature_rows(&mut conn, &sink, &rows).expect("append"), 1);
        assert_eq!(append_feature_rows(&mut conn, &sink, &[]).expect("append"), 0);

        let count: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", sink.sql_ident()),
                [],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(count, 2);
    }
}
