//! SQLite warehouse connection setup and catalog helpers.

use std::path::Path;

use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::params::TableRef;

/// Opens the warehouse file and registers the SQL helpers the pipeline relies on.
pub fn open_warehouse(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA temp_store=MEMORY;
        ",
    )?;
    register_sql_functions(&conn)?;
    debug!(
        component = "warehouse",
        event = "warehouse.open",
        path = %path.display()
    );
    Ok(conn)
}

/// Registers `safe_divide(numerator, denominator)` on the connection.
pub fn register_sql_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "safe_divide",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let numerator: Option<f64> = ctx.get(0)?;
            let denominator: Option<f64> = ctx.get(1)?;
            Ok(safe_divide(numerator, denominator))
        },
    )
}

/// Division yielding `None` when either side is null or the denominator is zero.
pub fn safe_divide(numerator: Option<f64>, denominator: Option<f64>) -> Option<f64> {
    match (numerator, denominator) {
        (Some(n), Some(d)) if d != 0.0 => Some(n / d),
        _ => None,
    }
}

pub fn table_exists(conn: &Connection, table: &TableRef) -> rusqlite::Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1 LIMIT 1",
            params![table.path()],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    Ok(exists)
}

pub fn table_columns(conn: &Connection, table: &TableRef) -> rusqlite::Result<Vec<String>> {
    let pragma = format!("PRAGMA table_info({})", table.sql_ident());
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get(1)?);
    }
    Ok(columns)
}

pub fn count_rows(conn: &Connection, table: &str) -> rusqlite::Result<u64> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })?;
    Ok(count as u64)
}
