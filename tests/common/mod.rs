#![allow(dead_code)]

use chrono::NaiveDate;
use engagement_metrics::{open_warehouse, JobParams, SourceTables};
use rusqlite::{params, Connection};
use tempfile::NamedTempFile;

pub const VALID_DEVICE: i64 = 1;
pub const UNKNOWN_OS_DEVICE: i64 = 2;

pub struct TestWarehouse {
    pub file: NamedTempFile,
    pub conn: Connection,
    pub params: JobParams,
}

impl TestWarehouse {
    pub fn new(params: JobParams) -> Self {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let conn = open_warehouse(file.path()).expect("open warehouse");
        create_source_tables(&conn, &params.source_tables());
        Self { file, conn, params }
    }

    pub fn sources(&self) -> SourceTables {
        self.params.source_tables()
    }

    pub fn insert(&self, event: &Event) {
        insert_event(&self.conn, &self.sources(), event);
    }

    pub fn sink_count(&self) -> i64 {
        self.conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", self.params.sink_table().sql_ident()),
                [],
                |row| row.get(0),
            )
            .expect("sink count")
    }
}

pub fn job_params(interval_max_date: i64, interval_min_date: i64, interval_end_date: i64) -> JobParams {
    JobParams {
        interval_max_date,
        interval_min_date,
        interval_end_date,
        mds_project_id: "mds-test".to_string(),
        mds_dataset: "marketing_ga4".to_string(),
        project_id: "feature-store".to_string(),
        dataset: "feature_store".to_string(),
        insert_table: "user_scoped_metrics".to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub user: &'static str,
    pub date: NaiveDate,
    pub second_of_day: i64,
    pub name: &'static str,
    pub session: Option<i64>,
    pub engagement_msec: Option<i64>,
    pub device: i64,
    pub revenue: Option<f64>,
    pub transaction_id: Option<&'static str>,
}

impl Event {
    pub fn new(user: &'static str, date: NaiveDate, second_of_day: i64, name: &'static str) -> Self {
        Self {
            user,
            date,
            second_of_day,
            name,
            session: None,
            engagement_msec: None,
            device: VALID_DEVICE,
            revenue: None,
            transaction_id: None,
        }
    }

    pub fn session(mut self, session: i64) -> Self {
        self.session = Some(session);
        self
    }

    pub fn engaged(mut self, msec: i64) -> Self {
        self.engagement_msec = Some(msec);
        self
    }

    pub fn device(mut self, device: i64) -> Self {
        self.device = device;
        self
    }

    pub fn purchase(mut self, revenue: f64, transaction_id: Option<&'static str>) -> Self {
        self.revenue = Some(revenue);
        self.transaction_id = transaction_id;
        self
    }
}

pub fn day(n: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, n).expect("valid March day")
}

pub fn create_source_tables(conn: &Connection, sources: &SourceTables) {
    conn.execute_batch(&format!(
        "
        CREATE TABLE {event} (
            user_pseudo_id TEXT NOT NULL,
            event_date TEXT NOT NULL,
            event_timestamp INTEGER NOT NULL,
            event_name TEXT NOT NULL,
            ga_session_id INTEGER,
            engagement_time_msec INTEGER,
            device_type_id INTEGER NOT NULL,
            ecommerce_purchase_revenue_in_usd REAL,
            ecommerce_transaction_id TEXT
        );
        CREATE TABLE {device} (
            device_type_id INTEGER NOT NULL PRIMARY KEY,
            device_os TEXT
        );
        INSERT INTO {device} (device_type_id, device_os) VALUES ({VALID_DEVICE}, 'Android');
        INSERT INTO {device} (device_type_id, device_os) VALUES ({UNKNOWN_OS_DEVICE}, NULL);
        ",
        event = sources.event.sql_ident(),
        device = sources.device.sql_ident(),
    ))
    .expect("create source tables");
}

pub fn insert_event(conn: &Connection, sources: &SourceTables, event: &Event) {
    let timestamp_us = event
        .date
        .and_hms_opt(0, 0, 0)
        .expect("midnight exists")
        .and_utc()
        .timestamp_micros()
        + event.second_of_day * 1_000_000;

    conn.execute(
        &format!(
            "
            INSERT INTO {} (
                user_pseudo_id,
                event_date,
                event_timestamp,
                event_name,
                ga_session_id,
                engagement_time_msec,
                device_type_id,
                ecommerce_purchase_revenue_in_usd,
                ecommerce_transaction_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
            sources.event.sql_ident()
        ),
        params![
            event.user,
            event.date.format("%Y-%m-%d").to_string(),
            timestamp_us,
            event.name,
            event.session,
            event.engagement_msec,
            event.device,
            event.revenue,
            event.transaction_id,
        ],
    )
    .expect("insert event");
}

pub const SCENARIO_USERS: [&str; 5] = ["u1", "u2", "u3", "u4", "u5"];

/// Ten days (March 1-10), five users active every day with one engaged session each.
/// u1 and u2 are new on day 1, u3 buys on day 5 (`T-1`, 42.0) and again on day 9
/// (`T-2`, 10.0). u4 also buys on day 6 from a device without an OS, which must be ignored.
pub fn seed_ten_day_scenario(wh: &TestWarehouse) {
    for d in 1..=10_u32 {
        for (idx, user) in SCENARIO_USERS.into_iter().enumerate() {
            let session = i64::from(d) * 100 + idx as i64;
            let second = 3_600 + idx as i64 * 60;
            if d == 1 && (user == "u1" || user == "u2") {
                wh.insert(&Event::new(user, day(d), second, "first_visit").session(session));
            }
            wh.insert(&Event::new(user, day(d), second, "session_start").session(session));
            wh.insert(
                &Event::new(user, day(d), second + 30, "user_engagement")
                    .session(session)
                    .engaged(1_000),
            );
        }
    }

    wh.insert(
        &Event::new("u3", day(5), 7_200, "purchase")
            .session(502)
            .purchase(42.0, Some("T-1")),
    );
    wh.insert(
        &Event::new("u3", day(9), 7_200, "purchase")
            .session(902)
            .purchase(10.0, Some("T-2")),
    );
    wh.insert(
        &Event::new("u4", day(6), 7_200, "purchase")
            .session(603)
            .device(UNKNOWN_OS_DEVICE)
            .purchase(999.0, Some("T-X")),
    );
}
