//! Engagement metrics core crate.
//!
//! Current implemented scope:
//! - feature-date window resolution over the event warehouse
//! - engagement, revenue, active user, first purchaser and new user aggregates
//! - per-feature-date KPI projection appended to an insert-only sink
//! - activation metadata consumed by downstream audience activation

mod activation;
mod aggregates;
mod job;
mod metrics;
mod observability;
mod params;
mod sink;
mod warehouse;
mod window;

pub use activation::{activation_metadata, activation_types, ActivationMetadata};
pub use aggregates::{
    build_active_users, build_all_stages, build_engagement, build_first_purchasers,
    build_new_users, build_revenue, build_stage, AggregateStage, StageContext, StageSummary,
    FIRST_VISIT_EVENT, IN_APP_PURCHASE_EVENT, PURCHASE_EVENT, UNSET_TRANSACTION_ID,
};
pub use job::{JobReport, MetricsBackfillJob, MetricsJobError};
pub use metrics::{
    feature_schema, project_feature_rows, FeatureColumn, FeatureDType, FeatureRow, FeatureSchema,
    FEATURE_COLUMNS, FEATURE_SCHEMA_VERSION,
};
pub use observability::{
    init_logging, log_app_start, log_warehouse_selected, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use params::{
    render_template, JobParams, ParamsError, SourceTables, TableRef, DEVICE_TABLE, EVENT_TABLE,
    MAX_INTERVAL_DAYS,
};
pub use sink::{append_feature_rows, ensure_sink_table, write_feature_rows_csv, SinkError};
pub use warehouse::{
    count_rows, open_warehouse, register_sql_functions, safe_divide, table_columns, table_exists,
};
pub use window::{
    log_window_resolved, observed_date_bounds, resolve_date_window, stage_date_intervals,
    DateBounds, DateInterval, DateWindow, WindowCorrection, DATES_INTERVAL_TABLE, DATE_FORMAT,
};
