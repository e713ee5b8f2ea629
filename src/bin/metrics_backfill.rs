use std::fs::File;
use std::path::PathBuf;

use chrono::Utc;
use engagement_metrics::{
    init_logging, log_app_start, log_warehouse_selected, logging_config_from_env, open_warehouse,
    write_feature_rows_csv, JobParams, MetricsBackfillJob,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(&logging_cfg);

    let warehouse_path = std::env::var("EM_WAREHOUSE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/warehouse.sqlite"));
    let export_csv = std::env::var("EM_EXPORT_CSV").ok().map(PathBuf::from);
    log_warehouse_selected(&warehouse_path, export_csv.as_deref());

    let job = MetricsBackfillJob::new(JobParams::from_env()?)?;
    let mut conn = open_warehouse(&warehouse_path)?;
    let report = job.run(&mut conn, Utc::now())?;

    if let Some(path) = export_csv {
        write_feature_rows_csv(File::create(path)?, &report.rows)?;
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "observed_bounds": report.observed_bounds,
            "window": report.window,
            "feature_dates": report.feature_dates.len(),
            "dropped_feature_dates": report.dropped_feature_dates,
            "stages": report.stages,
            "rows_inserted": report.rows_inserted,
            "processed_at": report.processed_at,
        }))?
    );

    Ok(())
}
