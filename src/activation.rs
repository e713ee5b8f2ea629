//! Activation metadata consumed by the downstream audience activation process.
//!
//! Each activation type names the measurement event sent for an audience and
//! the query template that selects its source rows. Templates use the same
//! `${name}` placeholders as the rest of the job parameters.

use serde::Serialize;

use crate::params::{render_template, JobParams, ParamsError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActivationMetadata {
    pub activation_type: &'static str,
    pub activation_event_name: &'static str,
    pub source_query_template: &'static str,
}

impl ActivationMetadata {
    pub fn render_source_query(&self, params: &JobParams) -> Result<String, ParamsError> {
        render_template(self.source_query_template, params)
    }
}

static ACTIVATIONS: [ActivationMetadata; 4] = [
    ActivationMetadata {
        activation_type: "user-engagement-daily",
        activation_event_name: "em_user_engagement_daily",
        source_query_template: "SELECT feature_date, active_users, dau, average_engagement_time \
             FROM `${project_id}.${dataset}.${insert_table}` \
             WHERE feature_date = (SELECT MAX(feature_date) FROM `${project_id}.${dataset}.${insert_table}`)",
    },
    ActivationMetadata {
        activation_type: "purchaser-conversion-daily",
        activation_event_name: "em_purchaser_conversion_daily",
        source_query_template: "SELECT feature_date, purchasers_users, avg_user_conversion_rate, avg_session_conversion_rate \
             FROM `${project_id}.${dataset}.${insert_table}` \
             WHERE feature_date = (SELECT MAX(feature_date) FROM `${project_id}.${dataset}.${insert_table}`)",
    },
    ActivationMetadata {
        activation_type: "first-time-purchasers-daily",
        activation_event_name: "em_first_time_purchasers_daily",
        source_query_template: "SELECT feature_date, first_time_purchasers, first_time_purchaser_conversion \
             FROM `${project_id}.${dataset}.${insert_table}` \
             WHERE feature_date = (SELECT MAX(feature_date) FROM `${project_id}.${dataset}.${insert_table}`)",
    },
    ActivationMetadata {
        activation_type: "revenue-trailing-window",
        activation_event_name: "em_revenue_trailing_window",
        source_query_template: "SELECT feature_date, arpu, arppu, average_daily_revenue \
             FROM `${project_id}.${dataset}.${insert_table}` \
             WHERE feature_date >= DATE_SUB(CURRENT_DATE(), INTERVAL ${interval_end_date} DAY)",
    },
];

pub fn activation_types() -> impl Iterator<Item = &'static str> {
    ACTIVATIONS.iter().map(|entry| entry.activation_type)
}

pub fn activation_metadata(activation_type: &str) -> Option<&'static ActivationMetadata> {
    ACTIVATIONS
        .iter()
        .find(|entry| entry.activation_type == activation_type)
}
