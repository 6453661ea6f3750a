use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sprinkler_core::event_log::CompletedRun;

use crate::error::AppError;
use crate::state::AppState;

/// Query string for GET /events. Times are milliseconds since the epoch.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub sprinkler: Option<u64>,
    pub from: Option<i64>,
    pub to: Option<i64>,
}

fn millis(name: &str, value: Option<i64>) -> Result<Option<DateTime<Utc>>, AppError> {
    value
        .map(|ms| {
            DateTime::from_timestamp_millis(ms)
                .ok_or_else(|| AppError::bad_request(format!("{name} is out of range")))
        })
        .transpose()
}

/// GET /events?sprinkler=<id>&from=<ms>&to=<ms> lists completed runs of one sprinkler.
pub async fn list_events(
    State(app): State<AppState>,
    Query(q): Query<EventsQuery>,
) -> Result<Json<Vec<CompletedRun>>, AppError> {
    let from = millis("from", q.from)?;
    let to = millis("to", q.to)?;
    Ok(Json(app.system.list_events(q.sprinkler, from, to).await?))
}
