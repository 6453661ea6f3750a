use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::Json;
use sprinkler_core::scenario::ScenarioSnapshot;

use super::parse_id;
use crate::error::AppError;
use crate::state::AppState;

/// GET /scenarios
pub async fn list_scenarios(State(app): State<AppState>) -> Json<Vec<ScenarioSnapshot>> {
    Json(app.system.list_scenarios().await)
}

/// GET /scenarios/{id}
pub async fn get_scenario(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ScenarioSnapshot>, AppError> {
    Ok(Json(app.system.get_scenario(parse_id("scenarios", &id)?).await?))
}

/// POST /scenarios/{id} with `{"state": "start" | "stop"}`.
///
/// Start returns as soon as the run is scheduled; stop returns once the
/// current step's sprinkler is off.
pub async fn update_scenario(
    State(app): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<ScenarioSnapshot>, AppError> {
    let payload = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    Ok(Json(app.system.set_scenario_state(parse_id("scenarios", &id)?, &payload).await?))
}
