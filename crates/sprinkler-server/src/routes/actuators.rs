use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::Json;
use sprinkler_core::actuator::ActuatorSnapshot;

use super::parse_id;
use crate::error::AppError;
use crate::state::AppState;

/// GET /sprinklers
pub async fn list_actuators(State(app): State<AppState>) -> Json<Vec<ActuatorSnapshot>> {
    Json(app.system.list_actuators().await)
}

/// GET /sprinklers/{id}
pub async fn get_actuator(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ActuatorSnapshot>, AppError> {
    Ok(Json(app.system.get_actuator(parse_id("sprinklers", &id)?).await?))
}

/// POST /sprinklers/{id}: partial update such as `{"isActive": true}`.
///
/// The body is parsed leniently: unknown fields are ignored and an
/// unparseable body counts as carrying no recognised field.
pub async fn update_actuator(
    State(app): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<ActuatorSnapshot>, AppError> {
    let payload = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    Ok(Json(app.system.set_actuator_state(parse_id("sprinklers", &id)?, &payload).await?))
}

/// POST /sprinklers. Actuators come from static configuration only.
pub async fn create_actuator() -> AppError {
    AppError::bad_request("Sprinklers are defined in the configuration file and cannot be created")
}
