use axum::Json;

/// GET /: service name, version and the collection routes.
pub async fn get_index() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "sprinkler",
        "version": env!("CARGO_PKG_VERSION"),
        "links": {
            "sprinklers": "/sprinklers",
            "scenarios": "/scenarios",
            "events": "/events",
        },
    }))
}
