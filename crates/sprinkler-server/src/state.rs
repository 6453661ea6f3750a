use std::sync::Arc;

use sprinkler_core::SprinklerSystem;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub system: Arc<SprinklerSystem>,
}

impl AppState {
    pub fn new(system: Arc<SprinklerSystem>) -> Self {
        Self { system }
    }
}
