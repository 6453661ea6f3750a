pub mod actuators;
pub mod events;
pub mod index;
pub mod scenarios;

use crate::error::AppError;

/// Numeric id from a path segment. Anything else names no resource.
pub(crate) fn parse_id(collection: &str, raw: &str) -> Result<u64, AppError> {
    raw.parse()
        .map_err(|_| AppError::unknown_path(format!("/{collection}/{raw}")))
}
