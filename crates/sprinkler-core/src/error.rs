use thiserror::Error;

#[derive(Debug, Error)]
pub enum SprinklerError {
    #[error("actuator not found: {0}")]
    ActuatorNotFound(u64),

    #[error("scenario not found: {0}")]
    ScenarioNotFound(u64),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("hardware write failed on line {line}: {message}")]
    HardwareWrite { line: u32, message: String },

    #[error("hardware read failed on line {line}: {message}")]
    HardwareRead { line: u32, message: String },

    #[error("remote store error: {0}")]
    RemoteStore(String),

    #[error("event log error: {0}")]
    EventLog(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result tag handed to the command surface's callers.
///
/// `Ok`, `NotFound` and `BadRequest` are the tags every command can return.
/// `Conflict` carries `InvalidState` and `Failed` carries hardware or
/// internal failures that the caller must see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandStatus {
    Ok,
    NotFound,
    BadRequest,
    Conflict,
    Failed,
}

impl SprinklerError {
    pub fn status(&self) -> CommandStatus {
        match self {
            Self::ActuatorNotFound(_) | Self::ScenarioNotFound(_) => CommandStatus::NotFound,
            Self::BadRequest(_) | Self::InvalidConfig(_) => CommandStatus::BadRequest,
            Self::InvalidState(_) => CommandStatus::Conflict,
            Self::HardwareWrite { .. }
            | Self::HardwareRead { .. }
            | Self::RemoteStore(_)
            | Self::EventLog(_)
            | Self::Io(_)
            | Self::Yaml(_)
            | Self::Json(_) => CommandStatus::Failed,
        }
    }

    pub(crate) fn remote(err: impl std::fmt::Display) -> Self {
        Self::RemoteStore(err.to_string())
    }

    pub(crate) fn event_log(err: impl std::fmt::Display) -> Self {
        Self::EventLog(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SprinklerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_variants_map_to_not_found() {
        assert_eq!(
            SprinklerError::ActuatorNotFound(3).status(),
            CommandStatus::NotFound
        );
        assert_eq!(
            SprinklerError::ScenarioNotFound(1).status(),
            CommandStatus::NotFound
        );
    }

    #[test]
    fn invalid_state_maps_to_conflict() {
        let err = SprinklerError::InvalidState("scenario 1 is already stopped".into());
        assert_eq!(err.status(), CommandStatus::Conflict);
    }

    #[test]
    fn hardware_failure_is_surfaced_as_failed() {
        let err = SprinklerError::HardwareWrite {
            line: 17,
            message: "permission denied".into(),
        };
        assert_eq!(err.status(), CommandStatus::Failed);
        assert!(err.to_string().contains("line 17"));
    }

    #[test]
    fn bad_request_message_is_passed_through() {
        let err = SprinklerError::BadRequest("No processable payload in request body".into());
        assert_eq!(err.to_string(), "No processable payload in request body");
        assert_eq!(err.status(), CommandStatus::BadRequest);
    }
}
