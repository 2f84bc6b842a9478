use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` alias using [`OverseerError`].
pub type OverseerResult<T> = Result<T, OverseerError>;

/// Top-level error type for the Overseer engine and its transports.
///
/// The first group of variants are validation errors: they are reported back to
/// the caller that issued the command and never change engine state.
#[derive(Error, Debug)]
pub enum OverseerError {
    /// No agent with this identifier is registered.
    #[error("Agent {0} not found")]
    UnknownAgent(Uuid),

    /// No task with this identifier is registered.
    #[error("Task {0} not found")]
    UnknownTask(Uuid),

    /// No workspace with this number exists in the pool.
    #[error("Workspace {0} not found")]
    UnknownWorkspace(u32),

    /// The named worker configuration is not in the catalog.
    #[error("Worker configuration '{0}' not found")]
    UnknownConfig(String),

    /// The entity is in a state that does not accept the requested action.
    #[error("Cannot {action} {entity} {id} while it is {state}")]
    InvalidState {
        entity: &'static str,
        id: String,
        state: String,
        action: &'static str,
    },

    /// A required command field was absent or empty.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// Any other rejected request.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The worker supervisor or a worker link failed.
    #[error("Worker error: {0}")]
    Worker(String),

    /// Workspace pool bookkeeping or directory I/O failed.
    #[error("Workspace error: {0}")]
    Workspace(String),

    /// Configuration could not be read or parsed.
    #[error("Config error: {0}")]
    Config(String),

    /// HTTP/WebSocket transport failure.
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OverseerError {
    /// Build an [`OverseerError::InvalidState`] from anything printable.
    pub fn invalid_state(
        entity: &'static str,
        id: impl ToString,
        state: impl ToString,
        action: &'static str,
    ) -> Self {
        Self::InvalidState {
            entity,
            id: id.to_string(),
            state: state.to_string(),
            action,
        }
    }

    /// True for errors caused by the request rather than by the engine or a collaborator.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnknownAgent(_)
                | Self::UnknownTask(_)
                | Self::UnknownWorkspace(_)
                | Self::UnknownConfig(_)
                | Self::InvalidState { .. }
                | Self::MissingField(_)
                | Self::Validation(_)
                | Self::Json(_)
        )
    }

    /// True when the error names an identifier that does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::UnknownAgent(_)
                | Self::UnknownTask(_)
                | Self::UnknownWorkspace(_)
                | Self::UnknownConfig(_)
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_message() {
        let id = Uuid::nil();
        let err = OverseerError::invalid_state("agent", id, "busy", "start");
        assert_eq!(
            err.to_string(),
            format!("Cannot start agent {id} while it is busy")
        );
        assert!(err.is_validation());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_classification() {
        assert!(OverseerError::UnknownTask(Uuid::nil()).is_not_found());
        assert!(OverseerError::MissingField("description").is_validation());
        assert!(!OverseerError::Worker("spawn failed".into()).is_validation());
        assert!(!OverseerError::Workspace("disk full".into()).is_validation());
    }

    #[test]
    fn test_json_error_is_validation() {
        let err: OverseerError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(err.is_validation());
        assert!(err.to_string().starts_with("JSON error"));
    }
}
