use postcraft_contracts::session::{ErrorKind, Phase};
use thiserror::Error;

pub type StudioResult<T> = std::result::Result<T, StudioError>;

#[derive(Debug, Error)]
pub enum StudioError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("influencer not found: {0}")]
    PersonaNotFound(String),
    #[error("sub-task not found: {0}")]
    SubTaskNotFound(String),
    #[error("no posting stored for session {0}")]
    PostingNotFound(String),
    #[error("session {session_id} is in phase {actual}, expected {expected}")]
    InvalidPhase {
        session_id: String,
        actual: Phase,
        expected: &'static str,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{message}")]
    Failed { kind: ErrorKind, message: String },
    #[error("storage failure: {0}")]
    Storage(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StudioError {
    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            message: message.into(),
        }
    }

    pub fn storage(err: anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SessionNotFound(_)
            | Self::PersonaNotFound(_)
            | Self::SubTaskNotFound(_)
            | Self::PostingNotFound(_) => ErrorKind::NotFound,
            Self::InvalidPhase { .. } => ErrorKind::InvalidPhase,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Failed { kind, .. } => *kind,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Other(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use postcraft_contracts::session::{ErrorKind, Phase};

    use super::StudioError;

    #[test]
    fn kinds_follow_variants() {
        assert_eq!(
            StudioError::SessionNotFound("s".to_string()).kind(),
            ErrorKind::NotFound
        );
        let phase = StudioError::InvalidPhase {
            session_id: "s".to_string(),
            actual: Phase::Research,
            expected: "plan_review",
        };
        assert_eq!(phase.kind(), ErrorKind::InvalidPhase);
        assert_eq!(
            phase.to_string(),
            "session s is in phase research, expected plan_review"
        );
        assert_eq!(
            StudioError::failed(ErrorKind::Generation, "boom").kind(),
            ErrorKind::Generation
        );
        assert_eq!(
            StudioError::from(anyhow::anyhow!("x")).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn storage_errors_keep_context() {
        let err = StudioError::storage(anyhow::anyhow!("disk full").context("write session"));
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert_eq!(err.to_string(), "storage failure: write session: disk full");
    }
}
