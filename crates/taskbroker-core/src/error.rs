use thiserror::Error;

/// Errors surfaced by broker operations. HTTP handlers map these to status
/// codes; the tick loop logs them and moves on.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("task {0} not found")]
    TaskNotFound(uuid::Uuid),

    #[error("backlog item {0} not found")]
    BacklogItemNotFound(uuid::Uuid),

    #[error("gate criterion {0} not found")]
    GateCriterionNotFound(uuid::Uuid),

    #[error("invalid task transition: {0}")]
    InvalidTransition(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("agent {0} is drained")]
    AgentDrained(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BrokerError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::TaskNotFound(_) | Self::BacklogItemNotFound(_) | Self::GateCriterionNotFound(_) => 404,
            Self::Validation(_) => 400,
            Self::InvalidTransition(_) | Self::AgentDrained(_) => 409,
            Self::Unauthorized => 401,
            Self::Internal(_) => 500,
        }
    }
}
