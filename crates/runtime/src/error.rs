use crate::model::ModelError;
use storage::SessionId;
use thiserror::Error;

/// Loop-level errors surfaced to the caller of the agent.
///
/// Tool failures never appear here; they become error tool results.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("provider error: {0}")]
    Provider(#[from] ModelError),

    #[error("provider stream failed: {0}")]
    ProviderStream(String),

    #[error("session {0} is busy")]
    SessionBusy(SessionId),

    #[error("query cancelled")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] storage::Error),

    #[error(transparent)]
    Policy(#[from] policy::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
