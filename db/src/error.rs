use thiserror::Error;

/// Caller-visible error taxonomy. Infrastructure failures stay internal
/// (`anyhow`); everything a client can observe maps onto one of these.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("call already accepted")]
    CallAlreadyAccepted,

    #[error("call not accepted")]
    CallNotAccepted,

    #[error("call forward already acked")]
    CallFwdAlreadyAck,

    #[error("call forward already established")]
    CallFwdAlreadyEstablished,

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("access denied")]
    AccessDenied,
}

pub type ApiResult<T> = Result<T, ApiError>;
