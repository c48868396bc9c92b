use extension_bus::BusError;
use guardian_proto::{ProtoError, RemoteFailure};
use thiserror::Error;
use transport_webrtc::TransportError;

#[derive(Debug, Error)]
pub enum GuardianError {
    #[error("No data channel")]
    TransportUnavailable,
    #[error("request timed out")]
    Timeout,
    #[error("signaling failed: {0}")]
    SignalingFailure(String),
    #[error("untrusted sender {}", .url.as_deref().unwrap_or("<unknown>"))]
    UntrustedSender { url: Option<String> },
    #[error("{message}")]
    RemoteError {
        message: String,
        stack: Option<String>,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("remote answer was rejected")]
    AnswerRejected,
    #[error(transparent)]
    Protocol(#[from] ProtoError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

pub type GuardianResult<T> = Result<T, GuardianError>;

impl GuardianError {
    pub fn signaling(err: impl std::fmt::Display) -> Self {
        GuardianError::SignalingFailure(err.to_string())
    }

    /// Error body handed back across a context boundary.
    pub fn to_failure(&self) -> RemoteFailure {
        match self {
            GuardianError::RemoteError { message, stack } => RemoteFailure {
                message: message.clone(),
                stack: stack.clone(),
            },
            other => RemoteFailure::new(other.to_string()),
        }
    }
}

impl From<RemoteFailure> for GuardianError {
    fn from(failure: RemoteFailure) -> Self {
        GuardianError::RemoteError {
            message: failure.message,
            stack: failure.stack,
        }
    }
}

impl From<TransportError> for GuardianError {
    fn from(err: TransportError) -> Self {
        GuardianError::Transport(err.to_string())
    }
}
