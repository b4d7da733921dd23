//! Server-side error taxonomy and its mapping onto `error` envelopes.
use thiserror::Error;
use uuid::Uuid;

use crate::auth::AuthFailure;
use crate::db::StoreError;
use crate::models::{ErrorMessage, ServerMessage};
use crate::ws::protocol::ProtocolError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Authentication token expired")]
    AuthExpired,

    #[error("Invalid authentication token: {0}")]
    AuthInvalid(String),

    #[error("Malformed authentication token: {0}")]
    AuthMalformed(String),

    #[error("Access to room '{0}' denied")]
    Forbidden(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(#[from] ProtocolError),

    #[error("Message from unregistered connection {0}")]
    UnregisteredSender(Uuid),

    #[error("Persistence write failed: {0}")]
    PersistenceWriteFailure(#[from] StoreError),

    #[error("Room '{0}' is unavailable")]
    RoomUnavailable(String),
}

impl From<AuthFailure> for SyncError {
    fn from(failure: AuthFailure) -> Self {
        match failure {
            AuthFailure::Expired => SyncError::AuthExpired,
            AuthFailure::Invalid(reason) => SyncError::AuthInvalid(reason),
            AuthFailure::Malformed(reason) => SyncError::AuthMalformed(reason),
        }
    }
}

impl SyncError {
    /// Machine readable code carried in the `error` field of the envelope.
    pub fn error_code(&self) -> &'static str {
        match self {
            SyncError::AuthExpired => "auth_expired",
            SyncError::AuthInvalid(_) => "auth_invalid",
            SyncError::AuthMalformed(_) => "auth_malformed",
            SyncError::Forbidden(_) => "forbidden",
            SyncError::MalformedMessage(_) => "malformed_message",
            SyncError::UnregisteredSender(_) => "unregistered_sender",
            SyncError::PersistenceWriteFailure(_) => "persistence_failure",
            SyncError::RoomUnavailable(_) => "room_unavailable",
        }
    }

    /// Whether the peer should silently fetch a new token and try again.
    pub fn should_retry(&self) -> bool {
        matches!(self, SyncError::AuthExpired | SyncError::RoomUnavailable(_))
    }

    /// Errors after which the server closes the connection.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            SyncError::AuthExpired
                | SyncError::AuthInvalid(_)
                | SyncError::AuthMalformed(_)
                | SyncError::Forbidden(_)
                | SyncError::RoomUnavailable(_)
        )
    }

    pub fn to_envelope(&self) -> ServerMessage {
        // Soft per-message errors leave the retry hint out entirely.
        let should_retry = if self.closes_connection() {
            Some(self.should_retry())
        } else {
            None
        };
        ServerMessage::Error(ErrorMessage {
            message: self.to_string(),
            error: self.error_code().to_string(),
            should_retry,
        })
    }
}
