use crate::id_types::{ParticipantId, RoomId, TrackId, UserId};
use thiserror::Error;

/// Coarse classification of a [`CoreError`], mirroring how the signaling
/// layer groups failures when deciding what to report and whether a retry
/// makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Auth,
    NotFound,
    Conflict,
    Capacity,
    State,
    Network,
    Validation,
}

/// Every failure the core can report to a caller.
///
/// Errors describe failed operations; facts about committed state changes
/// travel as room events instead and never carry errors.
#[derive(Debug, Error)]
pub enum CoreError {
    // Auth
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token expired")]
    TokenExpired,
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    // Not found
    #[error("room not found: {0}")]
    RoomNotFound(RoomId),
    #[error("participant not found: {0}")]
    ParticipantNotFound(ParticipantId),
    #[error("track not found: {0}")]
    TrackNotFound(TrackId),
    #[error("session not found for user: {0}")]
    SessionNotFound(UserId),
    #[error("no subscription for participant {0} on track {1}")]
    SubscriptionNotFound(ParticipantId, TrackId),

    // Conflict
    #[error("room already exists: {0}")]
    RoomExists(String),
    #[error("participant already in room: {0}")]
    ParticipantExists(ParticipantId),
    #[error("track already published: {0}")]
    TrackExists(TrackId),
    #[error("room is closed: {0}")]
    RoomClosed(RoomId),

    // Capacity
    #[error("room {0} is full ({1} participants)")]
    RoomFull(RoomId, usize),
    #[error("user {0} reached the room limit ({1})")]
    RoomLimitExceeded(UserId, usize),
    #[error("user {0} reached the track limit ({1})")]
    TrackLimitExceeded(UserId, usize),

    // State
    #[error("invalid state: {0}")]
    InvalidState(String),

    // Network
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("reconnection timed out")]
    ReconnectionTimeout,
    #[error("reconnection gave up after the maximum number of attempts")]
    MaxAttemptsExceeded,

    // Validation
    #[error("invalid message: {0}")]
    Validation(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        use CoreError::*;
        match self {
            InvalidToken(_) | TokenExpired | Unauthorized(_) => ErrorKind::Auth,
            RoomNotFound(_)
            | ParticipantNotFound(_)
            | TrackNotFound(_)
            | SessionNotFound(_)
            | SubscriptionNotFound(_, _) => ErrorKind::NotFound,
            RoomExists(_) | ParticipantExists(_) | TrackExists(_) | RoomClosed(_) => {
                ErrorKind::Conflict
            }
            RoomFull(_, _) | RoomLimitExceeded(_, _) | TrackLimitExceeded(_, _) => {
                ErrorKind::Capacity
            }
            InvalidState(_) => ErrorKind::State,
            ConnectionFailed(_) | ReconnectionTimeout | MaxAttemptsExceeded => ErrorKind::Network,
            Validation(_) => ErrorKind::Validation,
        }
    }

    /// Whether the client may usefully retry the same request later.
    /// Capacity failures clear up as others leave; auth and validation
    /// failures never do.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Capacity | ErrorKind::Network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(CoreError::TokenExpired.kind(), ErrorKind::Auth);
        assert_eq!(
            CoreError::RoomNotFound(RoomId::from("r")).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            CoreError::ParticipantExists(ParticipantId::from("p")).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            CoreError::RoomFull(RoomId::from("r"), 4).kind(),
            ErrorKind::Capacity
        );
        assert_eq!(
            CoreError::InvalidState("reconnect on joined participant".into()).kind(),
            ErrorKind::State
        );
        assert_eq!(CoreError::MaxAttemptsExceeded.kind(), ErrorKind::Network);
        assert_eq!(
            CoreError::Validation("unknown message type".into()).kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn test_retryability() {
        assert!(CoreError::RoomFull(RoomId::from("r"), 2).is_retryable());
        assert!(CoreError::ReconnectionTimeout.is_retryable());
        assert!(!CoreError::TokenExpired.is_retryable());
        assert!(!CoreError::Validation("bad frame".into()).is_retryable());
    }

    #[test]
    fn test_display_messages() {
        let err = CoreError::RoomFull(RoomId::from("standup"), 12);
        assert_eq!(err.to_string(), "room standup is full (12 participants)");

        let err = CoreError::Unauthorized("token not valid for room".into());
        assert!(err.to_string().contains("unauthorized"));
    }
}
