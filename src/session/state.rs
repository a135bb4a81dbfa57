use std::fmt;

use crate::message::InboundMessage;
use crate::transport::{Participant, TrackInfo};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Error {
        message: String,
    },
}

impl ConnectionState {
    /// States in which a connect attempt is already under way.
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            ConnectionState::Error { message } => Some(message),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Error { message } => write!(f, "error: {}", message),
        }
    }
}

/// Everything a session reports, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        state: ConnectionState,
        error: Option<String>,
    },
    ParticipantJoined(Participant),
    ParticipantLeft(Participant),
    TrackStarted {
        participant: Participant,
        track: TrackInfo,
    },
    TrackStopped {
        participant: Participant,
        track: TrackInfo,
    },
    Message(InboundMessage),
}
