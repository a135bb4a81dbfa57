use thiserror::Error;

/// Failures talking to the session broker.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("{0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP error! status: {status} {text}")]
    Status { status: u16, text: String },

    #[error("Failed to get daily_url or daily_token")]
    MissingCredentials,

    #[error("invalid broker response: {0}")]
    Decode(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("{0}")]
    Join(String),

    #[error("app message send failed: {0}")]
    Send(String),

    #[error("call leave failed: {0}")]
    Leave(String),

    #[error("{0}")]
    Fatal(String),

    #[error("call transport closed")]
    Closed,
}

/// Audio pipeline failures. These never move the session out of its
/// connection state.
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("audio decode failed: {0}")]
    Decode(String),

    #[error("audio source is empty")]
    EmptySource,

    #[error("motion sync driver failed: {0}")]
    Driver(String),

    #[error("failed to spawn audio thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// The user or platform refused microphone access.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct PermissionDenied(pub String);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("microphone access denied: {0}")]
    Permission(#[from] PermissionDenied),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("connect attempt superseded by disconnect")]
    Superseded,
}
