//! Voice-AI call client: joins a call with a remote voice agent and drives
//! avatar motion from the agent's audio.

pub mod audio;
pub mod broker;
pub mod config;
pub mod error;
pub mod message;
pub mod session;
pub mod transport;
pub mod tts;

pub use config::Config;
pub use error::{AudioError, BrokerError, PermissionDenied, SessionError, TransportError};
pub use session::{ConnectionState, SessionEvent, SessionRegistry, VoiceSession};
