//! Call transport adapter.
//!
//! A call transport is the real-time media engine: it joins a room, carries
//! tracks and app messages, and reports what happens as [`RawCallEvent`]s.
//! [`TransportAdapter`] turns those into the session's vocabulary without
//! reconciling any state itself.

mod adapter;
mod identity;
pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::audio::LiveTrack;
use crate::error::TransportError;

pub use adapter::{CallEvent, TransportAdapter};
pub use identity::{AgentIdentity, UserDataFlag, UserNameMatcher};
pub use ws::{WsCallTransport, WsTransportFactory};

pub type ParticipantId = String;

/// Loosely typed participant information as reported by the engine.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ParticipantMetadata {
    #[serde(alias = "id")]
    pub session_id: ParticipantId,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub local: bool,
    #[serde(default, alias = "userData")]
    pub user_data: Option<Value>,
}

/// A call participant, as the session sees it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub is_local: bool,
    pub is_agent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
    Other(String),
}

impl TrackKind {
    pub fn classify(kind: &str) -> Self {
        match kind {
            "audio" => TrackKind::Audio,
            "video" => TrackKind::Video,
            other => TrackKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub id: String,
    pub kind: TrackKind,
}

#[derive(Debug)]
pub struct RawTrack {
    pub id: String,
    pub kind: String,
    /// Sample stream for remote audio tracks the engine can expose as PCM
    pub audio: Option<LiveTrack>,
}

/// Events exactly as the engine reports them.
#[derive(Debug)]
pub enum RawCallEvent {
    JoinedMeeting,
    ParticipantJoined(ParticipantMetadata),
    ParticipantLeft(ParticipantMetadata),
    TrackStarted { participant: ParticipantMetadata, track: RawTrack },
    TrackStopped { participant: ParticipantMetadata, track: RawTrack },
    AppMessage { data: String, from_id: Option<String> },
    Error { message: String },
}

pub type RawEventSender = mpsc::UnboundedSender<RawCallEvent>;

/// The microphone track handed to `join`.
#[derive(Debug)]
pub struct LocalAudioTrack {
    pub id: String,
    pub label: String,
    /// Captured PCM16 mono frames to publish, if the device produces any
    pub uplink: Option<mpsc::Receiver<Vec<i16>>>,
}

impl LocalAudioTrack {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            uplink: None,
        }
    }
}

/// One call object. Created per connection attempt and destroyed with it.
#[async_trait]
pub trait CallTransport: Send + Sync {
    /// Join the room. Resolves once the join request is accepted; the
    /// `JoinedMeeting` event reports the local user as in the call.
    async fn join(&self, url: &str, token: &str, local_audio: LocalAudioTrack) -> Result<(), TransportError>;

    async fn leave(&self) -> Result<(), TransportError>;

    /// Release the call object. Safe after `leave` or without joining.
    async fn destroy(&self) -> Result<(), TransportError>;

    async fn send_app_message(&self, payload: String) -> Result<(), TransportError>;
}

/// Creates call objects that report to `events`.
pub trait TransportFactory: Send + Sync {
    fn create(&self, events: RawEventSender) -> Result<Arc<dyn CallTransport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn track_kinds_are_classified() {
        assert_eq!(TrackKind::classify("audio"), TrackKind::Audio);
        assert_eq!(TrackKind::classify("video"), TrackKind::Video);
        assert_eq!(TrackKind::classify("screenAudio"), TrackKind::Other("screenAudio".into()));
    }

    #[test]
    fn metadata_tolerates_missing_fields() {
        let meta: ParticipantMetadata = serde_json::from_value(json!({"id": "p1"})).unwrap();
        assert_eq!(meta.session_id, "p1");
        assert!(meta.user_name.is_none());
        assert!(!meta.local);
    }
}
