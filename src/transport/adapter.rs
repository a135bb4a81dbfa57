use std::sync::Arc;

use serde_json::Value;

use crate::audio::LiveTrack;
use crate::message::MessageChannel;

use super::identity::AgentIdentity;
use super::{Participant, ParticipantMetadata, RawCallEvent, RawTrack, TrackInfo, TrackKind};

/// Call events in the session's vocabulary.
#[derive(Debug)]
pub enum CallEvent {
    LocalJoined,
    ParticipantJoined(Participant),
    ParticipantLeft(Participant),
    TrackStarted {
        participant: Participant,
        track: TrackInfo,
        audio: Option<LiveTrack>,
    },
    TrackStopped {
        participant: Participant,
        track: TrackInfo,
    },
    AppMessage {
        sender_id: Option<String>,
        payload: Value,
    },
    /// Every transport error is fatal at this layer
    Fatal { message: String },
}

/// Stateless translation of raw transport events.
#[derive(Clone)]
pub struct TransportAdapter {
    identity: Arc<dyn AgentIdentity>,
}

impl TransportAdapter {
    pub fn new(identity: Arc<dyn AgentIdentity>) -> Self {
        Self { identity }
    }

    pub fn participant(&self, meta: &ParticipantMetadata) -> Participant {
        let display_name = meta
            .user_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&meta.session_id)
            .to_string();
        Participant {
            id: meta.session_id.clone(),
            display_name,
            is_local: meta.local,
            is_agent: !meta.local && self.identity.is_agent(meta),
        }
    }

    pub fn translate(&self, raw: RawCallEvent) -> CallEvent {
        match raw {
            RawCallEvent::JoinedMeeting => CallEvent::LocalJoined,
            RawCallEvent::ParticipantJoined(meta) => CallEvent::ParticipantJoined(self.participant(&meta)),
            RawCallEvent::ParticipantLeft(meta) => CallEvent::ParticipantLeft(self.participant(&meta)),
            RawCallEvent::TrackStarted { participant, track } => {
                let (track, audio) = split_track(track);
                CallEvent::TrackStarted {
                    participant: self.participant(&participant),
                    track,
                    audio,
                }
            }
            RawCallEvent::TrackStopped { participant, track } => CallEvent::TrackStopped {
                participant: self.participant(&participant),
                track: split_track(track).0,
            },
            RawCallEvent::AppMessage { data, from_id } => CallEvent::AppMessage {
                sender_id: from_id,
                payload: MessageChannel::decode(&data),
            },
            RawCallEvent::Error { message } => CallEvent::Fatal { message },
        }
    }
}

fn split_track(track: RawTrack) -> (TrackInfo, Option<LiveTrack>) {
    let kind = TrackKind::classify(&track.kind);
    // 只有音频轨道才携带采样流
    let audio = match kind {
        TrackKind::Audio => track.audio,
        _ => None,
    };
    (TrackInfo { id: track.id, kind }, audio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::live_track;
    use crate::transport::UserNameMatcher;
    use serde_json::json;

    fn adapter() -> TransportAdapter {
        TransportAdapter::new(Arc::new(UserNameMatcher::default()))
    }

    fn meta(id: &str, name: Option<&str>, local: bool) -> ParticipantMetadata {
        ParticipantMetadata {
            session_id: id.to_string(),
            user_name: name.map(str::to_string),
            local,
            ..Default::default()
        }
    }

    #[test]
    fn agent_is_recognised_but_never_local() {
        let a = adapter();
        let agent = a.participant(&meta("bot", Some("Chatbot"), false));
        assert!(agent.is_agent);
        assert_eq!(agent.display_name, "Chatbot");

        let me = a.participant(&meta("me", Some("Chatbot"), true));
        assert!(!me.is_agent);
        assert!(me.is_local);
    }

    #[test]
    fn display_name_falls_back_to_id() {
        let p = adapter().participant(&meta("p-7", None, false));
        assert_eq!(p.display_name, "p-7");
        assert!(!p.is_agent);
    }

    #[test]
    fn app_message_payload_is_deserialized() {
        let event = adapter().translate(RawCallEvent::AppMessage {
            data: r#"{"type":"chat","text":"hi"}"#.to_string(),
            from_id: Some("bot".to_string()),
        });
        match event {
            CallEvent::AppMessage { sender_id, payload } => {
                assert_eq!(sender_id.as_deref(), Some("bot"));
                assert_eq!(payload, json!({"type": "chat", "text": "hi"}));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn video_tracks_never_carry_audio() {
        let (_feed, track) = live_track("v1", 16000, 4);
        let event = adapter().translate(RawCallEvent::TrackStarted {
            participant: meta("bot", Some("Chatbot"), false),
            track: RawTrack {
                id: "v1".to_string(),
                kind: "video".to_string(),
                audio: Some(track),
            },
        });
        match event {
            CallEvent::TrackStarted { track, audio, .. } => {
                assert_eq!(track.kind, TrackKind::Video);
                assert!(audio.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn errors_become_fatal() {
        let event = adapter().translate(RawCallEvent::Error {
            message: "ICE failed".to_string(),
        });
        assert!(matches!(event, CallEvent::Fatal { message } if message == "ICE failed"));
    }
}
