use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::audio::{AudioSource, MotionPipeline, PlaybackHandle};
use crate::broker::CallCredentials;
use crate::error::{AudioError, SessionError, TransportError};
use crate::message::{InboundMessage, MessageChannel};
use crate::transport::{CallEvent, CallTransport, Participant, ParticipantId, TrackKind};

use super::state::{ConnectionState, SessionEvent};

/// Point-in-time copy of the reconciled session state.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub local_joined: bool,
    pub agent_joined: bool,
    pub has_credentials: bool,
    pub participants: Vec<Participant>,
}

/// Connection state and everything the current connection owns.
///
/// Every method runs to completion without suspending, so events go out in
/// the order the transport reported them. Methods taking a `generation`
/// refuse to act for a connect attempt that has since been superseded.
pub struct SessionCore {
    state: ConnectionState,
    local_joined: bool,
    agent_joined: bool,
    credentials: Option<CallCredentials>,
    participants: BTreeMap<ParticipantId, Participant>,
    generation: u64,
    transport: Option<Arc<dyn CallTransport>>,
    messages: MessageChannel,
    pipeline: Option<MotionPipeline>,
    auto_play: bool,
    playing_track: Option<String>,
    /// Ended playbacks whose threads still need joining
    halted: Vec<PlaybackHandle>,
    /// Attempt that the last `Error` state belongs to
    failed_generation: Option<u64>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionCore {
    pub fn new(
        events: mpsc::UnboundedSender<SessionEvent>,
        message_log_capacity: usize,
        pipeline: Option<MotionPipeline>,
        auto_play: bool,
    ) -> Self {
        Self {
            state: ConnectionState::Idle,
            local_joined: false,
            agent_joined: false,
            credentials: None,
            participants: BTreeMap::new(),
            generation: 0,
            transport: None,
            messages: MessageChannel::new(message_log_capacity),
            pipeline,
            auto_play,
            playing_track: None,
            halted: Vec::new(),
            failed_generation: None,
            events,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn credentials(&self) -> Option<&CallCredentials> {
        self.credentials.as_ref()
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.participants.values().cloned().collect()
    }

    pub fn messages(&self) -> Vec<InboundMessage> {
        self.messages.messages()
    }

    pub fn transport(&self) -> Option<Arc<dyn CallTransport>> {
        self.transport.clone()
    }

    pub fn pipeline(&self) -> Option<&MotionPipeline> {
        self.pipeline.as_ref()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state.clone(),
            local_joined: self.local_joined,
            agent_joined: self.agent_joined,
            has_credentials: self.credentials.is_some(),
            participants: self.participants(),
        }
    }

    /// True while `generation` is the connect attempt in progress.
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.state.is_active()
    }

    /// Why attempt `generation` can no longer finish: the error that ended
    /// it, or `Superseded` when a disconnect or a newer attempt took over.
    pub fn outcome_of(&self, generation: u64) -> SessionError {
        match &self.state {
            ConnectionState::Error { message } if self.failed_generation == Some(generation) => {
                TransportError::Fatal(message.clone()).into()
            }
            _ => SessionError::Superseded,
        }
    }

    /// Playbacks stopped under the lock. Call `stop()` on each after
    /// releasing it to join their threads.
    pub fn take_halted(&mut self) -> Vec<PlaybackHandle> {
        std::mem::take(&mut self.halted)
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            log::trace!("Session event receiver dropped");
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        log::info!("Session state {} -> {}", self.state, next);
        self.state = next.clone();
        let error = next.error_message().map(str::to_string);
        self.emit(SessionEvent::StateChanged { state: next, error });
    }

    /// The only place `Connected` is entered or left.
    fn recompute(&mut self) {
        let both = self.local_joined && self.agent_joined;
        match self.state {
            ConnectionState::Connecting if both => self.transition(ConnectionState::Connected),
            ConnectionState::Connected if !both => self.transition(ConnectionState::Connecting),
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.local_joined = false;
        self.agent_joined = false;
        self.credentials = None;
        self.participants.clear();
        self.stop_playback();
    }

    fn stop_playback(&mut self) {
        self.playing_track = None;
        if let Some(handle) = self.pipeline.as_mut().and_then(MotionPipeline::halt) {
            self.halted.push(handle);
        }
    }

    /// Starts a connect attempt. Returns `None` when one is already under way.
    pub fn begin_connect(&mut self) -> Option<u64> {
        if self.state.is_active() {
            log::warn!("connect() ignored, session is already {}", self.state);
            return None;
        }
        self.reset();
        self.messages.clear();
        self.generation += 1;
        self.transition(ConnectionState::Connecting);
        Some(self.generation)
    }

    pub fn store_credentials(&mut self, generation: u64, credentials: CallCredentials) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.credentials = Some(credentials);
        true
    }

    pub fn attach_transport(&mut self, generation: u64, transport: Arc<dyn CallTransport>) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.transport = Some(transport);
        true
    }

    /// Moves the attempt `generation` to `Error`. Returns the transport to
    /// tear down, if the attempt still held one.
    pub fn fail(&mut self, generation: u64, message: String) -> Option<Arc<dyn CallTransport>> {
        if !self.is_current(generation) {
            log::debug!("Dropping error from superseded connect attempt: {}", message);
            return None;
        }
        self.fatal(message)
    }

    fn fatal(&mut self, message: String) -> Option<Arc<dyn CallTransport>> {
        log::error!("Session failed: {}", message);
        self.failed_generation = Some(self.generation);
        self.generation += 1;
        self.reset();
        let transport = self.transport.take();
        self.transition(ConnectionState::Error { message });
        transport
    }

    /// Applies one transport event. Returns the transport to tear down when
    /// the event was fatal.
    pub fn handle_call_event(&mut self, event: CallEvent) -> Option<Arc<dyn CallTransport>> {
        if !self.state.is_active() {
            log::debug!("Ignoring call event while {}: {:?}", self.state, event);
            return None;
        }
        match event {
            CallEvent::LocalJoined => {
                self.local_joined = true;
                self.recompute();
            }
            CallEvent::ParticipantJoined(participant) => {
                if self.participants.contains_key(&participant.id) {
                    log::debug!("Participant {} already known", participant.id);
                    return None;
                }
                log::info!(
                    "Participant joined: {} ({}){}",
                    participant.display_name,
                    participant.id,
                    if participant.is_agent { " [agent]" } else { "" }
                );
                let is_agent = participant.is_agent;
                self.participants.insert(participant.id.clone(), participant.clone());
                self.emit(SessionEvent::ParticipantJoined(participant));
                if is_agent {
                    self.agent_joined = true;
                    self.recompute();
                }
            }
            CallEvent::ParticipantLeft(participant) => {
                let Some(known) = self.participants.remove(&participant.id) else {
                    log::warn!("Ignoring leave for unknown participant {}", participant.id);
                    return None;
                };
                log::info!("Participant left: {} ({})", known.display_name, known.id);
                self.emit(SessionEvent::ParticipantLeft(known.clone()));
                if known.is_agent {
                    self.agent_joined = self.participants.values().any(|p| p.is_agent);
                    self.recompute();
                }
            }
            CallEvent::TrackStarted { participant, track, audio } => {
                self.emit(SessionEvent::TrackStarted {
                    participant: participant.clone(),
                    track: track.clone(),
                });
                if track.kind != TrackKind::Audio || !participant.is_agent || !self.auto_play {
                    return None;
                }
                let (Some(audio), Some(pipeline)) = (audio, self.pipeline.as_mut()) else {
                    return None;
                };
                match pipeline.replace(AudioSource::Live(audio)) {
                    Ok((handle, replaced)) => {
                        log::info!("Driving motion from agent track {} (playback {})", track.id, handle.id());
                        self.halted.extend(replaced);
                        self.playing_track = Some(track.id);
                    }
                    // 音频错误不影响连接状态
                    Err(e) => log::warn!("Cannot play agent track {}: {}", track.id, e),
                }
            }
            CallEvent::TrackStopped { participant, track } => {
                if self.playing_track.as_deref() == Some(track.id.as_str()) {
                    self.stop_playback();
                }
                self.emit(SessionEvent::TrackStopped { participant, track });
            }
            CallEvent::AppMessage { sender_id, payload } => {
                let message = self.messages.record(sender_id, payload);
                log::debug!("App message from {}: {}", message.sender_id, message.payload);
                self.emit(SessionEvent::Message(message));
            }
            CallEvent::Fatal { message } => return self.fatal(message),
        }
        None
    }

    pub fn play_audio(&mut self, source: AudioSource) -> Result<PlaybackHandle, AudioError> {
        let pipeline = self
            .pipeline
            .as_mut()
            .ok_or_else(|| AudioError::Driver("no motion pipeline configured".to_string()))?;
        let (handle, replaced) = pipeline.replace(source)?;
        self.playing_track = None;
        self.halted.extend(replaced);
        Ok(handle)
    }

    /// Tears everything down. Returns the transport to release.
    pub fn disconnect(&mut self) -> Option<Arc<dyn CallTransport>> {
        let playing = self.pipeline.as_ref().is_some_and(|p| p.active().is_some());
        if self.state == ConnectionState::Disconnected && self.transport.is_none() && !playing {
            log::debug!("disconnect() on an already disconnected session");
            return None;
        }
        self.generation += 1;
        self.reset();
        self.messages.clear();
        let transport = self.transport.take();
        self.transition(ConnectionState::Disconnecting);
        self.transition(ConnectionState::Disconnected);
        transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::{LocalAudioTrack, TrackInfo};
    use async_trait::async_trait;
    use serde_json::json;

    struct NullTransport;

    #[async_trait]
    impl CallTransport for NullTransport {
        async fn join(&self, _: &str, _: &str, _: LocalAudioTrack) -> Result<(), TransportError> {
            Ok(())
        }
        async fn leave(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn destroy(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn send_app_message(&self, _: String) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn core() -> (SessionCore, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SessionCore::new(tx, 16, None, true), rx)
    }

    fn participant(id: &str, is_agent: bool) -> Participant {
        Participant {
            id: id.to_string(),
            display_name: id.to_string(),
            is_local: false,
            is_agent,
        }
    }

    fn states(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<ConnectionState> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::StateChanged { state, .. } = event {
                out.push(state);
            }
        }
        out
    }

    fn connecting(core: &mut SessionCore) -> u64 {
        let generation = core.begin_connect().unwrap();
        core.store_credentials(
            generation,
            CallCredentials {
                room_url: "https://x/room".into(),
                token: "t".into(),
            },
        );
        core.attach_transport(generation, Arc::new(NullTransport));
        generation
    }

    fn assert_invariant(core: &SessionCore) {
        let snap = core.snapshot();
        assert_eq!(
            snap.state == ConnectionState::Connected,
            snap.local_joined && snap.agent_joined,
            "{snap:?}"
        );
    }

    #[test]
    fn second_connect_is_rejected_while_active() {
        let (mut core, mut rx) = core();
        assert!(core.begin_connect().is_some());
        assert!(core.begin_connect().is_none());
        assert_eq!(states(&mut rx), vec![ConnectionState::Connecting]);
    }

    #[test]
    fn connected_needs_both_local_and_agent() {
        let (mut core, mut rx) = core();
        connecting(&mut core);

        core.handle_call_event(CallEvent::ParticipantJoined(participant("bot", true)));
        assert_invariant(&core);
        assert_eq!(core.state(), &ConnectionState::Connecting);

        core.handle_call_event(CallEvent::LocalJoined);
        assert_invariant(&core);
        assert_eq!(core.state(), &ConnectionState::Connected);

        // 重复的加入事件不产生新的状态变化
        core.handle_call_event(CallEvent::ParticipantJoined(participant("bot", true)));
        core.handle_call_event(CallEvent::LocalJoined);
        assert_eq!(
            states(&mut rx),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }

    #[test]
    fn participant_event_precedes_resulting_state_change() {
        let (mut core, mut rx) = core();
        connecting(&mut core);
        core.handle_call_event(CallEvent::LocalJoined);
        while rx.try_recv().is_ok() {}

        core.handle_call_event(CallEvent::ParticipantJoined(participant("bot", true)));
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::ParticipantJoined(p)) if p.id == "bot"));
        assert!(matches!(
            rx.try_recv(),
            Ok(SessionEvent::StateChanged { state: ConnectionState::Connected, .. })
        ));
    }

    #[test]
    fn agent_stays_joined_while_another_agent_remains() {
        let (mut core, _rx) = core();
        connecting(&mut core);
        core.handle_call_event(CallEvent::LocalJoined);
        core.handle_call_event(CallEvent::ParticipantJoined(participant("bot-1", true)));
        core.handle_call_event(CallEvent::ParticipantJoined(participant("bot-2", true)));
        core.handle_call_event(CallEvent::ParticipantLeft(participant("bot-1", true)));
        assert_eq!(core.state(), &ConnectionState::Connected);

        core.handle_call_event(CallEvent::ParticipantLeft(participant("bot-2", true)));
        assert_eq!(core.state(), &ConnectionState::Connecting);
        assert_invariant(&core);
    }

    #[test]
    fn unknown_leave_is_ignored() {
        let (mut core, mut rx) = core();
        connecting(&mut core);
        while rx.try_recv().is_ok() {}
        core.handle_call_event(CallEvent::ParticipantLeft(participant("ghost", false)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn fatal_event_clears_credentials_and_returns_transport() {
        let (mut core, mut rx) = core();
        let generation = connecting(&mut core);
        core.handle_call_event(CallEvent::LocalJoined);

        let teardown = core.handle_call_event(CallEvent::Fatal {
            message: "ICE failed".into(),
        });
        assert!(teardown.is_some());
        assert!(core.credentials().is_none());
        assert!(!core.is_current(generation));
        assert_eq!(
            states(&mut rx).last(),
            Some(&ConnectionState::Error {
                message: "ICE failed".into()
            })
        );
    }

    #[test]
    fn events_outside_an_attempt_are_ignored() {
        let (mut core, mut rx) = core();
        core.handle_call_event(CallEvent::LocalJoined);
        core.handle_call_event(CallEvent::ParticipantJoined(participant("bot", true)));
        assert_eq!(core.state(), &ConnectionState::Idle);
        assert!(core.participants().is_empty());
        assert_invariant(&core);

        connecting(&mut core);
        core.disconnect();
        while rx.try_recv().is_ok() {}
        core.handle_call_event(CallEvent::LocalJoined);
        core.handle_call_event(CallEvent::ParticipantJoined(participant("bot", true)));
        let snap = core.snapshot();
        assert!(!snap.local_joined && !snap.agent_joined);
        assert_eq!(snap.state, ConnectionState::Disconnected);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn failed_attempt_reports_its_error_not_a_disconnect() {
        let (mut core, _rx) = core();
        let generation = connecting(&mut core);
        core.handle_call_event(CallEvent::Fatal {
            message: "ICE failed".into(),
        });
        assert!(matches!(
            core.outcome_of(generation),
            SessionError::Transport(TransportError::Fatal(m)) if m == "ICE failed"
        ));

        let next = connecting(&mut core);
        core.disconnect();
        assert!(matches!(core.outcome_of(next), SessionError::Superseded));
        assert!(matches!(core.outcome_of(generation), SessionError::Superseded));
    }

    #[test]
    fn stale_generation_cannot_store_or_fail() {
        let (mut core, _rx) = core();
        let generation = core.begin_connect().unwrap();
        core.disconnect();
        assert!(!core.store_credentials(
            generation,
            CallCredentials {
                room_url: "u".into(),
                token: "t".into()
            }
        ));
        assert!(core.fail(generation, "late".into()).is_none());
        assert_eq!(core.state(), &ConnectionState::Disconnected);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let (mut core, mut rx) = core();
        connecting(&mut core);
        core.handle_call_event(CallEvent::AppMessage {
            sender_id: None,
            payload: json!("hi"),
        });

        assert!(core.disconnect().is_some());
        assert!(core.disconnect().is_none());
        assert!(core.messages().is_empty());
        assert_eq!(
            states(&mut rx),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Disconnecting,
                ConnectionState::Disconnected
            ]
        );
    }

    #[test]
    fn track_events_are_reported() {
        let (mut core, mut rx) = core();
        connecting(&mut core);
        while rx.try_recv().is_ok() {}
        let track = TrackInfo {
            id: "v1".into(),
            kind: TrackKind::Video,
        };
        core.handle_call_event(CallEvent::TrackStarted {
            participant: participant("bot", true),
            track: track.clone(),
            audio: None,
        });
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::TrackStarted { track: t, .. }) if t == track));
    }

    #[test]
    fn play_audio_without_pipeline_fails_locally() {
        let (mut core, _rx) = core();
        connecting(&mut core);
        let err = core
            .play_audio(AudioSource::Encoded(crate::audio::EncodedClip::wav(vec![1u8, 2, 3])))
            .unwrap_err();
        assert!(matches!(err, AudioError::Driver(_)));
        assert_eq!(core.state(), &ConnectionState::Connecting);
    }
}
