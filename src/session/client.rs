use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::audio::{AudioSource, MotionPipeline, PlaybackHandle};
use crate::broker::{CallCredentials, SessionBroker};
use crate::error::{AudioError, SessionError, TransportError};
use crate::message::{InboundMessage, MessageChannel};
use crate::transport::{
    AgentIdentity, CallTransport, Participant, RawCallEvent, TransportAdapter, TransportFactory,
};
use crate::tts::TtsClient;

use super::machine::{SessionCore, SessionSnapshot};
use super::microphone::Microphone;
use super::state::{ConnectionState, SessionEvent};

/// Collaborators a session is built from.
pub struct SessionDeps {
    pub broker: Arc<dyn SessionBroker>,
    pub transports: Arc<dyn TransportFactory>,
    pub microphone: Arc<dyn Microphone>,
    pub identity: Arc<dyn AgentIdentity>,
    pub tts: Option<TtsClient>,
    pub pipeline: Option<MotionPipeline>,
    pub message_log_capacity: usize,
    pub auto_play_agent_audio: bool,
}

fn lock(core: &Mutex<SessionCore>) -> MutexGuard<'_, SessionCore> {
    core.lock().unwrap_or_else(|e| e.into_inner())
}

/// Runs `f` under the session lock, then joins any playback threads it
/// stopped once the lock is released.
fn with_core<R>(core: &Mutex<SessionCore>, f: impl FnOnce(&mut SessionCore) -> R) -> R {
    let (out, halted) = {
        let mut guard = lock(core);
        let out = f(&mut guard);
        (out, guard.take_halted())
    };
    for handle in halted {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || handle.stop());
            }
            Err(_) => handle.stop(),
        }
    }
    out
}

/// Best-effort leave and destroy. Failures are logged, never returned.
async fn release(transport: Arc<dyn CallTransport>) {
    if let Err(e) = transport.leave().await {
        log::warn!("Leaving call failed: {}", e);
    }
    if let Err(e) = transport.destroy().await {
        log::warn!("Destroying call object failed: {}", e);
    }
}

/// Forwards one transport's events into the session, in arrival order.
async fn pump_events(
    core: Arc<Mutex<SessionCore>>,
    adapter: TransportAdapter,
    generation: u64,
    mut raw_events: mpsc::UnboundedReceiver<RawCallEvent>,
) {
    while let Some(raw) = raw_events.recv().await {
        let event = adapter.translate(raw);
        let applied = with_core(&core, |core| {
            core.is_current(generation).then(|| core.handle_call_event(event))
        });
        let Some(teardown) = applied else {
            log::debug!("Event pump for attempt {} stopping", generation);
            break;
        };
        if let Some(transport) = teardown {
            release(transport).await;
            break;
        }
    }
}

/// One voice call: broker, transport, motion pipeline and message log.
pub struct VoiceSession {
    id: Uuid,
    core: Arc<Mutex<SessionCore>>,
    broker: Arc<dyn SessionBroker>,
    transports: Arc<dyn TransportFactory>,
    microphone: Arc<dyn Microphone>,
    adapter: TransportAdapter,
    tts: Option<TtsClient>,
}

impl VoiceSession {
    pub fn new(deps: SessionDeps) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let core = SessionCore::new(
            events_tx,
            deps.message_log_capacity,
            deps.pipeline,
            deps.auto_play_agent_audio,
        );
        let session = Self {
            id: Uuid::new_v4(),
            core: Arc::new(Mutex::new(core)),
            broker: deps.broker,
            transports: deps.transports,
            microphone: deps.microphone,
            adapter: TransportAdapter::new(deps.identity),
            tts: deps.tts,
        };
        log::debug!("Session {} created", session.id);
        (session, events_rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Turns a failure of attempt `generation` into the `Error` state.
    fn fail(&self, generation: u64, err: SessionError) -> SessionError {
        let teardown = with_core(&self.core, |core| core.fail(generation, err.to_string()));
        if let Some(transport) = teardown {
            tokio::spawn(release(transport));
        }
        err
    }

    /// Error for an attempt that lost ownership of the session midway.
    fn abandoned(&self, generation: u64) -> SessionError {
        let err = lock(&self.core).outcome_of(generation);
        log::info!("Connect attempt {} abandoned: {}", generation, err);
        err
    }

    /// Microphone, credentials, call object, join, then agent dispatch.
    ///
    /// A no-op while a connect is already in progress or connected. Returns
    /// [`SessionError::Superseded`] if `disconnect()` ran in the meantime;
    /// the state it left behind is not touched. A fatal call error raised
    /// while joining is returned as [`TransportError::Fatal`].
    pub async fn connect(&self) -> Result<(), SessionError> {
        let Some(generation) = with_core(&self.core, SessionCore::begin_connect) else {
            return Ok(());
        };
        log::info!("Session {} connecting (attempt {})", self.id, generation);

        let local_audio = match self.microphone.request_access().await {
            Ok(track) => track,
            Err(denied) => return Err(self.fail(generation, denied.into())),
        };
        if !lock(&self.core).is_current(generation) {
            return Err(self.abandoned(generation));
        }

        let credentials = match self.broker.fetch_credentials().await {
            Ok(credentials) => credentials,
            Err(e) => return Err(self.fail(generation, e.into())),
        };
        if !lock(&self.core).store_credentials(generation, credentials.clone()) {
            return Err(self.abandoned(generation));
        }

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let transport = match self.transports.create(raw_tx) {
            Ok(transport) => transport,
            Err(e) => return Err(self.fail(generation, e.into())),
        };
        if !lock(&self.core).attach_transport(generation, transport.clone()) {
            release(transport).await;
            return Err(self.abandoned(generation));
        }
        tokio::spawn(pump_events(self.core.clone(), self.adapter.clone(), generation, raw_rx));

        if let Err(e) = transport
            .join(&credentials.room_url, &credentials.token, local_audio)
            .await
        {
            return Err(self.fail(generation, e.into()));
        }
        if !lock(&self.core).is_current(generation) {
            // disconnect() 已经释放了 transport，这里再补一次以防 join 晚到
            release(transport).await;
            return Err(self.abandoned(generation));
        }

        match self.broker.request_agent(&credentials).await {
            Ok(dispatch) => log::info!("Agent dispatched: {:?}", dispatch),
            Err(e) => return Err(self.fail(generation, e.into())),
        }
        if !lock(&self.core).is_current(generation) {
            return Err(self.abandoned(generation));
        }
        Ok(())
    }

    /// Always succeeds. Safe to call repeatedly or before any connect.
    pub async fn disconnect(&self) {
        let teardown = with_core(&self.core, SessionCore::disconnect);
        if let Some(transport) = teardown {
            release(transport).await;
        }
        log::info!("Session {} disconnected", self.id);
    }

    /// Sends `payload` over the call's data channel. Without a call object
    /// this only logs a warning.
    pub async fn send_message(&self, payload: &Value) -> Result<(), TransportError> {
        let transport = lock(&self.core).transport();
        let Some(transport) = transport else {
            log::warn!("send_message() without a call transport, dropping {}", payload);
            return Ok(());
        };
        transport.send_app_message(MessageChannel::encode(payload)).await
    }

    pub fn play_audio(&self, source: AudioSource) -> Result<PlaybackHandle, AudioError> {
        with_core(&self.core, |core| core.play_audio(source))
    }

    /// Synthesizes `text` and plays it as a buffered clip.
    pub async fn speak(&self, text: &str) -> anyhow::Result<PlaybackHandle> {
        let tts = self.tts.as_ref().context("text-to-speech is not configured")?;
        let clip = tts.synthesize(text).await?;
        Ok(self.play_audio(AudioSource::Encoded(clip))?)
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.core).state().clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        lock(&self.core).snapshot()
    }

    pub fn credentials(&self) -> Option<CallCredentials> {
        lock(&self.core).credentials().cloned()
    }

    pub fn participants(&self) -> Vec<Participant> {
        lock(&self.core).participants()
    }

    pub fn messages(&self) -> Vec<InboundMessage> {
        lock(&self.core).messages()
    }

    pub fn is_talking(&self) -> bool {
        lock(&self.core).pipeline().is_some_and(|p| p.is_talking())
    }

    pub fn subscribe_talking(&self) -> Option<watch::Receiver<bool>> {
        lock(&self.core).pipeline().map(|p| p.subscribe_talking())
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        let teardown = with_core(&self.core, SessionCore::disconnect);
        let Some(transport) = teardown else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(release(transport));
            }
            Err(_) => log::warn!("Session {} dropped outside a runtime, call not left", self.id),
        }
    }
}
