//! Reference call transport over a websocket.
//!
//! Text frames carry JSON events tagged by `type`, binary frames carry
//! PCM16LE mono audio for the remote audio track started most recently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use crate::audio::stream_decoder::Pcm16Decoder;
use crate::audio::{StreamDecoder, TrackFeed, live_track};
use crate::error::TransportError;

use super::{
    CallTransport, LocalAudioTrack, ParticipantMetadata, RawCallEvent, RawEventSender, RawTrack,
    TransportFactory,
};

const DEFAULT_SAMPLE_RATE: u32 = 16000;
const LEAVE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct WireTrack {
    id: String,
    kind: String,
    #[serde(default, alias = "sampleRate")]
    sample_rate: Option<u32>,
}

// 服务端下发的事件
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum WireEvent {
    JoinedMeeting,
    ParticipantJoined {
        participant: ParticipantMetadata,
    },
    ParticipantLeft {
        participant: ParticipantMetadata,
    },
    TrackStarted {
        participant: ParticipantMetadata,
        track: WireTrack,
    },
    TrackStopped {
        participant: ParticipantMetadata,
        track: WireTrack,
    },
    AppMessage {
        data: Value,
        #[serde(default, alias = "fromId")]
        from_id: Option<String>,
    },
    Error {
        #[serde(alias = "errorMsg")]
        error_msg: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug)]
enum WsCommand {
    SendText(String),
    Leave,
}

/// Creates one [`WsCallTransport`] per connection attempt.
#[derive(Debug, Clone)]
pub struct WsTransportFactory {
    local_user_name: String,
    track_buffer: usize,
}

impl WsTransportFactory {
    pub fn new(local_user_name: impl Into<String>, track_buffer: usize) -> Self {
        Self {
            local_user_name: local_user_name.into(),
            track_buffer,
        }
    }
}

impl TransportFactory for WsTransportFactory {
    fn create(&self, events: RawEventSender) -> Result<Arc<dyn CallTransport>, TransportError> {
        Ok(Arc::new(WsCallTransport::new(
            events,
            self.local_user_name.clone(),
            self.track_buffer,
        )))
    }
}

pub struct WsCallTransport {
    events: RawEventSender,
    local_user_name: String,
    track_buffer: usize,
    commands: Mutex<Option<mpsc::Sender<WsCommand>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    leaving: Arc<AtomicBool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Room URLs handed out by the broker may be http(s); the socket needs ws(s).
fn socket_url(room_url: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(room_url).map_err(|e| TransportError::Join(format!("invalid room url: {}", e)))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => return Ok(url),
        other => return Err(TransportError::Join(format!("unsupported room url scheme: {}", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::Join(format!("cannot use {} for a websocket", room_url)))?;
    Ok(url)
}

fn pcm16_bytes(frame: &[i16]) -> Vec<u8> {
    frame.iter().flat_map(|s| s.to_le_bytes()).collect()
}

async fn next_uplink(uplink: &mut Option<mpsc::Receiver<Vec<i16>>>) -> Option<Vec<i16>> {
    match uplink {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// The remote audio track currently receiving binary frames.
struct ActiveAudio {
    feed: TrackFeed,
    decoder: Pcm16Decoder,
}

impl WsCallTransport {
    pub fn new(events: RawEventSender, local_user_name: String, track_buffer: usize) -> Self {
        Self {
            events,
            local_user_name,
            track_buffer,
            commands: Mutex::new(None),
            task: Mutex::new(None),
            leaving: Arc::new(AtomicBool::new(false)),
        }
    }

    fn command_sender(&self) -> Option<mpsc::Sender<WsCommand>> {
        lock(&self.commands).clone()
    }
}

#[async_trait]
impl CallTransport for WsCallTransport {
    async fn join(&self, url: &str, token: &str, local_audio: LocalAudioTrack) -> Result<(), TransportError> {
        if self.command_sender().is_some() {
            return Err(TransportError::Join("already joined".to_string()));
        }

        let url = socket_url(url)?;
        let host = url.host_str().unwrap_or_default().to_string();

        let request = tokio_tungstenite::tungstenite::http::Request::builder()
            .method("GET")
            .uri(url.as_str())
            .header("Host", host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .header("Authorization", format!("Bearer {}", token))
            .body(())
            .map_err(|e| TransportError::Join(e.to_string()))?;

        log::info!("Joining call at {}", url);
        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| TransportError::Join(e.to_string()))?;
        let (mut write, read) = ws_stream.split();

        let join_msg = json!({
            "type": "join",
            "user_name": self.local_user_name,
            "audio_track": {"id": local_audio.id, "label": local_audio.label},
        });
        write
            .send(Message::Text(join_msg.to_string().into()))
            .await
            .map_err(|e| TransportError::Join(e.to_string()))?;

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        *lock(&self.commands) = Some(cmd_tx);
        self.leaving.store(false, Ordering::SeqCst);

        let session = WsSession {
            events: self.events.clone(),
            track_buffer: self.track_buffer,
            leaving: self.leaving.clone(),
            active_audio: None,
        };
        let handle = tokio::spawn(session.run(read, write, cmd_rx, local_audio.uplink));
        *lock(&self.task) = Some(handle);
        Ok(())
    }

    async fn leave(&self) -> Result<(), TransportError> {
        let Some(commands) = lock(&self.commands).take() else {
            return Ok(());
        };
        self.leaving.store(true, Ordering::SeqCst);
        commands
            .send(WsCommand::Leave)
            .await
            .map_err(|_| TransportError::Leave("call loop already stopped".to_string()))?;

        let handle = lock(&self.task).take();
        if let Some(handle) = handle {
            match tokio::time::timeout(LEAVE_TIMEOUT, handle).await {
                Ok(_) => {}
                Err(_) => return Err(TransportError::Leave("timed out waiting for the call to close".to_string())),
            }
        }
        log::info!("Left call");
        Ok(())
    }

    async fn destroy(&self) -> Result<(), TransportError> {
        self.leaving.store(true, Ordering::SeqCst);
        lock(&self.commands).take();
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
        }
        Ok(())
    }

    async fn send_app_message(&self, payload: String) -> Result<(), TransportError> {
        let commands = self.command_sender().ok_or(TransportError::Closed)?;
        let msg = json!({"type": "app-message", "data": payload});
        commands
            .send(WsCommand::SendText(msg.to_string()))
            .await
            .map_err(|_| TransportError::Send("call loop stopped".to_string()))
    }
}

impl Drop for WsCallTransport {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
        }
    }
}

struct WsSession {
    events: RawEventSender,
    track_buffer: usize,
    leaving: Arc<AtomicBool>,
    active_audio: Option<ActiveAudio>,
}

impl WsSession {
    async fn run<R, W>(
        mut self,
        mut read: R,
        mut write: W,
        mut rx_cmd: mpsc::Receiver<WsCommand>,
        mut uplink: Option<mpsc::Receiver<Vec<i16>>>,
    ) where
        R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
        W: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let result: anyhow::Result<()> = async {
            loop {
                tokio::select! {
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                            Some(Ok(Message::Binary(data))) => self.handle_audio(&data),
                            Some(Ok(Message::Close(frame))) => {
                                log::info!("Server closed call: {:?}", frame);
                                return Err(anyhow::anyhow!("Connection closed"));
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => return Err(e.into()),
                            None => return Err(anyhow::anyhow!("Connection closed")),
                        }
                    }
                    cmd = rx_cmd.recv() => {
                        match cmd {
                            Some(WsCommand::SendText(text)) => {
                                write.send(Message::Text(text.into())).await?;
                            }
                            Some(WsCommand::Leave) | None => {
                                let leave = json!({"type": "leave"});
                                write.send(Message::Text(leave.to_string().into())).await?;
                                write.send(Message::Close(None)).await?;
                                return Ok(());
                            }
                        }
                    }
                    frame = next_uplink(&mut uplink) => {
                        match frame {
                            Some(frame) => write.send(Message::Binary(pcm16_bytes(&frame).into())).await?,
                            None => uplink = None,
                        }
                    }
                }
            }
        }
        .await;

        // 释放远端音轨，消费端随之结束
        self.active_audio = None;

        if let Err(e) = result {
            if self.leaving.load(Ordering::SeqCst) {
                log::debug!("Call loop ended during leave: {}", e);
            } else {
                log::error!("Call transport failed: {}", e);
                let _ = self.events.send(RawCallEvent::Error { message: e.to_string() });
            }
        }
    }

    fn emit(&self, event: RawCallEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Call event receiver dropped");
        }
    }

    fn handle_text(&mut self, text: &str) {
        let event: WireEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Ignoring malformed call event ({}): {}", e, text);
                return;
            }
        };

        match event {
            WireEvent::JoinedMeeting => self.emit(RawCallEvent::JoinedMeeting),
            WireEvent::ParticipantJoined { participant } => self.emit(RawCallEvent::ParticipantJoined(participant)),
            WireEvent::ParticipantLeft { participant } => self.emit(RawCallEvent::ParticipantLeft(participant)),
            WireEvent::TrackStarted { participant, track } => {
                let audio = if track.kind == "audio" && !participant.local {
                    let sample_rate = track.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE);
                    let (feed, live) = live_track(track.id.clone(), sample_rate, self.track_buffer);
                    self.active_audio = Some(ActiveAudio {
                        feed,
                        decoder: Pcm16Decoder::new(sample_rate),
                    });
                    Some(live)
                } else {
                    None
                };
                self.emit(RawCallEvent::TrackStarted {
                    participant,
                    track: RawTrack {
                        id: track.id,
                        kind: track.kind,
                        audio,
                    },
                });
            }
            WireEvent::TrackStopped { participant, track } => {
                if self
                    .active_audio
                    .as_ref()
                    .is_some_and(|active| active.feed.track_id() == track.id)
                {
                    self.active_audio = None;
                }
                self.emit(RawCallEvent::TrackStopped {
                    participant,
                    track: RawTrack {
                        id: track.id,
                        kind: track.kind,
                        audio: None,
                    },
                });
            }
            WireEvent::AppMessage { data, from_id } => {
                let data = match data {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                self.emit(RawCallEvent::AppMessage { data, from_id });
            }
            WireEvent::Error { error_msg } => self.emit(RawCallEvent::Error { message: error_msg }),
            WireEvent::Unknown => log::debug!("Ignoring call event: {}", text),
        }
    }

    fn handle_audio(&mut self, data: &[u8]) {
        let Some(active) = self.active_audio.as_mut() else {
            log::trace!("Dropping {} audio bytes with no active track", data.len());
            return;
        };
        match active.decoder.decode(data) {
            Ok(samples) if !samples.is_empty() => {
                active.feed.push(samples);
            }
            Ok(_) => {}
            Err(e) => log::warn!("Failed to decode audio frame: {}", e),
        }
    }
}
