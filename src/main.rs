use std::sync::Arc;

use avatar_call_rs::audio::{EnvelopeDriver, MotionPipeline, VisemeFrame};
use avatar_call_rs::broker::BrokerClient;
use avatar_call_rs::session::{ConfiguredMicrophone, SessionDeps};
use avatar_call_rs::transport::{UserNameMatcher, WsTransportFactory};
use avatar_call_rs::tts::TtsClient;
use avatar_call_rs::{Config, ConnectionState, SessionEvent, SessionRegistry};
use serde_json::json;
use tokio::signal;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let config = Config::new().unwrap_or_default().with_env_overrides();
    log::info!("{} v{} starting, broker {}", config.app_name, config.app_version, config.broker_url);

    // 口型帧通道
    let (tx_viseme, mut rx_viseme) = mpsc::unbounded_channel::<VisemeFrame>();
    let driver = EnvelopeDriver::new(config.motion_sync.analysis_fps, Box::new(tx_viseme));
    let pipeline = MotionPipeline::new(config.motion_sync.clone(), Box::new(driver));

    let tts = match &config.tts_endpoint {
        Some(endpoint) => Some(TtsClient::new(endpoint.clone(), config.tts_voice.clone(), config.broker_timeout)?),
        None => None,
    };

    let deps = SessionDeps {
        broker: Arc::new(BrokerClient::new(
            config.broker_url.clone(),
            config.broker_token.clone(),
            config.broker_timeout,
        )?),
        transports: Arc::new(WsTransportFactory::new(
            config.local_user_name.clone(),
            config.motion_sync.track_buffer,
        )),
        microphone: Arc::new(ConfiguredMicrophone::new(config.microphone_enabled, "Default")),
        identity: Arc::new(UserNameMatcher::new(config.agent_user_names.clone())),
        tts,
        pipeline: Some(pipeline),
        message_log_capacity: config.message_log_capacity,
        auto_play_agent_audio: config.motion_sync.auto_play_agent_audio,
    };

    let registry = SessionRegistry::new();
    let (session, mut rx_session) = registry.create(deps).await;

    let connecting = session.clone();
    tokio::spawn(async move {
        if let Err(e) = connecting.connect().await {
            log::error!("Connect failed: {}", e);
        }
    });

    let mut visemes: u64 = 0;
    loop {
        tokio::select! {
            // 监听 Ctrl+C 信号
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }

            Some(event) = rx_session.recv() => {
                match event {
                    SessionEvent::StateChanged { state, error } => {
                        log::info!("Session state: {}", state);
                        match state {
                            ConnectionState::Connected => {
                                let hello = json!({"type": "user-name", "name": config.local_user_name});
                                if let Err(e) = session.send_message(&hello).await {
                                    log::warn!("Failed to send user name: {}", e);
                                }
                            }
                            ConnectionState::Error { .. } => {
                                log::error!("Session failed: {}", error.unwrap_or_default());
                                break;
                            }
                            ConnectionState::Disconnected => break,
                            _ => {}
                        }
                    }
                    SessionEvent::ParticipantJoined(p) => log::info!("{} joined", p.display_name),
                    SessionEvent::ParticipantLeft(p) => log::info!("{} left", p.display_name),
                    SessionEvent::TrackStarted { participant, track } => {
                        log::info!("Track {} ({:?}) started for {}", track.id, track.kind, participant.display_name);
                    }
                    SessionEvent::TrackStopped { participant, track } => {
                        log::info!("Track {} stopped for {}", track.id, participant.display_name);
                    }
                    SessionEvent::Message(msg) => {
                        log::info!("Message from {}: {}", msg.sender_id, msg.payload);
                        // 对方要求朗读时走 TTS
                        if let Some(text) = msg.payload.get("speak").and_then(|v| v.as_str()) {
                            if let Err(e) = session.speak(text).await {
                                log::warn!("Cannot speak: {:#}", e);
                            }
                        }
                    }
                }
            }

            Some(frame) = rx_viseme.recv() => {
                visemes += 1;
                log::trace!(
                    "Viseme @{:.3}s open={:.2} form={:.2}",
                    frame.timestamp_seconds, frame.mouth_open, frame.mouth_form
                );
                if visemes % 600 == 0 {
                    log::debug!("{} viseme frames so far, talking={}", visemes, session.is_talking());
                }
            }
        }
    }

    registry.shutdown().await;
    Ok(())
}
