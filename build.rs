use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    broker: Broker,
    agent: Agent,
    microphone: Microphone,
    motion_sync: MotionSync,
    messages: Messages,
    tts: Tts,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Broker {
    base_url: String,
    auth_token: String,
    request_timeout_ms: u64,
}

#[derive(Deserialize)]
struct Agent {
    user_names: String,
    local_user_name: String,
}

#[derive(Deserialize)]
struct Microphone {
    enabled: bool,
}

#[derive(Deserialize)]
struct MotionSync {
    window_size: usize,
    max_pending_windows: usize,
    poll_interval_ms: u64,
    analysis_fps: u32,
    auto_play_agent_audio: bool,
    track_buffer: usize,
}

#[derive(Deserialize)]
struct Messages {
    log_capacity: usize,
}

#[derive(Deserialize)]
struct Tts {
    endpoint: String,
    voice: String,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 应用信息
    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // Broker 配置
    println!("cargo:rustc-env=BROKER_BASE_URL={}", config.broker.base_url);
    println!("cargo:rustc-env=BROKER_AUTH_TOKEN={}", config.broker.auth_token);
    println!("cargo:rustc-env=BROKER_TIMEOUT_MS={}", config.broker.request_timeout_ms);

    // Agent identity
    println!("cargo:rustc-env=AGENT_USER_NAMES={}", config.agent.user_names);
    println!("cargo:rustc-env=LOCAL_USER_NAME={}", config.agent.local_user_name);

    println!("cargo:rustc-env=MICROPHONE_ENABLED={}", config.microphone.enabled);

    // Motion sync 配置
    println!("cargo:rustc-env=MOTION_WINDOW_SIZE={}", config.motion_sync.window_size);
    println!("cargo:rustc-env=MOTION_MAX_PENDING_WINDOWS={}", config.motion_sync.max_pending_windows);
    println!("cargo:rustc-env=MOTION_POLL_INTERVAL_MS={}", config.motion_sync.poll_interval_ms);
    println!("cargo:rustc-env=MOTION_ANALYSIS_FPS={}", config.motion_sync.analysis_fps);
    println!("cargo:rustc-env=MOTION_AUTO_PLAY={}", config.motion_sync.auto_play_agent_audio);
    println!("cargo:rustc-env=MOTION_TRACK_BUFFER={}", config.motion_sync.track_buffer);

    println!("cargo:rustc-env=MESSAGE_LOG_CAPACITY={}", config.messages.log_capacity);

    // TTS 配置
    println!("cargo:rustc-env=TTS_ENDPOINT={}", config.tts.endpoint);
    println!("cargo:rustc-env=TTS_VOICE={}", config.tts.voice);
}
