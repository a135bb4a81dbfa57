use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: &'static str,
    pub app_version: &'static str,

    // Broker 配置
    pub broker_url: String,
    pub broker_token: Option<String>,
    pub broker_timeout: Duration,

    // Agent identity
    pub agent_user_names: Vec<String>,
    pub local_user_name: String,

    pub microphone_enabled: bool,

    pub motion_sync: MotionSyncConfig,

    pub message_log_capacity: usize,

    // TTS（endpoint 为空时禁用）
    pub tts_endpoint: Option<String>,
    pub tts_voice: String,
}

/// Tuning for the audio feature pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionSyncConfig {
    /// Samples per analysis window pulled from a live track
    pub window_size: usize,
    /// Pending buffer bound, in windows; older samples are dropped beyond it
    pub max_pending_windows: usize,
    /// How long the window thread waits for a frame before re-checking its stop flag
    pub poll_interval: Duration,
    /// Viseme updates per second produced by the envelope driver
    pub analysis_fps: u32,
    /// Start streaming playback automatically when the agent's audio track starts
    pub auto_play_agent_audio: bool,
    /// Frames buffered between the transport and the window thread
    pub track_buffer: usize,
}

impl Default for MotionSyncConfig {
    fn default() -> Self {
        Self {
            window_size: 2048,
            max_pending_windows: 8,
            poll_interval: Duration::from_millis(20),
            analysis_fps: 60,
            auto_play_agent_audio: true,
            track_buffer: 64,
        }
    }
}

impl MotionSyncConfig {
    pub fn max_pending_samples(&self) -> usize {
        self.window_size * self.max_pending_windows.max(1)
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn split_names(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter_map(non_empty)
        .collect()
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            broker_url: env!("BROKER_BASE_URL").trim_end_matches('/').to_string(),
            broker_token: non_empty(env!("BROKER_AUTH_TOKEN")),
            broker_timeout: Duration::from_millis(
                env!("BROKER_TIMEOUT_MS").parse()
                    .map_err(|_| "Failed to parse BROKER_TIMEOUT_MS")?,
            ),

            agent_user_names: split_names(env!("AGENT_USER_NAMES")),
            local_user_name: env!("LOCAL_USER_NAME").to_string(),

            microphone_enabled: env!("MICROPHONE_ENABLED").parse()
                .map_err(|_| "Failed to parse MICROPHONE_ENABLED")?,

            motion_sync: MotionSyncConfig {
                window_size: env!("MOTION_WINDOW_SIZE").parse()
                    .map_err(|_| "Failed to parse MOTION_WINDOW_SIZE")?,
                max_pending_windows: env!("MOTION_MAX_PENDING_WINDOWS").parse()
                    .map_err(|_| "Failed to parse MOTION_MAX_PENDING_WINDOWS")?,
                poll_interval: Duration::from_millis(
                    env!("MOTION_POLL_INTERVAL_MS").parse()
                        .map_err(|_| "Failed to parse MOTION_POLL_INTERVAL_MS")?,
                ),
                analysis_fps: env!("MOTION_ANALYSIS_FPS").parse()
                    .map_err(|_| "Failed to parse MOTION_ANALYSIS_FPS")?,
                auto_play_agent_audio: env!("MOTION_AUTO_PLAY").parse()
                    .map_err(|_| "Failed to parse MOTION_AUTO_PLAY")?,
                track_buffer: env!("MOTION_TRACK_BUFFER").parse()
                    .map_err(|_| "Failed to parse MOTION_TRACK_BUFFER")?,
            },

            message_log_capacity: env!("MESSAGE_LOG_CAPACITY").parse()
                .map_err(|_| "Failed to parse MESSAGE_LOG_CAPACITY")?,

            tts_endpoint: non_empty(env!("TTS_ENDPOINT")),
            tts_voice: env!("TTS_VOICE").to_string(),
        })
    }

    /// 运行时环境变量覆盖编译时配置
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("AVATAR_BROKER_URL") {
            if let Some(url) = non_empty(&url) {
                self.broker_url = url.trim_end_matches('/').to_string();
            }
        }
        if let Ok(token) = std::env::var("AVATAR_BROKER_TOKEN") {
            self.broker_token = non_empty(&token);
        }
        if let Ok(names) = std::env::var("AVATAR_AGENT_NAMES") {
            let names = split_names(&names);
            if !names.is_empty() {
                self.agent_user_names = names;
            }
        }
        if let Ok(endpoint) = std::env::var("AVATAR_TTS_ENDPOINT") {
            self.tts_endpoint = non_empty(&endpoint);
        }
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().expect("Failed to create default Config from build-time environment variables")
    }
}
