//! The motion pipeline that turns an audio source into viseme updates.
//!
//! Uses std::thread (NOT tokio tasks) for the window loop so feature
//! extraction never competes with async network tasks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::mpsc::RecvTimeoutError;
use std::thread::{self, JoinHandle};

use tokio::sync::watch;

use crate::config::MotionSyncConfig;
use crate::error::AudioError;

use super::motion_sync::{MotionSyncDriver, MotionSyncState};
use super::stream_decoder::create_decoder;
use super::track::{AudioSource, DecodedAudio, EncodedClip, LiveTrack};
use super::window::{WindowFeatures, Windower};

type SharedDriver = Arc<Mutex<Box<dyn MotionSyncDriver>>>;

static NEXT_PLAYBACK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackStatus {
    Running,
    /// The track ended or the clip played to completion
    Finished,
    Stopped,
    Failed(String),
}

struct PlaybackShared {
    id: u64,
    running: AtomicBool,
    cleaned: AtomicBool,
    status: Mutex<PlaybackStatus>,
    done: watch::Sender<bool>,
    talking: Arc<watch::Sender<bool>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl PlaybackShared {
    /// The one cleanup routine: natural end, explicit stop and session
    /// teardown all land here. Only the first call has any effect.
    fn finish(&self, status: PlaybackStatus) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        log::info!("Playback {} ended: {:?}", self.id, status);
        *lock(&self.status) = status;
        self.talking.send_replace(false);
        self.done.send_replace(true);
    }
}

/// Handle to one running playback.
#[derive(Clone)]
pub struct PlaybackHandle {
    shared: Arc<PlaybackShared>,
}

impl PlaybackHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn status(&self) -> PlaybackStatus {
        lock(&self.shared.status).clone()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.cleaned.load(Ordering::SeqCst)
    }

    /// Ends the playback without waiting for its thread; `stop()` joins it.
    fn signal_stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.finish(PlaybackStatus::Stopped);
    }

    /// Stop pulling windows and wait for the audio thread to exit. Idempotent.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let handle = lock(&self.shared.thread).take();
        if let Some(h) = handle {
            if h.thread().id() != thread::current().id() {
                let _ = h.join();
            }
        }
        self.shared.finish(PlaybackStatus::Stopped);
    }

    /// Resolves once the playback has ended for any reason.
    pub async fn wait(&self) -> PlaybackStatus {
        let mut done = self.shared.done.subscribe();
        let _ = done.wait_for(|d| *d).await;
        self.status()
    }
}

impl std::fmt::Debug for PlaybackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackHandle")
            .field("id", &self.shared.id)
            .field("status", &self.status())
            .finish()
    }
}

/// Owns the motion driver and at most one active playback.
pub struct MotionPipeline {
    config: MotionSyncConfig,
    driver: SharedDriver,
    talking: Arc<watch::Sender<bool>>,
    active: Option<PlaybackHandle>,
}

impl MotionPipeline {
    pub fn new(config: MotionSyncConfig, driver: Box<dyn MotionSyncDriver>) -> Self {
        let (talking, _) = watch::channel(false);
        Self {
            config,
            driver: Arc::new(Mutex::new(driver)),
            talking: Arc::new(talking),
            active: None,
        }
    }

    pub fn config(&self) -> &MotionSyncConfig {
        &self.config
    }

    pub fn is_talking(&self) -> bool {
        *self.talking.borrow()
    }

    pub fn subscribe_talking(&self) -> watch::Receiver<bool> {
        self.talking.subscribe()
    }

    pub fn active(&self) -> Option<&PlaybackHandle> {
        self.active.as_ref().filter(|h| !h.is_finished())
    }

    /// Start driving motion from `source`, replacing any current playback.
    pub fn play_audio(&mut self, source: AudioSource) -> Result<PlaybackHandle, AudioError> {
        let (handle, replaced) = self.replace(source)?;
        if let Some(previous) = replaced {
            previous.stop();
        }
        Ok(handle)
    }

    /// `play_audio()` without joining the replaced playback's thread, which
    /// is returned already ended. A bad source leaves the current one playing.
    pub fn replace(
        &mut self,
        source: AudioSource,
    ) -> Result<(PlaybackHandle, Option<PlaybackHandle>), AudioError> {
        match source {
            AudioSource::Live(track) => {
                if track.sample_rate() == 0 {
                    return Err(AudioError::Decode(format!(
                        "track {} has no sample rate",
                        track.id()
                    )));
                }
                let replaced = self.halt();
                let handle = self.spawn("motion-sync", move |config, driver, shared| {
                    stream_thread(track, config, driver, shared)
                })?;
                Ok((handle, replaced))
            }
            AudioSource::Encoded(clip) => {
                // 先解码，解码失败不影响当前播放
                let decoded = decode_clip(&clip)?;
                let replaced = self.halt();
                let handle = self.spawn("motion-sync-clip", move |_, driver, shared| {
                    clip_thread(decoded, driver, shared)
                })?;
                Ok((handle, replaced))
            }
        }
    }

    /// Stop the active playback, if any. Idempotent.
    pub fn stop(&mut self) {
        if let Some(handle) = self.active.take() {
            handle.stop();
        }
    }

    /// Like `stop()`, but hands the ended playback back instead of joining
    /// its thread. Callers holding a lock call `stop()` on it after release.
    pub fn halt(&mut self) -> Option<PlaybackHandle> {
        let handle = self.active.take()?;
        handle.signal_stop();
        Some(handle)
    }

    fn spawn<F>(&mut self, name: &str, body: F) -> Result<PlaybackHandle, AudioError>
    where
        F: FnOnce(&MotionSyncConfig, &Mutex<Box<dyn MotionSyncDriver>>, &PlaybackShared) -> PlaybackStatus
            + Send
            + 'static,
    {
        let (done, _) = watch::channel(false);
        let shared = Arc::new(PlaybackShared {
            id: NEXT_PLAYBACK_ID.fetch_add(1, Ordering::Relaxed),
            running: AtomicBool::new(true),
            cleaned: AtomicBool::new(false),
            status: Mutex::new(PlaybackStatus::Running),
            done,
            talking: self.talking.clone(),
            thread: Mutex::new(None),
        });

        lock(&self.driver).reset();
        self.talking.send_replace(true);

        let thread_shared = shared.clone();
        let driver = self.driver.clone();
        let config = self.config.clone();
        let spawned = thread::Builder::new().name(name.into()).spawn(move || {
            let status = body(&config, driver.as_ref(), thread_shared.as_ref());
            thread_shared.finish(status);
        });

        let join = match spawned {
            Ok(join) => join,
            Err(e) => {
                shared.finish(PlaybackStatus::Failed(e.to_string()));
                return Err(AudioError::Thread(e));
            }
        };
        *lock(&shared.thread) = Some(join);

        let handle = PlaybackHandle { shared };
        log::info!("Playback {} started on {}", handle.id(), name);
        self.active = Some(handle.clone());
        Ok(handle)
    }
}

impl Drop for MotionPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn decode_clip(clip: &EncodedClip) -> Result<DecodedAudio, AudioError> {
    if clip.bytes.is_empty() {
        return Err(AudioError::EmptySource);
    }
    let mut decoder = create_decoder(clip.format);
    let samples = decoder
        .decode(&clip.bytes)
        .map_err(|e| AudioError::Decode(e.to_string()))?;
    if samples.is_empty() {
        return Err(AudioError::EmptySource);
    }
    Ok(DecodedAudio {
        samples,
        sample_rate: decoder.sample_rate(),
    })
}

// ======================== Streaming thread ========================

fn stream_thread(
    track: LiveTrack,
    config: &MotionSyncConfig,
    driver: &Mutex<Box<dyn MotionSyncDriver>>,
    shared: &PlaybackShared,
) -> PlaybackStatus {
    let sample_rate = track.sample_rate();
    let mut windower = Windower::new(config.window_size, sample_rate);
    let mut sync = MotionSyncState::new(config.max_pending_samples());
    let mut windows = 0u64;

    log::info!(
        "Motion sync streaming: track={}, rate={}, window={}, max_pending={}",
        track.id(),
        sample_rate,
        config.window_size,
        config.max_pending_samples(),
    );

    let ended_naturally = loop {
        if !shared.running.load(Ordering::Relaxed) {
            break false;
        }
        match track.recv_timeout(config.poll_interval) {
            Ok(frame) => {
                windower.push(&frame);
                while let Some(window) = windower.next_window() {
                    let features = WindowFeatures::extract(&window);
                    let dropped = sync.push(&window.samples);
                    if dropped > 0 {
                        log::debug!("Motion sync backlog, dropped {} oldest samples", dropped);
                    }
                    // window 在此之后不再保留
                    drop(window);

                    let consumed = lock(driver).update(sync.pending(), &features);
                    sync.drain(consumed);
                    sync.mark_features(&features);
                    windows += 1;

                    log::trace!(
                        "window {} rms={:.4} consumed={} pending={}",
                        windows,
                        features.rms,
                        consumed,
                        sync.len()
                    );
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break true,
        }
    };

    log::info!(
        "Motion sync streaming stopped: windows={}, processed={}, dropped={}, last_t={:.3}s",
        windows,
        sync.total_processed(),
        sync.dropped(),
        sync.last_feature_timestamp(),
    );

    if ended_naturally {
        PlaybackStatus::Finished
    } else {
        PlaybackStatus::Stopped
    }
}

// ======================== Buffered clip thread ========================

fn clip_thread(
    clip: DecodedAudio,
    driver: &Mutex<Box<dyn MotionSyncDriver>>,
    shared: &PlaybackShared,
) -> PlaybackStatus {
    log::info!(
        "Motion sync clip: {} samples at {}Hz ({:.2}s)",
        clip.samples.len(),
        clip.sample_rate,
        clip.duration().as_secs_f64(),
    );
    match lock(driver).play(&clip, &shared.running) {
        Ok(()) if shared.running.load(Ordering::SeqCst) => PlaybackStatus::Finished,
        Ok(()) => PlaybackStatus::Stopped,
        Err(e) => {
            log::error!("Motion sync clip playback failed: {}", e);
            PlaybackStatus::Failed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::stream_decoder::tests::wav_bytes;
    use crate::audio::track::live_track;
    use crate::audio::motion_sync::{EnvelopeDriver, VisemeFrame};
    use anyhow::Result;
    use std::time::Duration;

    /// Records what the pipeline offered and consumes `consume` samples per update.
    struct RecordingDriver {
        consume: Option<usize>,
        offered: Arc<Mutex<Vec<usize>>>,
        played: Arc<Mutex<Vec<usize>>>,
    }

    impl MotionSyncDriver for RecordingDriver {
        fn update(&mut self, pending: &[f32], _features: &WindowFeatures) -> usize {
            lock(&self.offered).push(pending.len());
            self.consume.unwrap_or(pending.len())
        }

        fn play(&mut self, clip: &DecodedAudio, _running: &AtomicBool) -> Result<()> {
            lock(&self.played).push(clip.samples.len());
            Ok(())
        }
    }

    fn recording(consume: Option<usize>) -> (Box<dyn MotionSyncDriver>, Arc<Mutex<Vec<usize>>>, Arc<Mutex<Vec<usize>>>) {
        let offered = Arc::new(Mutex::new(Vec::new()));
        let played = Arc::new(Mutex::new(Vec::new()));
        let driver = RecordingDriver {
            consume,
            offered: offered.clone(),
            played: played.clone(),
        };
        (Box::new(driver), offered, played)
    }

    fn config() -> MotionSyncConfig {
        MotionSyncConfig {
            window_size: 2048,
            max_pending_windows: 4,
            poll_interval: Duration::from_millis(5),
            ..MotionSyncConfig::default()
        }
    }

    #[tokio::test]
    async fn one_second_of_silence_stays_bounded() {
        let (driver, offered, _) = recording(None);
        let mut pipeline = MotionPipeline::new(config(), driver);
        let (feed, track) = live_track("agent-audio", 48000, 128);

        let handle = pipeline.play_audio(AudioSource::Live(track)).unwrap();
        assert!(pipeline.is_talking());

        // 1s at 48kHz, delivered in 480-sample (10ms) frames
        for _ in 0..100 {
            while !feed.push(vec![0.0; 480]) {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        drop(feed);

        assert_eq!(handle.wait().await, PlaybackStatus::Finished);
        assert!(!pipeline.is_talking());

        let offered = lock(&offered).clone();
        assert_eq!(offered.len(), 48000 / 2048);
        assert!(offered.iter().all(|&n| n == 2048));
    }

    #[tokio::test]
    async fn slow_driver_is_capped_at_the_pending_bound() {
        let (driver, offered, _) = recording(Some(0));
        let mut pipeline = MotionPipeline::new(config(), driver);
        let (feed, track) = live_track("agent-audio", 48000, 128);

        let handle = pipeline.play_audio(AudioSource::Live(track)).unwrap();
        for _ in 0..20 {
            while !feed.push(vec![0.0; 2048]) {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        drop(feed);
        handle.wait().await;

        let max = config().max_pending_samples();
        let offered = lock(&offered).clone();
        assert_eq!(offered.len(), 20);
        assert!(offered.iter().all(|&n| n <= max));
        assert_eq!(*offered.last().unwrap(), max);
    }

    #[tokio::test]
    async fn explicit_stop_converges_on_cleanup() {
        let (driver, _, _) = recording(None);
        let mut pipeline = MotionPipeline::new(config(), driver);
        let (_feed, track) = live_track("agent-audio", 48000, 8);

        let handle = pipeline.play_audio(AudioSource::Live(track)).unwrap();
        let mut talking = pipeline.subscribe_talking();
        assert!(*talking.borrow_and_update());

        pipeline.stop();
        pipeline.stop();
        handle.stop();

        assert_eq!(handle.status(), PlaybackStatus::Stopped);
        assert!(!*talking.borrow());
        assert!(pipeline.active().is_none());
    }

    /// Holds every clip until `running` is cleared.
    struct LingeringDriver;

    impl MotionSyncDriver for LingeringDriver {
        fn update(&mut self, pending: &[f32], _features: &WindowFeatures) -> usize {
            pending.len()
        }

        fn play(&mut self, _clip: &DecodedAudio, running: &AtomicBool) -> Result<()> {
            while running.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn halt_ends_playback_before_the_thread_is_joined() {
        let mut pipeline = MotionPipeline::new(config(), Box::new(LingeringDriver));
        let clip = EncodedClip::wav(wav_bytes(&[1000; 4410], 1, 44100));
        let handle = pipeline.play_audio(AudioSource::Encoded(clip)).unwrap();
        assert!(pipeline.is_talking());

        let halted = pipeline.halt().unwrap();
        assert_eq!(halted.id(), handle.id());
        assert_eq!(handle.status(), PlaybackStatus::Stopped);
        assert!(!pipeline.is_talking());
        assert!(pipeline.active().is_none());
        assert!(pipeline.halt().is_none());

        halted.stop();
        assert_eq!(handle.wait().await, PlaybackStatus::Stopped);
    }

    #[tokio::test]
    async fn buffered_clip_is_handed_over_in_one_call() {
        let (driver, _, played) = recording(None);
        let mut pipeline = MotionPipeline::new(config(), driver);

        let clip = EncodedClip::wav(wav_bytes(&[1000; 4410], 1, 44100));
        let handle = pipeline.play_audio(AudioSource::Encoded(clip)).unwrap();

        assert_eq!(handle.wait().await, PlaybackStatus::Finished);
        assert_eq!(*lock(&played), vec![4410]);
        assert!(!pipeline.is_talking());
    }

    #[test]
    fn bad_clips_are_rejected_before_playback() {
        let (driver, _, _) = recording(None);
        let mut pipeline = MotionPipeline::new(config(), driver);

        let empty = pipeline.play_audio(AudioSource::Encoded(EncodedClip::wav(Vec::<u8>::new())));
        assert!(matches!(empty, Err(AudioError::EmptySource)));

        let no_samples = pipeline.play_audio(AudioSource::Encoded(EncodedClip::wav(wav_bytes(&[], 1, 16000))));
        assert!(matches!(no_samples, Err(AudioError::EmptySource)));

        let garbage = pipeline.play_audio(AudioSource::Encoded(EncodedClip::wav(&b"nope"[..])));
        assert!(matches!(garbage, Err(AudioError::Decode(_))));

        assert!(!pipeline.is_talking());
    }

    #[tokio::test]
    async fn envelope_driver_emits_visemes_from_a_live_track() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<VisemeFrame>();
        let driver = EnvelopeDriver::new(60, Box::new(tx));
        let mut pipeline = MotionPipeline::new(config(), Box::new(driver));
        let (feed, track) = live_track("agent-audio", 48000, 16);

        let handle = pipeline.play_audio(AudioSource::Live(track)).unwrap();
        feed.push(vec![0.3; 4096]);
        drop(feed);
        handle.wait().await;

        let frame = rx.recv().await.unwrap();
        assert!(frame.mouth_open > 0.0);
    }
}
