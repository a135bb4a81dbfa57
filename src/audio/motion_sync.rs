//! Motion sync: the pending sample FIFO and the viseme driver boundary.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;

use super::track::DecodedAudio;
use super::window::{WindowFeatures, amplitude_stats};

/// Per-playback sample FIFO between the window thread and the driver.
///
/// `push` and `drain` are the only mutations. Growth is bounded by
/// dropping the oldest samples once `max_pending` is exceeded.
#[derive(Debug)]
pub struct MotionSyncState {
    pending: VecDeque<f32>,
    max_pending: usize,
    processed_count: usize,
    total_processed: u64,
    last_feature_timestamp: f64,
    dropped: u64,
}

impl MotionSyncState {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(max_pending),
            max_pending: max_pending.max(1),
            processed_count: 0,
            total_processed: 0,
            last_feature_timestamp: 0.0,
            dropped: 0,
        }
    }

    /// Appends a window's samples; returns how many old samples were dropped.
    pub fn push(&mut self, samples: &[f32]) -> usize {
        self.pending.extend(samples.iter().copied());
        let overflow = self.pending.len().saturating_sub(self.max_pending);
        if overflow > 0 {
            self.pending.drain(..overflow);
            self.dropped += overflow as u64;
        }
        overflow
    }

    /// The whole pending buffer as one contiguous slice.
    pub fn pending(&mut self) -> &[f32] {
        self.pending.make_contiguous()
    }

    /// Removes `consumed` samples from the front, clamped to what is pending.
    pub fn drain(&mut self, consumed: usize) -> usize {
        let n = consumed.min(self.pending.len());
        self.pending.drain(..n);
        self.processed_count = n;
        self.total_processed += n as u64;
        n
    }

    pub fn mark_features(&mut self, features: &WindowFeatures) {
        self.last_feature_timestamp = features.end_time_seconds();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn processed_count(&self) -> usize {
        self.processed_count
    }

    pub fn total_processed(&self) -> u64 {
        self.total_processed
    }

    pub fn last_feature_timestamp(&self) -> f64 {
        self.last_feature_timestamp
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Mouth parameters for one avatar frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisemeFrame {
    pub timestamp_seconds: f64,
    /// 0.0 closed .. 1.0 fully open
    pub mouth_open: f32,
    /// -1.0 rounded .. 1.0 wide
    pub mouth_form: f32,
}

/// Where viseme frames go: the avatar renderer or anything standing in for it.
pub trait VisemeSink: Send {
    fn submit(&mut self, frame: VisemeFrame);
}

impl VisemeSink for tokio::sync::mpsc::UnboundedSender<VisemeFrame> {
    fn submit(&mut self, frame: VisemeFrame) {
        let _ = self.send(frame);
    }
}

impl VisemeSink for std::sync::mpsc::Sender<VisemeFrame> {
    fn submit(&mut self, frame: VisemeFrame) {
        let _ = self.send(frame);
    }
}

/// The viseme/motion engine the pipeline feeds.
///
/// Called from the real-time window thread: implementations must not block
/// in `update`.
pub trait MotionSyncDriver: Send {
    /// Offers the whole pending buffer; returns how many leading samples
    /// were consumed.
    fn update(&mut self, pending: &[f32], features: &WindowFeatures) -> usize;

    /// Drives a complete clip, returning once it has been played or
    /// `running` is cleared. Must notice a cleared `running` within a frame
    /// or two: stopping a playback waits for this call to return.
    fn play(&mut self, clip: &DecodedAudio, running: &AtomicBool) -> Result<()>;

    /// Forget any state carried over from a previous playback.
    fn reset(&mut self) {}
}

/// Maps the short-term amplitude envelope to mouth openness and the
/// zero-crossing rate to mouth form. Consumes whole analysis frames only.
pub struct EnvelopeDriver {
    analysis_fps: u32,
    gain: f32,
    smoothing: f32,
    realtime: bool,
    mouth_open: f32,
    clock: f64,
    sink: Box<dyn VisemeSink>,
}

impl EnvelopeDriver {
    pub fn new(analysis_fps: u32, sink: Box<dyn VisemeSink>) -> Self {
        Self {
            analysis_fps: analysis_fps.max(1),
            gain: 4.0,
            smoothing: 0.5,
            realtime: true,
            mouth_open: 0.0,
            clock: 0.0,
            sink,
        }
    }

    pub fn with_gain(mut self, gain: f32) -> Self {
        self.gain = gain;
        self
    }

    /// Pace clip playback at wall-clock speed (default) or emit as fast as possible.
    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    fn frame_len(&self, sample_rate: u32) -> usize {
        (sample_rate / self.analysis_fps).max(1) as usize
    }

    fn emit(&mut self, frame: &[f32], sample_rate: u32) {
        let (rms, _, zcr) = amplitude_stats(frame);
        let target = (rms * self.gain).clamp(0.0, 1.0);
        self.mouth_open += (target - self.mouth_open) * self.smoothing;
        self.clock += frame.len() as f64 / sample_rate.max(1) as f64;
        self.sink.submit(VisemeFrame {
            timestamp_seconds: self.clock,
            mouth_open: self.mouth_open,
            mouth_form: (zcr * 8.0 - 1.0).clamp(-1.0, 1.0),
        });
    }
}

impl MotionSyncDriver for EnvelopeDriver {
    fn update(&mut self, pending: &[f32], features: &WindowFeatures) -> usize {
        let frame_len = self.frame_len(features.sample_rate);
        let frames = pending.len() / frame_len;
        for i in 0..frames {
            self.emit(&pending[i * frame_len..(i + 1) * frame_len], features.sample_rate);
        }
        frames * frame_len
    }

    fn play(&mut self, clip: &DecodedAudio, running: &AtomicBool) -> Result<()> {
        let frame_len = self.frame_len(clip.sample_rate);
        let frame_duration = Duration::from_secs_f64(frame_len as f64 / clip.sample_rate.max(1) as f64);
        for frame in clip.samples.chunks(frame_len) {
            if !running.load(Ordering::Relaxed) {
                break;
            }
            self.emit(frame, clip.sample_rate);
            if self.realtime {
                std::thread::sleep(frame_duration);
            }
        }
        // 播放结束后闭嘴
        self.mouth_open = 0.0;
        self.sink.submit(VisemeFrame {
            timestamp_seconds: self.clock,
            mouth_open: 0.0,
            mouth_form: 0.0,
        });
        Ok(())
    }

    fn reset(&mut self) {
        self.mouth_open = 0.0;
        self.clock = 0.0;
    }
}
