//! Audio sources handed to the motion pipeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::stream_decoder::ClipFormat;

/// Receiving end of a live remote audio track: mono f32 frames of any size.
#[derive(Debug)]
pub struct LiveTrack {
    id: String,
    sample_rate: u32,
    frames: Receiver<Vec<f32>>,
}

/// Producing end of a live track, held by the call transport.
///
/// Dropping the feed ends the track.
#[derive(Debug, Clone)]
pub struct TrackFeed {
    track_id: String,
    sender: SyncSender<Vec<f32>>,
    dropped: Arc<AtomicU64>,
}

/// Creates a bounded live track. The producer never blocks; frames are
/// dropped when `capacity` frames are already queued.
pub fn live_track(id: impl Into<String>, sample_rate: u32, capacity: usize) -> (TrackFeed, LiveTrack) {
    let id = id.into();
    let (sender, frames) = mpsc::sync_channel(capacity.max(1));
    (
        TrackFeed {
            track_id: id.clone(),
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        LiveTrack {
            id,
            sample_rate,
            frames,
        },
    )
}

impl LiveTrack {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub(crate) fn recv_timeout(&self, timeout: Duration) -> Result<Vec<f32>, RecvTimeoutError> {
        self.frames.recv_timeout(timeout)
    }
}

impl TrackFeed {
    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    /// Returns false if the frame was dropped or the track consumer is gone.
    pub fn push(&self, frame: Vec<f32>) -> bool {
        match self.sender.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    log::warn!("Track {} consumer lagging, {} frames dropped", self.track_id, dropped);
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A complete encoded clip held in memory.
#[derive(Debug, Clone)]
pub struct EncodedClip {
    pub bytes: Bytes,
    pub format: ClipFormat,
}

impl EncodedClip {
    pub fn wav(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            format: ClipFormat::Wav,
        }
    }
}

#[derive(Debug)]
pub enum AudioSource {
    Live(LiveTrack),
    Encoded(EncodedClip),
}

/// Mono PCM decoded from an [`EncodedClip`].
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}
