//! audio - Audio feature pipeline driving avatar motion
//!
//! Pulls fixed-size windows from a live remote track (or decodes a buffered
//! clip once), extracts amplitude and timing features, and feeds them to a
//! viseme/motion driver.

mod motion_sync;
mod pipeline;
pub mod stream_decoder;
mod track;
mod window;

pub use motion_sync::{EnvelopeDriver, MotionSyncDriver, MotionSyncState, VisemeFrame, VisemeSink};
pub use pipeline::{MotionPipeline, PlaybackHandle, PlaybackStatus};
pub use stream_decoder::{ClipFormat, StreamDecoder};
pub use track::{AudioSource, DecodedAudio, EncodedClip, LiveTrack, TrackFeed, live_track};
pub use window::{AudioWindow, WindowFeatures, Windower};
