//! Fixed-size windowing and per-window feature extraction.

/// A fixed-size slice of mono PCM, consumed once by the feature extractor.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioWindow {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub start_time_seconds: f64,
}

impl AudioWindow {
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Re-chunks arbitrarily sized frames into windows of exactly `window_size` samples.
pub struct Windower {
    window_size: usize,
    sample_rate: u32,
    accum: Vec<f32>,
    emitted_samples: u64,
}

impl Windower {
    pub fn new(window_size: usize, sample_rate: u32) -> Self {
        let window_size = window_size.max(1);
        Self {
            window_size,
            sample_rate,
            accum: Vec::with_capacity(window_size * 2),
            emitted_samples: 0,
        }
    }

    pub fn push(&mut self, frame: &[f32]) {
        self.accum.extend_from_slice(frame);
    }

    /// Pops the next complete window, if one has accumulated.
    pub fn next_window(&mut self) -> Option<AudioWindow> {
        if self.accum.len() < self.window_size {
            return None;
        }
        let samples: Vec<f32> = self.accum.drain(..self.window_size).collect();
        let start_time_seconds = if self.sample_rate == 0 {
            0.0
        } else {
            self.emitted_samples as f64 / self.sample_rate as f64
        };
        self.emitted_samples += self.window_size as u64;
        Some(AudioWindow {
            samples,
            sample_rate: self.sample_rate,
            start_time_seconds,
        })
    }

    /// Samples waiting for a complete window.
    pub fn buffered(&self) -> usize {
        self.accum.len()
    }
}

/// Timing and amplitude features of one window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowFeatures {
    pub rms: f32,
    pub peak: f32,
    /// Sign changes per sample, in `[0, 1]`
    pub zero_crossing_rate: f32,
    pub sample_rate: u32,
    pub start_time_seconds: f64,
    pub duration_seconds: f64,
}

impl WindowFeatures {
    pub fn extract(window: &AudioWindow) -> Self {
        Self::from_samples(&window.samples, window.sample_rate, window.start_time_seconds)
    }

    pub fn from_samples(samples: &[f32], sample_rate: u32, start_time_seconds: f64) -> Self {
        let (rms, peak, zero_crossing_rate) = amplitude_stats(samples);
        let duration_seconds = if sample_rate == 0 {
            0.0
        } else {
            samples.len() as f64 / sample_rate as f64
        };
        Self {
            rms,
            peak,
            zero_crossing_rate,
            sample_rate,
            start_time_seconds,
            duration_seconds,
        }
    }

    pub fn end_time_seconds(&self) -> f64 {
        self.start_time_seconds + self.duration_seconds
    }
}

/// Returns `(rms, peak, zero_crossing_rate)`.
pub(crate) fn amplitude_stats(samples: &[f32]) -> (f32, f32, f32) {
    if samples.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let mut sum_sq = 0.0f64;
    let mut peak = 0.0f32;
    let mut crossings = 0usize;
    for (i, s) in samples.iter().enumerate() {
        sum_sq += (*s as f64) * (*s as f64);
        peak = peak.max(s.abs());
        if i > 0 && (samples[i - 1] >= 0.0) != (*s >= 0.0) {
            crossings += 1;
        }
    }
    let rms = (sum_sq / samples.len() as f64).sqrt() as f32;
    let zcr = if samples.len() > 1 {
        crossings as f32 / (samples.len() - 1) as f32
    } else {
        0.0
    };
    (rms, peak, zcr)
}
