//! Generic stream decoder trait for multi-format audio input.

use std::io::Cursor;

use anyhow::{Result, bail};

/// Encoding of a buffered clip or of a transport's audio frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipFormat {
    /// RIFF/WAVE container, any PCM or float layout
    Wav,
    /// Headerless little-endian signed 16-bit mono PCM
    Pcm16 { sample_rate: u32 },
}

/// A trait for audio decoders that convert encoded bytes into mono f32
/// PCM samples in `[-1.0, 1.0]`.
///
/// Implementations handle format-specific decoding and channel down-mixing
/// internally.
pub trait StreamDecoder: Send {
    /// Decode encoded audio bytes into mono f32 samples.
    fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>>;

    /// Sample rate of the samples returned by the last `decode` call.
    fn sample_rate(&self) -> u32;
}

/// Factory function: create a decoder for the given format.
pub fn create_decoder(format: ClipFormat) -> Box<dyn StreamDecoder> {
    match format {
        ClipFormat::Wav => Box::new(WavDecoder::default()),
        ClipFormat::Pcm16 { sample_rate } => Box::new(Pcm16Decoder::new(sample_rate)),
    }
}

/// Decoder for raw PCM16LE frames. Keeps a dangling odd byte between calls
/// so frames split mid-sample still decode correctly.
pub struct Pcm16Decoder {
    sample_rate: u32,
    carry: Option<u8>,
}

impl Pcm16Decoder {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            carry: None,
        }
    }
}

impl StreamDecoder for Pcm16Decoder {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>> {
        if self.sample_rate == 0 {
            bail!("PCM16 sample rate must be non-zero");
        }

        let mut bytes = Vec::with_capacity(data.len() + 1);
        if let Some(b) = self.carry.take() {
            bytes.push(b);
        }
        bytes.extend_from_slice(data);

        if bytes.len() % 2 == 1 {
            self.carry = bytes.pop();
        }

        Ok(bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
            .collect())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Decoder for complete WAV files, mixing every channel down to mono.
#[derive(Default)]
pub struct WavDecoder {
    sample_rate: u32,
}

impl StreamDecoder for WavDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>> {
        let reader = hound::WavReader::new(Cursor::new(data))?;
        let spec = reader.spec();
        if spec.channels == 0 || spec.sample_rate == 0 {
            bail!("invalid WAV header: {} channels at {}Hz", spec.channels, spec.sample_rate);
        }

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<Vec<_>, _>>()?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<Vec<_>, _>>()?
            }
        };

        self.sample_rate = spec.sample_rate;

        let channels = spec.channels as usize;
        if channels == 1 {
            return Ok(interleaved);
        }
        Ok(interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn wav_bytes(samples: &[i16], channels: u16, sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for s in samples {
                writer.write_sample(*s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn pcm16_handles_split_samples() {
        let mut decoder = Pcm16Decoder::new(16000);
        let bytes = 16384i16.to_le_bytes();

        let first = decoder.decode(&[0, 0, bytes[0]]).unwrap();
        assert_eq!(first, vec![0.0]);

        let second = decoder.decode(&[bytes[1]]).unwrap();
        assert_eq!(second, vec![0.5]);
    }

    #[test]
    fn wav_stereo_is_mixed_to_mono() {
        let data = wav_bytes(&[16384, 0, -16384, -16384], 2, 22050);
        let mut decoder = create_decoder(ClipFormat::Wav);

        let samples = decoder.decode(&data).unwrap();
        assert_eq!(decoder.sample_rate(), 22050);
        assert_eq!(samples, vec![0.25, -0.5]);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let mut decoder = WavDecoder::default();
        assert!(decoder.decode(b"definitely not a wav file").is_err());
    }
}
