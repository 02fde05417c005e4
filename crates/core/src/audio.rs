use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree};

/// Sample rate of PCM16 audio on the realtime transport, both directions.
pub const TRANSPORT_SAMPLE_RATE: u32 = 24_000;

/// Errors raised while decoding an inbound audio message.
#[derive(Debug, thiserror::Error)]
pub enum AudioDecodeError {
    #[error("audio payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("audio payload has an odd byte length ({0}); PCM16 needs whole samples")]
    OddLength(usize),
}

/// Decoded mono samples in `[-1, 1]` plus their rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Creates a mono resampler between two rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}

/// Encodes `[-1, 1]` samples as base64 little-endian PCM16.
pub fn encode_pcm16(samples: &[f32]) -> String {
    let bytes: Vec<u8> = samples
        .iter()
        .flat_map(|&sample| {
            let v = (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            v.to_le_bytes()
        })
        .collect();
    base64::engine::general_purpose::STANDARD.encode(&bytes)
}

/// Decodes a base64 PCM16 message into an `AudioFrame` at the transport rate.
pub fn decode_pcm16(base64_fragment: &str) -> Result<AudioFrame, AudioDecodeError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(base64_fragment)?;
    if bytes.len() % 2 != 0 {
        return Err(AudioDecodeError::OddLength(bytes.len()));
    }
    Ok(AudioFrame {
        samples: pcm16_le_to_f32(&bytes),
        sample_rate: TRANSPORT_SAMPLE_RATE,
    })
}

/// Converts raw little-endian PCM16 bytes (e.g. a binary socket frame) to floats.
/// A trailing odd byte is ignored.
pub fn pcm16_le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| {
            let v = i16::from_le_bytes([chunk[0], chunk[1]]);
            (v as f32 / 32768.0).clamp(-1.0, 1.0)
        })
        .collect()
}

/// Root-mean-square level of a block of samples.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let energy: f32 = samples.iter().map(|s| s * s).sum();
    (energy / samples.len() as f32).sqrt()
}
