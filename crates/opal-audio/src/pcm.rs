//! PCM codec helpers: quantize microphone floats for the wire, decode
//! returned payloads into playable buffers, rate/channel adaptation.

use opal_core::error::{OpalError, Result};
use opal_core::types::{AudioChunk, Blob};

/// A decoded, playable audio buffer. Mono f32 samples with a known duration.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    /// Duration in seconds, known before scheduling.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Quantize a block of linear PCM floats (-1.0..1.0) to 16-bit signed
/// little-endian bytes and tag it with the wire mime type.
///
/// Lossy but infallible; runs on every capture callback and must not block.
pub fn encode_chunk(samples: &[f32], sample_rate: u32) -> AudioChunk {
    let mut data = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let clamped = s.clamp(-1.0, 1.0);
        let q = (clamped * i16::MAX as f32) as i16;
        data.extend_from_slice(&q.to_le_bytes());
    }
    AudioChunk {
        data,
        mime_type: format!("audio/pcm;rate={sample_rate}"),
    }
}

/// Decode an inline audio payload (base64 16-bit LE PCM) into a playable
/// buffer. The rate is taken from the mime type when declared, falling back
/// to `default_rate`. Interleaved channels are downmixed to mono.
pub fn decode_payload(blob: &Blob, default_rate: u32, channels: u16) -> Result<AudioBuffer> {
    let bytes = blob.decode()?;
    if bytes.len() % 2 != 0 {
        return Err(OpalError::Audio(format!(
            "odd PCM payload length: {}",
            bytes.len()
        )));
    }

    let interleaved: Vec<f32> = bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / i16::MAX as f32)
        .collect();

    let samples = downmix_mono(&interleaved, channels as usize);
    let sample_rate = rate_from_mime(&blob.mime_type).unwrap_or(default_rate);

    Ok(AudioBuffer {
        samples,
        sample_rate,
    })
}

/// Parse the sample rate out of a `audio/pcm;rate=24000` style mime type.
pub fn rate_from_mime(mime: &str) -> Option<u32> {
    mime.split(';')
        .filter_map(|p| p.trim().strip_prefix("rate="))
        .find_map(|r| r.parse().ok())
}

/// Downmix interleaved multi-channel samples to mono by averaging frames.
pub fn downmix_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Linear-interpolation resampler for device-rate adaptation.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round() as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;
        let a = samples[idx.min(samples.len() - 1)];
        let b = samples[(idx + 1).min(samples.len() - 1)];
        out.push(a + (b - a) * frac);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_chunk_quantization() {
        let chunk = encode_chunk(&[0.0, 1.0, -1.0, 2.0], 16_000);
        assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
        let samples: Vec<i16> = chunk
            .data
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(samples[0], 0);
        assert_eq!(samples[1], i16::MAX);
        assert_eq!(samples[2], -i16::MAX);
        // Out-of-range input is clamped, never wrapped
        assert_eq!(samples[3], i16::MAX);
    }

    #[test]
    fn test_decode_payload_duration_known() {
        // 24000 samples at 24kHz = exactly 1 second
        let pcm: Vec<u8> = std::iter::repeat(1000i16)
            .take(24_000)
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let blob = Blob::from_bytes("audio/pcm;rate=24000", &pcm);
        let buffer = decode_payload(&blob, 16_000, 1).unwrap();
        assert_eq!(buffer.sample_rate, 24_000);
        assert!((buffer.duration() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_decode_payload_bad_base64() {
        let blob = Blob {
            mime_type: "audio/pcm".into(),
            data: "@@@".into(),
        };
        assert!(decode_payload(&blob, 24_000, 1).is_err());
    }

    #[test]
    fn test_decode_payload_odd_length() {
        let blob = Blob::from_bytes("audio/pcm;rate=24000", &[1, 2, 3]);
        assert!(decode_payload(&blob, 24_000, 1).is_err());
    }

    #[test]
    fn test_rate_from_mime() {
        assert_eq!(rate_from_mime("audio/pcm;rate=24000"), Some(24_000));
        assert_eq!(rate_from_mime("audio/pcm; rate=16000"), Some(16_000));
        assert_eq!(rate_from_mime("audio/pcm"), None);
    }

    #[test]
    fn test_downmix_stereo() {
        let stereo = [1.0, 0.0, 0.5, 0.5];
        assert_eq!(downmix_mono(&stereo, 2), vec![0.5, 0.5]);
    }

    #[test]
    fn test_resample_preserves_duration() {
        let input = vec![0.5f32; 48_000]; // 1s at 48kHz
        let out = resample_linear(&input, 48_000, 16_000);
        assert_eq!(out.len(), 16_000);
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_resample_identity() {
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_linear(&input, 16_000, 16_000), input);
    }
}
