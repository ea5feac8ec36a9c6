//! PCM helpers shared by the audio-facing workers.
//!
//! Everything operates on 16-bit signed little-endian samples, the one audio
//! format on the wire. The WAV reader/writer cover the narrow needs of the
//! CLI engine adapters (PCM16 RIFF only).

use std::io::Write;
use std::path::Path;

use crate::{CoreError, Result};

/// Decode little-endian PCM bytes into samples.
///
/// Odd-length input is a protocol violation and is rejected rather than
/// silently truncated.
pub fn bytes_to_samples(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(CoreError::AudioError(format!(
            "uneven PCM payload length: {} bytes",
            bytes.len()
        )));
    }
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        samples.push(i16::from_le_bytes([pair[0], pair[1]]));
    }
    Ok(samples)
}

/// Encode samples as little-endian PCM bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// Downmix interleaved multi-channel samples to mono by averaging.
pub fn downmix_to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let ch = channels as usize;
    let mut mono = Vec::with_capacity(samples.len() / ch);
    for frame in samples.chunks_exact(ch) {
        let mut acc: i32 = 0;
        for &s in frame {
            acc += s as i32;
        }
        mono.push((acc / ch as i32) as i16);
    }
    mono
}

/// Linear-interpolation resampler.
///
/// Good enough for speech at the rates involved here (22.05 k / 24 k ↔ 16 k);
/// identity when the rates already match.
pub fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }
    let out_len = ((samples.len() as u64 * to_rate as u64) / from_rate as u64) as usize;
    let mut out = Vec::with_capacity(out_len);
    let ratio = from_rate as f64 / to_rate as f64;
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos as usize;
        let frac = pos - idx as f64;
        let a = samples[idx.min(samples.len() - 1)] as f64;
        let b = samples[(idx + 1).min(samples.len() - 1)] as f64;
        out.push((a + (b - a) * frac) as i16);
    }
    out
}

/// Root-mean-square level of a frame, in sample units.
pub fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt()
}

/// Slice a byte buffer into chunks of at most `max_bytes`, preserving order.
/// The final chunk may be shorter; zero-length input yields no chunks.
pub fn slice_chunks(bytes: &[u8], max_bytes: usize) -> Vec<Vec<u8>> {
    if bytes.is_empty() || max_bytes == 0 {
        return Vec::new();
    }
    bytes.chunks(max_bytes).map(|c| c.to_vec()).collect()
}

/// Parsed PCM16 WAV content.
#[derive(Debug, Clone)]
pub struct WavAudio {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

/// Read a PCM16 RIFF/WAVE buffer (the output format of the CLI TTS engines).
pub fn read_wav(buf: &[u8]) -> Result<WavAudio> {
    if buf.len() < 44 || &buf[0..4] != b"RIFF" || &buf[8..12] != b"WAVE" {
        return Err(CoreError::AudioError("not a RIFF/WAVE buffer".into()));
    }

    let mut sample_rate = 0u32;
    let mut channels = 0u16;
    let mut bits_per_sample = 0u16;
    let mut data: Option<&[u8]> = None;

    let mut idx = 12;
    while idx + 8 <= buf.len() {
        let chunk_id = &buf[idx..idx + 4];
        let sz = u32::from_le_bytes([buf[idx + 4], buf[idx + 5], buf[idx + 6], buf[idx + 7]])
            as usize;
        let body_start = idx + 8;
        let body_end = (body_start + sz).min(buf.len());
        match chunk_id {
            b"fmt " => {
                let fmt = &buf[body_start..body_end];
                if fmt.len() < 16 {
                    return Err(CoreError::AudioError("truncated fmt chunk".into()));
                }
                channels = u16::from_le_bytes([fmt[2], fmt[3]]);
                sample_rate = u32::from_le_bytes([fmt[4], fmt[5], fmt[6], fmt[7]]);
                bits_per_sample = u16::from_le_bytes([fmt[14], fmt[15]]);
            }
            b"data" => {
                data = Some(&buf[body_start..body_end]);
            }
            _ => {}
        }
        // Chunks are word-aligned.
        idx = body_start + sz + (sz & 1);
    }

    let data = data.ok_or_else(|| CoreError::AudioError("WAV without data chunk".into()))?;
    if bits_per_sample != 16 {
        return Err(CoreError::AudioError(format!(
            "unsupported WAV bit depth: {bits_per_sample}"
        )));
    }
    if sample_rate == 0 || channels == 0 {
        return Err(CoreError::AudioError("WAV without fmt chunk".into()));
    }

    Ok(WavAudio {
        sample_rate,
        channels,
        samples: bytes_to_samples(&data[..data.len() - data.len() % 2])?,
    })
}

/// Write PCM samples to a WAV file (for the CLI ASR engine).
pub fn write_wav_file(
    path: &Path,
    samples: &[i16],
    sample_rate: u32,
    channels: u16,
) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;

    let bits_per_sample: u16 = 16;
    let byte_rate = sample_rate * channels as u32 * (bits_per_sample as u32 / 8);
    let block_align = channels * (bits_per_sample / 8);
    let data_size = (samples.len() * 2) as u32;
    let file_size = 36 + data_size;

    // RIFF header
    file.write_all(b"RIFF")?;
    file.write_all(&file_size.to_le_bytes())?;
    file.write_all(b"WAVE")?;

    // fmt subchunk
    file.write_all(b"fmt ")?;
    file.write_all(&16u32.to_le_bytes())?;
    file.write_all(&1u16.to_le_bytes())?;
    file.write_all(&channels.to_le_bytes())?;
    file.write_all(&sample_rate.to_le_bytes())?;
    file.write_all(&byte_rate.to_le_bytes())?;
    file.write_all(&block_align.to_le_bytes())?;
    file.write_all(&bits_per_sample.to_le_bytes())?;

    // data subchunk
    file.write_all(b"data")?;
    file.write_all(&data_size.to_le_bytes())?;
    file.write_all(&samples_to_bytes(samples))?;

    Ok(())
}
