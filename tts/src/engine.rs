//! Speech synthesis engines.
//!
//! The worker consumes a [`SynthStream`] of PCM chunks at whatever rate the
//! engine produces natively and resamples before publishing. The production
//! adapter shells out to Piper; the tone engine produces deterministic sine
//! bursts for tests and audio-path bring-up.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Result, TtsError};

/// A running synthesis: the engine's native sample rate plus a stream of
/// mono PCM chunks. An `Err` item ends the stream.
pub struct SynthStream {
    pub sample_rate: u32,
    pub chunks: mpsc::Receiver<Result<Vec<i16>>>,
}

/// Streaming synthesis contract. Implementations stop promptly when the
/// cancellation token fires and close the channel when done.
#[async_trait]
pub trait TtsEngine: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        cancel: CancellationToken,
    ) -> Result<SynthStream>;
}

/// Piper CLI configuration.
#[derive(Clone, Debug)]
pub struct PiperConfig {
    pub bin: Option<PathBuf>,
    /// Voice model used when the request names none.
    pub default_voice: Option<PathBuf>,
    /// Directory searched when a request names a bare voice id.
    pub voice_dir: Option<PathBuf>,
    pub temp_dir: PathBuf,
    /// Samples per chunk pushed into the stream.
    pub chunk_samples: usize,
}

impl Default for PiperConfig {
    fn default() -> Self {
        Self {
            bin: get_from_env_or_path("PARLEY_PIPER_BIN", "piper"),
            default_voice: std::env::var("PARLEY_PIPER_VOICE").ok().map(PathBuf::from),
            voice_dir: std::env::var("PARLEY_PIPER_VOICE_DIR").ok().map(PathBuf::from),
            temp_dir: std::env::var("PARLEY_TTS_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir()),
            chunk_samples: 4096,
        }
    }
}

fn get_from_env_or_path(env_key: &str, default_bin: &str) -> Option<PathBuf> {
    if let Ok(p) = std::env::var(env_key) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return Some(pb);
        }
    }
    get_from_path(default_bin)
}

fn get_from_path(bin: &str) -> Option<PathBuf> {
    if bin.contains(std::path::MAIN_SEPARATOR) {
        let p = PathBuf::from(bin);
        return if p.exists() { Some(p) } else { None };
    }
    if let Ok(paths) = std::env::var("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = Path::new(&dir).join(bin);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }
    None
}

/// TTS adapter around the Piper CLI. Synthesis runs to a temporary WAV and
/// the result is streamed out in chunks; per-sentence texts are short enough
/// that this stays well inside the latency budget.
pub struct PiperCliTts {
    cfg: PiperConfig,
}

impl PiperCliTts {
    pub fn new(cfg: PiperConfig) -> Self {
        match &cfg.bin {
            Some(bin) => info!(target: "tts", bin = ?bin, "detected piper binary"),
            None => warn!(target: "tts", "piper binary not found; synthesis will fail until installed"),
        }
        Self { cfg }
    }

    fn resolve_voice(&self, voice: &str) -> Option<PathBuf> {
        if !voice.is_empty() && voice != "default" {
            let direct = PathBuf::from(voice);
            if direct.exists() {
                return Some(direct);
            }
            if let Some(dir) = &self.cfg.voice_dir {
                let candidate = dir.join(voice);
                if candidate.exists() {
                    return Some(candidate);
                }
                let with_ext = dir.join(format!("{voice}.onnx"));
                if with_ext.exists() {
                    return Some(with_ext);
                }
            }
        }
        self.cfg.default_voice.clone()
    }
}

#[async_trait]
impl TtsEngine for PiperCliTts {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        cancel: CancellationToken,
    ) -> Result<SynthStream> {
        let bin = self
            .cfg
            .bin
            .clone()
            .ok_or_else(|| TtsError::EngineError("piper binary not found".into()))?;
        let voice_path = self
            .resolve_voice(voice)
            .ok_or_else(|| TtsError::EngineError(format!("no voice model for '{voice}'")))?;

        let wav_path = self.cfg.temp_dir.join(format!("parley_tts_{}.wav", nanos_id()));
        let text = text.to_string();
        let wav_path_for_cmd = wav_path.clone();

        let output = tokio::task::spawn_blocking(move || {
            let mut cmd = Command::new(&bin);
            cmd.arg("-m").arg(&voice_path);
            cmd.arg("-f").arg(&wav_path_for_cmd);
            cmd.stdin(Stdio::piped());
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
            debug!(target: "tts", command = ?cmd, "running piper");

            let mut child = cmd.spawn()?;
            if let Some(mut stdin) = child.stdin.take() {
                use std::io::Write;
                stdin.write_all(text.as_bytes())?;
            }
            child.wait_with_output()
        })
        .await
        .map_err(|e| TtsError::EngineError(format!("piper task join: {e}")))?
        .map_err(TtsError::IoError)?;

        if !output.status.success() {
            let _ = std::fs::remove_file(&wav_path);
            return Err(TtsError::EngineError(format!(
                "piper exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let buf = std::fs::read(&wav_path)?;
        let _ = std::fs::remove_file(&wav_path);
        let wav = parley_core::pcm::read_wav(&buf)?;
        let samples = parley_core::pcm::downmix_to_mono(&wav.samples, wav.channels);

        let (tx, rx) = mpsc::channel(16);
        let chunk_samples = self.cfg.chunk_samples;
        tokio::spawn(async move {
            for chunk in samples.chunks(chunk_samples) {
                if cancel.is_cancelled() {
                    return;
                }
                if tx.send(Ok(chunk.to_vec())).await.is_err() {
                    return;
                }
            }
        });

        Ok(SynthStream {
            sample_rate: wav.sample_rate,
            chunks: rx,
        })
    }
}

fn nanos_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{nanos:x}")
}

/// Deterministic tone generator used by tests and audio-path bring-up.
#[derive(Clone, Debug)]
pub struct ToneConfig {
    /// Native rate; deliberately not 16 kHz so the worker's resampling path
    /// is exercised.
    pub sample_rate: u32,
    /// Synthesized audio length per character of input text.
    pub ms_per_char: u32,
    pub chunk_samples: usize,
    /// Pause between chunks, giving cancellation a window mid-stream.
    pub chunk_delay: Duration,
    /// Fail with an engine error after this many chunks.
    pub fail_after_chunks: Option<usize>,
}

impl Default for ToneConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22_050,
            ms_per_char: 20,
            chunk_samples: 2_048,
            chunk_delay: Duration::from_millis(0),
            fail_after_chunks: None,
        }
    }
}

pub struct ToneSynthesizer {
    cfg: ToneConfig,
}

impl ToneSynthesizer {
    pub fn new(cfg: ToneConfig) -> Self {
        Self { cfg }
    }
}

impl Default for ToneSynthesizer {
    fn default() -> Self {
        Self::new(ToneConfig::default())
    }
}

#[async_trait]
impl TtsEngine for ToneSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        _voice: &str,
        cancel: CancellationToken,
    ) -> Result<SynthStream> {
        let cfg = self.cfg.clone();
        let ms = (text.chars().count() as u32 * cfg.ms_per_char).max(100);
        let total_samples = (cfg.sample_rate as u64 * ms as u64 / 1000) as usize;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut sent = 0usize;
            let mut chunk_index = 0usize;
            while sent < total_samples {
                if cancel.is_cancelled() {
                    return;
                }
                if let Some(limit) = cfg.fail_after_chunks {
                    if chunk_index >= limit {
                        let _ = tx
                            .send(Err(TtsError::EngineError("scripted engine failure".into())))
                            .await;
                        return;
                    }
                }
                let n = cfg.chunk_samples.min(total_samples - sent);
                let chunk: Vec<i16> = (0..n)
                    .map(|i| {
                        let t = (sent + i) as f64 / cfg.sample_rate as f64;
                        ((t * 440.0 * 2.0 * std::f64::consts::PI).sin() * 9_000.0) as i16
                    })
                    .collect();
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
                sent += n;
                chunk_index += 1;
                if !cfg.chunk_delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(cfg.chunk_delay) => {}
                    }
                }
            }
        });

        Ok(SynthStream {
            sample_rate: cfg.sample_rate,
            chunks: rx,
        })
    }
}
