//! Speech recognition engines.
//!
//! The worker talks to ASR through [`AsrEngine`]; the production adapter
//! shells out to whisper.cpp over a temporary WAV, the scripted engine feeds
//! deterministic transcripts to tests.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use parley_core::pcm;
use tracing::{debug, warn};

use crate::{AudioError, Result};

/// Converts a PCM buffer into text. Called incrementally on a growing speech
/// buffer for partials, and once more at utterance end for the final.
#[async_trait]
pub trait AsrEngine: Send + Sync {
    async fn transcribe(&self, samples: &[i16], sample_rate: u32) -> Result<String>;
}

/// whisper.cpp CLI configuration.
#[derive(Clone, Debug)]
pub struct WhisperConfig {
    /// Path to the whisper.cpp executable.
    pub bin: PathBuf,
    /// Path to the ggml model file.
    pub model: PathBuf,
    /// Language code, or "auto".
    pub language: String,
    /// Directory for temporary WAV files.
    pub temp_dir: PathBuf,
    /// Extra CLI arguments (e.g. ["--threads", "4"]).
    pub extra_args: Vec<String>,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        let bin = std::env::var("PARLEY_WHISPER_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("whisper"));
        let model = std::env::var("PARLEY_WHISPER_MODEL")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("ggml-base.en.bin"));
        let language = std::env::var("PARLEY_WHISPER_LANG").unwrap_or_else(|_| "auto".into());
        let temp_dir = std::env::var("PARLEY_ASR_TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());
        let extra_args = std::env::var("PARLEY_WHISPER_EXTRA_ARGS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|a| a.trim().to_string())
                    .filter(|a| !a.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Self {
            bin,
            model,
            language,
            temp_dir,
            extra_args,
        }
    }
}

/// ASR adapter around the whisper.cpp CLI.
pub struct WhisperCliAsr {
    cfg: WhisperConfig,
}

impl WhisperCliAsr {
    pub fn new(cfg: WhisperConfig) -> Self {
        if !cfg.bin.exists() {
            warn!(target: "vad_asr", bin = ?cfg.bin, "whisper binary not found; transcription will fail until installed");
        }
        if !cfg.model.exists() {
            warn!(target: "vad_asr", model = ?cfg.model, "whisper model not found; transcription will fail until downloaded");
        }
        Self { cfg }
    }
}

#[async_trait]
impl AsrEngine for WhisperCliAsr {
    async fn transcribe(&self, samples: &[i16], sample_rate: u32) -> Result<String> {
        if samples.is_empty() {
            return Ok(String::new());
        }

        let wav_path = self.cfg.temp_dir.join(format!(
            "parley_utt_{}.wav",
            uuid_suffix()
        ));
        pcm::write_wav_file(&wav_path, samples, sample_rate, 1)?;

        let mut cmd = Command::new(&self.cfg.bin);
        cmd.arg("-m").arg(&self.cfg.model);
        cmd.arg("-f").arg(&wav_path);
        if !self.cfg.language.is_empty() && self.cfg.language != "auto" {
            cmd.arg("-l").arg(&self.cfg.language);
        }
        cmd.arg("--no-timestamps");
        cmd.arg("--no-prints");
        for arg in &self.cfg.extra_args {
            cmd.arg(arg);
        }
        debug!(target: "vad_asr", command = ?cmd, "running whisper");

        let output = tokio::task::spawn_blocking(move || cmd.output())
            .await
            .map_err(|e| AudioError::AsrError(format!("whisper task join: {e}")))?;

        let _ = std::fs::remove_file(&wav_path);

        let output = output.map_err(AudioError::IoError)?;
        if !output.status.success() {
            return Err(AudioError::AsrError(format!(
                "whisper exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let transcript = stdout
            .lines()
            .filter(|line| {
                !line.starts_with('[')
                    && !line.trim().is_empty()
                    && !line.contains("whisper_")
                    && !line.contains("load time")
                    && !line.contains("system_info")
            })
            .map(|line| line.trim())
            .collect::<Vec<_>>()
            .join(" ");
        Ok(transcript)
    }
}

fn uuid_suffix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{nanos:x}")
}

/// Deterministic engine for tests: replays a script of transcripts, then
/// repeats the last one. `failing()` always errors, exercising the
/// empty-final fallback path.
pub struct ScriptedAsr {
    script: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    fail: AtomicBool,
}

impl ScriptedAsr {
    pub fn new<I, S>(script: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(script.into_iter().map(Into::into).collect()),
            last: Mutex::new(String::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn failing() -> Self {
        let s = Self::new(Vec::<String>::new());
        s.fail.store(true, Ordering::SeqCst);
        s
    }
}

#[async_trait]
impl AsrEngine for ScriptedAsr {
    async fn transcribe(&self, _samples: &[i16], _sample_rate: u32) -> Result<String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AudioError::AsrError("scripted failure".into()));
        }
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        match script.pop_front() {
            Some(text) => {
                *self.last.lock().unwrap_or_else(|e| e.into_inner()) = text.clone();
                Ok(text)
            }
            None => Ok(self.last.lock().unwrap_or_else(|e| e.into_inner()).clone()),
        }
    }
}
