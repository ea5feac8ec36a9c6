// Parley TTS worker
// Synthesizes sentence requests into per-conversation audio streams with
// cancellable, strictly ordered playback.

pub mod engine;
pub mod worker;

pub use engine::{PiperCliTts, PiperConfig, SynthStream, ToneConfig, ToneSynthesizer, TtsEngine};
pub use worker::{TtsWorker, TtsWorkerConfig};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TtsError {
    #[error("Engine error: {0}")]
    EngineError(String),

    #[error("Synthesis timed out")]
    Timeout,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] parley_core::CoreError),
}
pub type Result<T> = std::result::Result<T, TtsError>;
