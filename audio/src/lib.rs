// Parley VAD/ASR worker
// Consumes client mic PCM, gates it with VAD, produces partial/final
// transcripts and barge-in signals.

pub mod asr;
pub mod processor;
pub mod vad;
pub mod worker;

pub use asr::{AsrEngine, ScriptedAsr, WhisperCliAsr, WhisperConfig};
pub use processor::{AudioProcessor, ProcessorConfig, Signal};
pub use vad::{EnergyVad, VadEngine};
pub use worker::{AudioWorker, AudioWorkerConfig};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("ASR error: {0}")]
    AsrError(String),

    #[error("VAD error: {0}")]
    VadError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] parley_core::CoreError),
}
pub type Result<T> = std::result::Result<T, AudioError>;
