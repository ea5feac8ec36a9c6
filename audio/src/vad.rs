//! Voice activity detection.
//!
//! The worker only needs a yes/no per 30 ms frame (16 kHz mono). The default
//! engine is energy-based with an adaptive noise floor; the `vad` feature
//! adds a WebRTC-backed engine.

use parley_core::pcm;

/// Labels one frame of 16 kHz mono PCM as speech or non-speech.
pub trait VadEngine: Send {
    fn is_speech(&mut self, frame: &[i16]) -> bool;
}

/// Energy-based VAD with an adaptive noise floor.
///
/// A frame is speech when its RMS exceeds both an absolute minimum and a
/// multiple of the tracked floor. The floor falls quickly and rises slowly,
/// so steady background noise is absorbed without short utterances deafening
/// the detector.
pub struct EnergyVad {
    noise_floor: f64,
    min_level: f64,
    ratio: f64,
}

impl EnergyVad {
    pub fn new() -> Self {
        Self {
            noise_floor: 150.0,
            min_level: 500.0,
            ratio: 3.0,
        }
    }

    pub fn with_sensitivity(min_level: f64, ratio: f64) -> Self {
        Self {
            noise_floor: min_level * 0.3,
            min_level,
            ratio,
        }
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new()
    }
}

impl VadEngine for EnergyVad {
    fn is_speech(&mut self, frame: &[i16]) -> bool {
        if frame.is_empty() {
            return false;
        }
        let level = pcm::rms(frame);
        let speech = level > self.min_level && level > self.noise_floor * self.ratio;
        if level < self.noise_floor {
            self.noise_floor = self.noise_floor * 0.9 + level * 0.1;
        } else {
            self.noise_floor = (self.noise_floor * 1.008).min(level.max(1.0));
        }
        speech
    }
}

#[cfg(feature = "vad")]
pub use webrtc::WebrtcVadEngine;

#[cfg(feature = "vad")]
mod webrtc {
    use super::VadEngine;

    /// WebRTC VAD wrapper.
    ///
    /// The underlying detector is not `Send`, so it is rebuilt per call;
    /// construction is cheap relative to a 30 ms frame budget.
    pub struct WebrtcVadEngine {
        mode: i32,
    }

    impl WebrtcVadEngine {
        /// `mode` 0..=3, higher is stricter about what counts as speech.
        pub fn new(mode: i32) -> Self {
            Self {
                mode: mode.clamp(0, 3),
            }
        }
    }

    impl VadEngine for WebrtcVadEngine {
        fn is_speech(&mut self, frame: &[i16]) -> bool {
            use webrtc_vad::{SampleRate, Vad, VadMode};

            let mut vad = Vad::new();
            vad.set_mode(match self.mode {
                0 => VadMode::Quality,
                1 => VadMode::LowBitrate,
                2 => VadMode::Aggressive,
                _ => VadMode::VeryAggressive,
            });
            let _ = vad.set_sample_rate(SampleRate::Rate16kHz);
            vad.is_voice_segment(frame).unwrap_or(false)
        }
    }
}
