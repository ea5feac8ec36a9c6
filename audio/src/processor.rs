//! Per-conversation audio state machine.
//!
//! The processor is synchronous and allocation-light: it consumes 16 kHz
//! mono samples, runs the VAD per 30 ms frame and emits [`Signal`]s for the
//! worker to act on (transcriptions are performed by the worker so no lock is
//! held across an ASR call). Time is tracked on the audio clock — one frame
//! advances it by the frame duration — which keeps the debounce and cadence
//! logic deterministic.

use std::time::Instant;

use crate::vad::VadEngine;

/// Tunables for the speech state machine.
#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    /// Frame size in milliseconds fed to the VAD.
    pub frame_ms: u32,
    /// Input sample rate; the wire contract pins this at 16 kHz.
    pub sample_rate: u32,
    /// Consecutive voiced audio required to enter speech.
    pub min_start_ms: u32,
    /// Sustained silence that ends an utterance.
    pub silence_end_ms: u32,
    /// Minimum accumulated speech before the first partial.
    pub partial_min_speech_ms: u32,
    /// Cadence between partials.
    pub partial_interval_ms: u32,
    /// Voiced audio required before a barge-in may fire.
    pub bargein_min_speech_ms: u32,
    /// Minimum spacing between barge-in signals per conversation.
    pub bargein_debounce_ms: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            frame_ms: env_u32("PARLEY_VAD_FRAME_MS", 30),
            sample_rate: 16_000,
            min_start_ms: env_u32("PARLEY_VAD_MIN_START_MS", 90),
            silence_end_ms: env_u32("PARLEY_VAD_SILENCE_END_MS", 500),
            partial_min_speech_ms: env_u32("PARLEY_ASR_PARTIAL_MIN_MS", 300),
            partial_interval_ms: env_u32("PARLEY_ASR_PARTIAL_INTERVAL_MS", 500),
            bargein_min_speech_ms: env_u32("PARLEY_BARGEIN_MIN_SPEECH_MS", 150),
            bargein_debounce_ms: env_u32("PARLEY_BARGEIN_DEBOUNCE_MS", 1_000),
        }
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Work the processor asks of the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Speech detected while TTS is active for this conversation.
    BargeIn,
    /// Run ASR over the snapshot and publish a partial transcript.
    Partial(Vec<i16>),
    /// Run ASR over the finished utterance and publish the final transcript.
    Final(Vec<i16>),
}

/// Rolling state for one conversation's inbound audio.
pub struct AudioProcessor {
    cfg: ProcessorConfig,
    vad: Box<dyn VadEngine>,

    /// Carry-over for samples that do not fill a whole VAD frame.
    pending: Vec<i16>,
    /// Voiced lead-in retained from just before speech starts.
    pre_speech: Vec<i16>,

    in_speech: bool,
    /// Accumulated utterance samples while in speech.
    speech_buf: Vec<i16>,

    /// Audio-clock milliseconds processed so far.
    clock_ms: u64,
    consec_voiced_ms: u32,
    trailing_silence_ms: u32,
    speech_ms: u32,
    last_partial_clock_ms: u64,
    last_bargein_clock_ms: Option<u64>,

    /// Wall-clock activity marker for the idle reaper.
    pub last_activity: Instant,
    /// Consecutive ASR failures; the worker recycles the processor past a cap.
    pub asr_failures: u32,
}

impl AudioProcessor {
    pub fn new(cfg: ProcessorConfig, vad: Box<dyn VadEngine>) -> Self {
        Self {
            cfg,
            vad,
            pending: Vec::new(),
            pre_speech: Vec::new(),
            in_speech: false,
            speech_buf: Vec::new(),
            clock_ms: 0,
            consec_voiced_ms: 0,
            trailing_silence_ms: 0,
            speech_ms: 0,
            last_partial_clock_ms: 0,
            last_bargein_clock_ms: None,
            last_activity: Instant::now(),
            asr_failures: 0,
        }
    }

    fn frame_len(&self) -> usize {
        (self.cfg.sample_rate as usize * self.cfg.frame_ms as usize) / 1000
    }

    /// Feed inbound samples; `tts_active` reflects the `ttsActive:<id>` flag
    /// at ingest time. Returns the signals the worker must act on, in order.
    pub fn ingest(&mut self, samples: &[i16], tts_active: bool) -> Vec<Signal> {
        self.last_activity = Instant::now();
        if samples.is_empty() {
            return Vec::new();
        }

        self.pending.extend_from_slice(samples);
        let frame_len = self.frame_len();
        let mut signals = Vec::new();

        while self.pending.len() >= frame_len {
            let frame: Vec<i16> = self.pending.drain(..frame_len).collect();
            self.process_frame(&frame, tts_active, &mut signals);
        }
        signals
    }

    fn process_frame(&mut self, frame: &[i16], tts_active: bool, signals: &mut Vec<Signal>) {
        let voiced = self.vad.is_speech(frame);
        self.clock_ms += self.cfg.frame_ms as u64;

        if voiced {
            self.consec_voiced_ms += self.cfg.frame_ms;
            self.trailing_silence_ms = 0;
        } else {
            self.consec_voiced_ms = 0;
            if self.in_speech {
                self.trailing_silence_ms += self.cfg.frame_ms;
            }
        }

        // Barge-in gating: sustained voice while assistant audio is playing.
        if voiced
            && tts_active
            && self.consec_voiced_ms >= self.cfg.bargein_min_speech_ms
            && self
                .last_bargein_clock_ms
                .map(|t| self.clock_ms - t >= self.cfg.bargein_debounce_ms as u64)
                .unwrap_or(true)
        {
            self.last_bargein_clock_ms = Some(self.clock_ms);
            signals.push(Signal::BargeIn);
        }

        if !self.in_speech {
            if voiced {
                self.pre_speech.extend_from_slice(frame);
                // Keep only the lead-in we need to preserve utterance onset.
                let cap = self.frame_len() * 8;
                if self.pre_speech.len() > cap {
                    let excess = self.pre_speech.len() - cap;
                    self.pre_speech.drain(..excess);
                }
                if self.consec_voiced_ms >= self.cfg.min_start_ms {
                    self.in_speech = true;
                    self.speech_ms = self.consec_voiced_ms;
                    self.speech_buf = std::mem::take(&mut self.pre_speech);
                    self.last_partial_clock_ms = self.clock_ms;
                }
            } else {
                self.pre_speech.clear();
            }
            return;
        }

        // In speech: accumulate everything, brief silence included.
        self.speech_buf.extend_from_slice(frame);
        if voiced {
            self.speech_ms += self.cfg.frame_ms;
        }

        if self.trailing_silence_ms >= self.cfg.silence_end_ms {
            self.in_speech = false;
            self.speech_ms = 0;
            self.trailing_silence_ms = 0;
            self.pre_speech.clear();
            signals.push(Signal::Final(std::mem::take(&mut self.speech_buf)));
            return;
        }

        if self.speech_ms >= self.cfg.partial_min_speech_ms
            && self.clock_ms - self.last_partial_clock_ms >= self.cfg.partial_interval_ms as u64
        {
            self.last_partial_clock_ms = self.clock_ms;
            signals.push(Signal::Partial(self.speech_buf.clone()));
        }
    }

    /// Whether the processor is mid-utterance (used by tests and the reaper).
    pub fn in_speech(&self) -> bool {
        self.in_speech
    }
}
