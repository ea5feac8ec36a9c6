use std::sync::Arc;
use std::time::Duration;

use parley_core::broker::{Broker, Payload, QosLevel};
use parley_core::kv::{keys, TtlStore};
use parley_core::messages::WireMessage;
use parley_core::{now_ms, pcm, topics, ConversationMap};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::asr::AsrEngine;
use crate::processor::{AudioProcessor, ProcessorConfig, Signal};
use crate::vad::VadEngine;
use crate::Result;

/// VAD/ASR worker configuration.
#[derive(Clone, Debug)]
pub struct AudioWorkerConfig {
    pub processor: ProcessorConfig,
    /// Reap processors idle longer than this.
    pub idle_timeout: Duration,
    /// Cadence of the idle sweep.
    pub sweep_interval: Duration,
    /// Recycle a processor after this many consecutive ASR failures.
    pub max_asr_failures: u32,
}

impl Default for AudioWorkerConfig {
    fn default() -> Self {
        let idle_secs = std::env::var("PARLEY_AUDIO_IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300u64);
        Self {
            processor: ProcessorConfig::default(),
            idle_timeout: Duration::from_secs(idle_secs),
            sweep_interval: Duration::from_secs(60),
            max_asr_failures: 3,
        }
    }
}

type VadFactory = dyn Fn() -> Box<dyn VadEngine> + Send + Sync;

/// The VAD/ASR worker: consumes mic PCM per conversation, publishes partial
/// and final transcripts, and raises barge-in signals while TTS is active.
pub struct AudioWorker {
    broker: Arc<Broker>,
    store: Arc<TtlStore>,
    asr: Arc<dyn AsrEngine>,
    vad_factory: Arc<VadFactory>,
    cfg: AudioWorkerConfig,
}

impl AudioWorker {
    pub fn new(
        broker: Arc<Broker>,
        store: Arc<TtlStore>,
        asr: Arc<dyn AsrEngine>,
        vad_factory: impl Fn() -> Box<dyn VadEngine> + Send + Sync + 'static,
        cfg: AudioWorkerConfig,
    ) -> Self {
        Self {
            broker,
            store,
            asr,
            vad_factory: Arc::new(vad_factory),
            cfg,
        }
    }

    pub async fn start(self) -> Result<JoinHandle<()>> {
        let handle = tokio::spawn(async move {
            if let Err(e) = run_worker(self).await {
                error!(target: "vad_asr", error = %e, "audio worker stopped");
            }
        });
        Ok(handle)
    }
}

async fn run_worker(worker: AudioWorker) -> Result<()> {
    let AudioWorker {
        broker,
        store,
        asr,
        vad_factory,
        cfg,
    } = worker;

    let mut audio_sub = broker.subscribe(topics::AUDIO_IN, QosLevel::Realtime);
    let mut conn_sub = broker.subscribe(topics::CONNECTION_EVENTS, QosLevel::Batched);
    let processors: Arc<ConversationMap<Mutex<AudioProcessor>>> = Arc::new(ConversationMap::new());
    let mut sweep = tokio::time::interval(cfg.sweep_interval);

    info!(target: "vad_asr", "audio worker started");

    loop {
        tokio::select! {
            payload = audio_sub.recv() => {
                let Some(payload) = payload else { break };
                let Payload::Audio(frame) = payload else { continue };
                if frame.pcm.is_empty() {
                    continue;
                }
                let samples = match pcm::bytes_to_samples(&frame.pcm) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(target: "vad_asr", conversation = %frame.conversation_id, error = %e, "skipping malformed audio payload");
                        continue;
                    }
                };

                let id = frame.conversation_id.clone();
                let processor = processors.get_or_create(&id, || {
                    debug!(target: "vad_asr", conversation = %id, "creating audio processor");
                    Mutex::new(AudioProcessor::new(cfg.processor.clone(), vad_factory()))
                });

                let tts_active = store.exists(&keys::tts_active(&id));
                let signals = {
                    let mut guard = processor.lock().await;
                    guard.ingest(&samples, tts_active)
                };
                // ASR and publishes happen outside the processor lock.
                for signal in signals {
                    handle_signal(&broker, &asr, &processors, &cfg, &id, signal).await;
                }
            }

            payload = conn_sub.recv() => {
                let Some(payload) = payload else { break };
                if let Payload::Control(WireMessage::ConnectionEvent { conversation_id, .. }) = payload {
                    if processors.remove(&conversation_id).is_some() {
                        info!(target: "vad_asr", conversation = %conversation_id, "released audio processor on disconnect");
                    }
                }
            }

            _ = sweep.tick() => {
                let stale = processors.ids_where(|p| {
                    p.try_lock()
                        .map(|g| g.last_activity.elapsed() >= cfg.idle_timeout)
                        .unwrap_or(false)
                });
                for id in stale {
                    processors.remove(&id);
                    info!(target: "vad_asr", conversation = %id, "reaped idle audio processor");
                }
            }
        }
    }

    Ok(())
}

async fn handle_signal(
    broker: &Arc<Broker>,
    asr: &Arc<dyn AsrEngine>,
    processors: &Arc<ConversationMap<Mutex<AudioProcessor>>>,
    cfg: &AudioWorkerConfig,
    conversation_id: &str,
    signal: Signal,
) {
    match signal {
        Signal::BargeIn => {
            info!(target: "vad_asr", conversation = %conversation_id, "speech over active TTS: raising barge-in");
            let msg = WireMessage::BargeInNotification {
                conversation_id: conversation_id.to_string(),
                timestamp_ms: now_ms(),
            };
            if let Err(e) = broker.publish(topics::BARGE_IN, Payload::Control(msg)).await {
                warn!(target: "vad_asr", error = %e, "failed to publish barge-in");
            }
        }
        Signal::Partial(samples) => {
            match asr.transcribe(&samples, 16_000).await {
                Ok(text) if !text.is_empty() => {
                    note_asr_outcome(processors, conversation_id, cfg, true).await;
                    let msg = WireMessage::PartialTranscript {
                        conversation_id: conversation_id.to_string(),
                        transcript: text,
                        timestamp_ms: now_ms(),
                    };
                    if let Err(e) = broker.publish(topics::TRANSCRIPT, Payload::Control(msg)).await {
                        warn!(target: "vad_asr", error = %e, "failed to publish partial transcript");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    // Partials are best-effort; drop and count the failure.
                    warn!(target: "vad_asr", conversation = %conversation_id, error = %e, "partial transcription failed");
                    note_asr_outcome(processors, conversation_id, cfg, false).await;
                }
            }
        }
        Signal::Final(samples) => {
            // A transient ASR error still yields a (possibly empty) final so
            // downstream consumers see the utterance boundary.
            let text = match asr.transcribe(&samples, 16_000).await {
                Ok(text) => {
                    note_asr_outcome(processors, conversation_id, cfg, true).await;
                    text
                }
                Err(e) => {
                    warn!(target: "vad_asr", conversation = %conversation_id, error = %e, "final transcription failed; emitting empty transcript");
                    note_asr_outcome(processors, conversation_id, cfg, false).await;
                    String::new()
                }
            };
            let msg = WireMessage::FinalTranscript {
                conversation_id: conversation_id.to_string(),
                transcript: text,
                timestamp_ms: now_ms(),
            };
            if let Err(e) = broker.publish(topics::TRANSCRIPT, Payload::Control(msg)).await {
                warn!(target: "vad_asr", error = %e, "failed to publish final transcript");
            }
        }
    }
}

async fn note_asr_outcome(
    processors: &Arc<ConversationMap<Mutex<AudioProcessor>>>,
    conversation_id: &str,
    cfg: &AudioWorkerConfig,
    ok: bool,
) {
    let Some(processor) = processors.get(conversation_id) else {
        return;
    };
    let failures = {
        let mut guard = processor.lock().await;
        if ok {
            guard.asr_failures = 0;
            0
        } else {
            guard.asr_failures += 1;
            guard.asr_failures
        }
    };
    if failures >= cfg.max_asr_failures {
        warn!(target: "vad_asr", conversation = %conversation_id, failures, "recycling audio processor after repeated ASR failures");
        processors.remove(conversation_id);
    }
}
