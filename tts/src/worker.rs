use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parley_core::broker::{Broker, Payload, QosLevel};
use parley_core::kv::{keys, TtlStore};
use parley_core::messages::{AudioFrame, WireMessage};
use parley_core::{pcm, topics, ConversationMap};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::TtsEngine;
use crate::Result;

/// TTS worker configuration.
#[derive(Clone, Debug)]
pub struct TtsWorkerConfig {
    /// Client-facing rate; engine output is resampled to this.
    pub output_sample_rate: u32,
    /// Upper bound per published binary chunk.
    pub chunk_bytes: usize,
    /// Per-sentence synthesis budget.
    pub sentence_timeout: Duration,
    /// Cadence for refreshing the ttsActive flag mid-stream.
    pub flag_refresh: Duration,
}

impl Default for TtsWorkerConfig {
    fn default() -> Self {
        Self {
            output_sample_rate: 16_000,
            chunk_bytes: 4_096,
            sentence_timeout: Duration::from_secs(
                std::env::var("PARLEY_TTS_SENTENCE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
            flag_refresh: Duration::from_secs(10),
        }
    }
}

/// Queued sentence, in arrival (= sequence) order.
struct QueuedSentence {
    text: String,
    voice_id: String,
    sequence_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaybackState {
    Idle,
    Synthesizing,
}

/// Per-conversation playback: FIFO queue plus one active synthesis task.
/// All transitions happen under this struct's mutex.
struct Playback {
    queue: VecDeque<QueuedSentence>,
    state: PlaybackState,
    cancel: CancellationToken,
}

impl Playback {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            state: PlaybackState::Idle,
            cancel: CancellationToken::new(),
        }
    }
}

type Playbacks = Arc<ConversationMap<Mutex<Playback>>>;

/// How one sentence ended.
enum SentenceEnd {
    Natural,
    Interrupted,
    Failed,
}

/// The TTS worker: consumes sentence requests and produces per-conversation
/// audio streams; stop commands, barge-in and disconnects cancel within one
/// chunk boundary.
pub struct TtsWorker {
    broker: Arc<Broker>,
    store: Arc<TtlStore>,
    engine: Arc<dyn TtsEngine>,
    cfg: TtsWorkerConfig,
}

impl TtsWorker {
    pub fn new(
        broker: Arc<Broker>,
        store: Arc<TtlStore>,
        engine: Arc<dyn TtsEngine>,
        cfg: TtsWorkerConfig,
    ) -> Self {
        Self {
            broker,
            store,
            engine,
            cfg,
        }
    }

    pub async fn start(self) -> Result<JoinHandle<()>> {
        let handle = tokio::spawn(async move {
            if let Err(e) = run_worker(self).await {
                error!(target: "tts", error = %e, "tts worker stopped");
            }
        });
        Ok(handle)
    }
}

async fn run_worker(worker: TtsWorker) -> Result<()> {
    let TtsWorker {
        broker,
        store,
        engine,
        cfg,
    } = worker;

    let mut requests = broker.subscribe(topics::TTS_REQUEST, QosLevel::Batched);
    let mut control = broker.subscribe(topics::TTS_CONTROL, QosLevel::Batched);
    let mut barge_ins = broker.subscribe(topics::BARGE_IN, QosLevel::Batched);
    let mut conn_events = broker.subscribe(topics::CONNECTION_EVENTS, QosLevel::Batched);

    let playbacks: Playbacks = Arc::new(ConversationMap::new());

    info!(target: "tts", "tts worker started");

    loop {
        tokio::select! {
            payload = requests.recv() => {
                let Some(payload) = payload else { break };
                if let Payload::Control(WireMessage::SentenceRequest {
                    conversation_id, text, voice_id, sequence_number,
                }) = payload {
                    enqueue_sentence(
                        &broker, &store, &engine, &cfg, &playbacks,
                        conversation_id,
                        QueuedSentence { text, voice_id, sequence_number },
                    ).await;
                }
            }

            payload = control.recv() => {
                let Some(payload) = payload else { break };
                if let Payload::Control(WireMessage::TtsControl { conversation_id, .. }) = payload {
                    cancel_conversation(&playbacks, &conversation_id, "stop command").await;
                }
            }

            payload = barge_ins.recv() => {
                let Some(payload) = payload else { break };
                if let Payload::Control(WireMessage::BargeInNotification { conversation_id, .. }) = payload {
                    cancel_conversation(&playbacks, &conversation_id, "barge-in").await;
                }
            }

            payload = conn_events.recv() => {
                let Some(payload) = payload else { break };
                if let Payload::Control(WireMessage::ConnectionEvent { conversation_id, .. }) = payload {
                    cancel_conversation(&playbacks, &conversation_id, "disconnect").await;
                    playbacks.remove(&conversation_id);
                    store.delete(&keys::tts_active(&conversation_id));
                }
            }
        }
    }

    Ok(())
}

/// Queue a sentence; if the conversation is idle, start its playback task.
async fn enqueue_sentence(
    broker: &Arc<Broker>,
    store: &Arc<TtlStore>,
    engine: &Arc<dyn TtsEngine>,
    cfg: &TtsWorkerConfig,
    playbacks: &Playbacks,
    conversation_id: String,
    sentence: QueuedSentence,
) {
    let playback = playbacks.get_or_create(&conversation_id, || Mutex::new(Playback::new()));
    let start_task = {
        let mut guard = playback.lock().await;
        debug!(
            target: "tts",
            conversation = %conversation_id,
            seq = sentence.sequence_number,
            "queued sentence"
        );
        guard.queue.push_back(sentence);
        if guard.state == PlaybackState::Idle {
            guard.state = PlaybackState::Synthesizing;
            guard.cancel = CancellationToken::new();
            Some(guard.cancel.clone())
        } else {
            None
        }
    };

    if let Some(cancel) = start_task {
        let ctx = PlaybackContext {
            broker: Arc::clone(broker),
            store: Arc::clone(store),
            engine: Arc::clone(engine),
            cfg: cfg.clone(),
            playback: Arc::clone(&playback),
            conversation_id,
        };
        tokio::spawn(run_playback(ctx, cancel));
    }
}

/// Cancel active synthesis and flush the queue. Idempotent.
async fn cancel_conversation(playbacks: &Playbacks, conversation_id: &str, why: &str) {
    let Some(playback) = playbacks.get(conversation_id) else {
        return;
    };
    let mut guard = playback.lock().await;
    let had_work = !guard.queue.is_empty() || guard.state == PlaybackState::Synthesizing;
    guard.queue.clear();
    guard.cancel.cancel();
    if had_work {
        info!(target: "tts", conversation = %conversation_id, reason = %why, "cancelled synthesis");
    }
}

struct PlaybackContext {
    broker: Arc<Broker>,
    store: Arc<TtlStore>,
    engine: Arc<dyn TtsEngine>,
    cfg: TtsWorkerConfig,
    playback: Arc<Mutex<Playback>>,
    conversation_id: String,
}

impl PlaybackContext {
    fn topic(&self) -> String {
        topics::audio_output_stream(&self.conversation_id)
    }

    async fn publish_envelope(&self, msg: WireMessage) {
        if let Err(e) = self.broker.publish(&self.topic(), Payload::Control(msg)).await {
            warn!(target: "tts", error = %e, "failed to publish audio envelope");
        }
    }

    fn flag_key(&self) -> String {
        keys::tts_active(&self.conversation_id)
    }
}

/// Drain the conversation's queue sentence by sentence. Runs until the queue
/// empties or the run is cancelled; exactly one of these tasks exists per
/// conversation at a time.
async fn run_playback(ctx: PlaybackContext, cancel: CancellationToken) {
    loop {
        let next = {
            let mut guard = ctx.playback.lock().await;
            if cancel.is_cancelled() || guard.queue.is_empty() {
                // Natural drain or cancellation: the flag goes before the
                // state flips, so a successor task cannot be clobbered.
                ctx.store.delete(&ctx.flag_key());
                guard.state = PlaybackState::Idle;
                None
            } else {
                guard.queue.pop_front()
            }
        };
        let Some(sentence) = next else {
            return;
        };

        let seq = sentence.sequence_number;
        let end = tokio::time::timeout(
            ctx.cfg.sentence_timeout,
            synthesize_sentence(&ctx, sentence, &cancel),
        )
        .await
        .unwrap_or_else(|_| {
            warn!(target: "tts", conversation = %ctx.conversation_id, seq, "sentence synthesis timed out");
            SentenceEnd::Failed
        });

        match end {
            SentenceEnd::Natural => {
                // Leave the flag set between back-to-back sentences; the
                // empty-queue exit above clears it.
            }
            SentenceEnd::Interrupted => {
                // The interrupted envelope goes out while the state is still
                // held, so no successor can publish a start ahead of it.
                let mut guard = ctx.playback.lock().await;
                guard.queue.clear();
                ctx.store.delete(&ctx.flag_key());
                ctx.publish_envelope(WireMessage::AudioStreamEnd {
                    conversation_id: ctx.conversation_id.clone(),
                    reason: Some("interrupted".into()),
                })
                .await;
                guard.state = PlaybackState::Idle;
                return;
            }
            SentenceEnd::Failed => {
                // Mid-turn engine failure: the rest of the turn plays as
                // text only, so drop the queue and go idle.
                let mut guard = ctx.playback.lock().await;
                guard.queue.clear();
                ctx.store.delete(&ctx.flag_key());
                guard.state = PlaybackState::Idle;
                return;
            }
        }
    }
}

/// Synthesize one sentence onto the conversation's audio topic.
async fn synthesize_sentence(
    ctx: &PlaybackContext,
    sentence: QueuedSentence,
    cancel: &CancellationToken,
) -> SentenceEnd {
    let id = &ctx.conversation_id;

    if let Err(e) = ctx
        .store
        .put(&ctx.flag_key(), &true, keys::TTS_ACTIVE_TTL)
    {
        warn!(target: "tts", error = %e, "failed to set ttsActive flag");
    }
    ctx.publish_envelope(WireMessage::AudioStreamStart {
        conversation_id: id.clone(),
        sample_rate: ctx.cfg.output_sample_rate,
        channels: 1,
        format: "pcm_s16le".into(),
    })
    .await;

    let mut stream = match ctx
        .engine
        .synthesize(&sentence.text, &sentence.voice_id, cancel.child_token())
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            warn!(target: "tts", conversation = %id, error = %e, "engine refused sentence");
            ctx.publish_envelope(WireMessage::AudioStreamError {
                conversation_id: id.clone(),
                error: e.to_string(),
            })
            .await;
            return SentenceEnd::Failed;
        }
    };

    let mut last_refresh = Instant::now();
    debug!(
        target: "tts",
        conversation = %id,
        seq = sentence.sequence_number,
        engine_rate = stream.sample_rate,
        "synthesizing sentence"
    );

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return SentenceEnd::Interrupted,
            chunk = stream.chunks.recv() => chunk,
        };
        let Some(chunk) = chunk else { break };
        let samples = match chunk {
            Ok(samples) => samples,
            Err(e) => {
                warn!(target: "tts", conversation = %id, error = %e, "engine error mid-stream");
                ctx.publish_envelope(WireMessage::AudioStreamError {
                    conversation_id: id.clone(),
                    error: e.to_string(),
                })
                .await;
                return SentenceEnd::Failed;
            }
        };

        let resampled = pcm::resample(&samples, stream.sample_rate, ctx.cfg.output_sample_rate);
        let bytes = pcm::samples_to_bytes(&resampled);
        for slice in pcm::slice_chunks(&bytes, ctx.cfg.chunk_bytes) {
            if cancel.is_cancelled() {
                return SentenceEnd::Interrupted;
            }
            let frame = AudioFrame::new(id.clone(), slice);
            if let Err(e) = ctx.broker.publish(&ctx.topic(), Payload::Audio(frame)).await {
                warn!(target: "tts", error = %e, "failed to publish audio frame");
            }
            if last_refresh.elapsed() >= ctx.cfg.flag_refresh {
                ctx.store.refresh(&ctx.flag_key(), keys::TTS_ACTIVE_TTL);
                last_refresh = Instant::now();
            }
        }
    }

    ctx.publish_envelope(WireMessage::AudioStreamEnd {
        conversation_id: id.clone(),
        reason: None,
    })
    .await;
    SentenceEnd::Natural
}
