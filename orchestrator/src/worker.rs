use std::sync::Arc;
use std::time::Duration;

use parley_core::broker::{Broker, Payload, QosLevel};
use parley_core::kv::{keys, TtlStore};
use parley_core::messages::{Role, ToolStatus, TtsControlAction, Turn, WireMessage};
use parley_core::{topics, ConversationMap};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::llm::{LanguageModel, LlmEvent};
use crate::segment::{SegmenterConfig, SentenceSplitter};
use crate::tools::ToolRouter;
use crate::Result;

/// Orchestrator configuration.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Seed system prompt for fresh conversations.
    pub system_prompt: String,
    /// Voice used when the conversation config does not pick one.
    pub default_voice: String,
    pub segmenter: SegmenterConfig,
    /// Upper bound on one generation, stream plus tool calls.
    pub generation_timeout: Duration,
    /// Upper bound on tool-call rounds within one turn.
    pub max_tool_rounds: usize,
    /// Terminal utterance on model failure.
    pub apology: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            system_prompt: std::env::var("PARLEY_SYSTEM_PROMPT").unwrap_or_else(|_| {
                "You are a helpful, concise voice assistant. Answer briefly and clearly.".into()
            }),
            default_voice: std::env::var("PARLEY_DEFAULT_VOICE")
                .unwrap_or_else(|_| "default".into()),
            segmenter: SegmenterConfig::default(),
            generation_timeout: Duration::from_secs(
                std::env::var("PARLEY_GENERATION_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
            ),
            max_tool_rounds: 4,
            apology: "I am temporarily unavailable.".into(),
        }
    }
}

/// Per-conversation overrides stored under `conversation.config:<id>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationConfig {
    #[serde(default)]
    pub voice_id: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// Cancellation handle and sentence counter for one conversation.
struct GenerationSlot {
    cancel: CancellationToken,
    seq: u64,
}

type Slots = Arc<ConversationMap<Mutex<GenerationSlot>>>;

/// The LLM orchestrator worker. Exactly one in-flight generation per
/// conversation; any new final transcript supersedes the previous one.
pub struct OrchestratorWorker {
    broker: Arc<Broker>,
    store: Arc<TtlStore>,
    model: Arc<dyn LanguageModel>,
    router: Arc<ToolRouter>,
    cfg: OrchestratorConfig,
}

impl OrchestratorWorker {
    pub fn new(
        broker: Arc<Broker>,
        store: Arc<TtlStore>,
        model: Arc<dyn LanguageModel>,
        router: Arc<ToolRouter>,
        cfg: OrchestratorConfig,
    ) -> Self {
        Self {
            broker,
            store,
            model,
            router,
            cfg,
        }
    }

    pub async fn start(self) -> Result<JoinHandle<()>> {
        let handle = tokio::spawn(async move {
            if let Err(e) = run_worker(self).await {
                error!(target: "orchestrator", error = %e, "orchestrator worker stopped");
            }
        });
        Ok(handle)
    }
}

async fn run_worker(worker: OrchestratorWorker) -> Result<()> {
    let OrchestratorWorker {
        broker,
        store,
        model,
        router,
        cfg,
    } = worker;

    let mut transcripts = broker.subscribe(topics::TRANSCRIPT, QosLevel::Batched);
    let mut barge_ins = broker.subscribe(topics::BARGE_IN, QosLevel::Batched);
    let mut conn_events = broker.subscribe(topics::CONNECTION_EVENTS, QosLevel::Batched);
    let mut capabilities = broker.subscribe(topics::CLIENT_CAPABILITIES, QosLevel::Batched);
    let mut tool_responses = broker.subscribe(topics::CLIENT_TOOL_RESPONSE, QosLevel::Batched);

    let slots: Slots = Arc::new(ConversationMap::new());

    info!(target: "orchestrator", "orchestrator worker started");

    loop {
        tokio::select! {
            payload = transcripts.recv() => {
                let Some(payload) = payload else { break };
                if let Payload::Control(WireMessage::FinalTranscript { conversation_id, transcript, .. }) = payload {
                    if transcript.trim().is_empty() {
                        debug!(target: "orchestrator", conversation = %conversation_id, "ignoring empty final transcript");
                        continue;
                    }
                    start_generation(
                        &broker, &store, &model, &router, &cfg, &slots,
                        conversation_id, transcript,
                    ).await;
                }
            }

            payload = barge_ins.recv() => {
                let Some(payload) = payload else { break };
                if let Payload::Control(WireMessage::BargeInNotification { conversation_id, .. }) = payload {
                    if let Some(slot) = slots.get(&conversation_id) {
                        slot.lock().await.cancel.cancel();
                        info!(target: "orchestrator", conversation = %conversation_id, "generation cancelled by barge-in");
                    }
                }
            }

            payload = conn_events.recv() => {
                let Some(payload) = payload else { break };
                if let Payload::Control(WireMessage::ConnectionEvent { conversation_id, .. }) = payload {
                    if let Some(slot) = slots.remove(&conversation_id) {
                        slot.lock().await.cancel.cancel();
                    }
                    router.remove_conversation(&conversation_id);
                    debug!(target: "orchestrator", conversation = %conversation_id, "released generation state on disconnect");
                }
            }

            payload = capabilities.recv() => {
                let Some(payload) = payload else { break };
                if let Payload::Control(WireMessage::ClientCapabilities { conversation_id, client_id, capabilities }) = payload {
                    router.register_client_capabilities(&conversation_id, &client_id, capabilities);
                }
            }

            payload = tool_responses.recv() => {
                let Some(payload) = payload else { break };
                if let Payload::Control(WireMessage::ToolResponse { tool_call_id, success, result, .. }) = payload {
                    router.handle_response(&tool_call_id, success, result);
                }
            }
        }
    }

    Ok(())
}

/// Cancel any live generation for the conversation and spawn a new one.
#[allow(clippy::too_many_arguments)]
async fn start_generation(
    broker: &Arc<Broker>,
    store: &Arc<TtlStore>,
    model: &Arc<dyn LanguageModel>,
    router: &Arc<ToolRouter>,
    cfg: &OrchestratorConfig,
    slots: &Slots,
    conversation_id: String,
    transcript: String,
) {
    let slot = slots.get_or_create(&conversation_id, || {
        Mutex::new(GenerationSlot {
            cancel: CancellationToken::new(),
            seq: 0,
        })
    });
    let token = {
        let mut guard = slot.lock().await;
        guard.cancel.cancel();
        guard.cancel = CancellationToken::new();
        guard.cancel.clone()
    };

    let ctx = GenerationContext {
        broker: Arc::clone(broker),
        store: Arc::clone(store),
        model: Arc::clone(model),
        router: Arc::clone(router),
        cfg: cfg.clone(),
        slots: Arc::clone(slots),
        conversation_id,
        token,
    };
    tokio::spawn(async move {
        let conversation_id = ctx.conversation_id.clone();
        let timeout = ctx.cfg.generation_timeout;
        let timed_out = tokio::time::timeout(timeout, run_generation(ctx, transcript))
            .await
            .is_err();
        if timed_out {
            warn!(target: "orchestrator", conversation = %conversation_id, "generation timed out");
        }
    });
}

struct GenerationContext {
    broker: Arc<Broker>,
    store: Arc<TtlStore>,
    model: Arc<dyn LanguageModel>,
    router: Arc<ToolRouter>,
    cfg: OrchestratorConfig,
    slots: Slots,
    conversation_id: String,
    token: CancellationToken,
}

impl GenerationContext {
    async fn publish(&self, topic: &str, msg: WireMessage) {
        if let Err(e) = self.broker.publish(topic, Payload::Control(msg)).await {
            warn!(target: "orchestrator", topic = %topic, error = %e, "publish failed");
        }
    }

    async fn publish_token(&self, content: &str) {
        self.publish(
            topics::LLM_TOKEN,
            WireMessage::Token {
                conversation_id: self.conversation_id.clone(),
                role: Role::Assistant,
                content: content.to_string(),
            },
        )
        .await;
    }

    async fn publish_sentence(&self, voice: &str, text: String) {
        let seq = {
            let Some(slot) = self.slots.get(&self.conversation_id) else {
                return;
            };
            let mut guard = slot.lock().await;
            let seq = guard.seq;
            guard.seq += 1;
            seq
        };
        self.publish(
            topics::TTS_REQUEST,
            WireMessage::SentenceRequest {
                conversation_id: self.conversation_id.clone(),
                text,
                voice_id: voice.to_string(),
                sequence_number: seq,
            },
        )
        .await;
    }

    async fn publish_tts_stop(&self) {
        self.publish(
            topics::TTS_CONTROL,
            WireMessage::TtsControl {
                conversation_id: self.conversation_id.clone(),
                action: TtsControlAction::Stop,
            },
        )
        .await;
    }

    async fn publish_tool_status(
        &self,
        tool_call_id: &str,
        name: &str,
        status: ToolStatus,
        result: Option<serde_json::Value>,
    ) {
        self.publish(
            topics::LLM_TOOL_CALL,
            WireMessage::Tool {
                conversation_id: self.conversation_id.clone(),
                tool_call_id: tool_call_id.to_string(),
                name: name.to_string(),
                status,
                result,
            },
        )
        .await;
    }
}

async fn run_generation(ctx: GenerationContext, transcript: String) {
    let id = &ctx.conversation_id;
    let conv_cfg: ConversationConfig = ctx
        .store
        .get(&keys::conversation_config(id))
        .ok()
        .flatten()
        .unwrap_or_default();
    let voice = conv_cfg
        .voice_id
        .unwrap_or_else(|| ctx.cfg.default_voice.clone());
    let system_prompt = conv_cfg
        .system_prompt
        .unwrap_or_else(|| ctx.cfg.system_prompt.clone());

    let history_key = keys::conversation_history(id);
    let mut history: Vec<Turn> = ctx
        .store
        .get(&history_key)
        .ok()
        .flatten()
        .unwrap_or_else(|| vec![Turn::new(Role::System, system_prompt)]);
    history.push(Turn::new(Role::User, transcript));
    if let Err(e) = ctx.store.put(&history_key, &history, keys::HISTORY_TTL) {
        warn!(target: "orchestrator", error = %e, "failed to persist history");
    }

    let mut splitter = SentenceSplitter::new(ctx.cfg.segmenter.clone());
    let mut assistant_text = String::new();

    info!(target: "orchestrator", conversation = %id, "starting generation");

    for round in 0..=ctx.cfg.max_tool_rounds {
        let tools = ctx.router.catalog(id);
        let mut rx = match ctx
            .model
            .stream(&history, &tools, ctx.token.child_token())
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                warn!(target: "orchestrator", conversation = %id, error = %e, "model request failed");
                apologize(&ctx, &voice).await;
                return;
            }
        };

        let mut continue_with_tools = false;
        loop {
            let event = tokio::select! {
                _ = ctx.token.cancelled() => {
                    // Superseded, barged in, or disconnected: stop emitting,
                    // drop the accumulator, silence the TTS queue.
                    info!(target: "orchestrator", conversation = %id, "generation cancelled");
                    ctx.publish_tts_stop().await;
                    return;
                }
                event = rx.recv() => event,
            };

            match event {
                Some(LlmEvent::Token(text)) => {
                    ctx.publish_token(&text).await;
                    assistant_text.push_str(&text);
                    for sentence in splitter.push(&text) {
                        ctx.publish_sentence(&voice, sentence).await;
                    }
                }
                Some(LlmEvent::ToolCall {
                    id: call_id,
                    name,
                    arguments,
                }) => {
                    let call_id = if call_id.is_empty() {
                        uuid::Uuid::new_v4().to_string()
                    } else {
                        call_id
                    };
                    ctx.publish_tool_status(&call_id, &name, ToolStatus::Running, None)
                        .await;

                    let outcome = tokio::select! {
                        _ = ctx.token.cancelled() => {
                            ctx.publish_tts_stop().await;
                            return;
                        }
                        outcome = ctx.router.dispatch(id, &call_id, &name, arguments) => outcome,
                    };

                    let status = if outcome.success {
                        ToolStatus::Completed
                    } else {
                        ToolStatus::Failed
                    };
                    ctx.publish_tool_status(&call_id, &name, status, Some(outcome.result.clone()))
                        .await;

                    history.push(Turn::new(
                        Role::Tool,
                        json!({
                            "toolName": name,
                            "success": outcome.success,
                            "result": outcome.result,
                        })
                        .to_string(),
                    ));
                    continue_with_tools = true;
                    break;
                }
                Some(LlmEvent::Error(e)) => {
                    warn!(target: "orchestrator", conversation = %id, error = %e, "model stream error");
                    apologize(&ctx, &voice).await;
                    return;
                }
                Some(LlmEvent::Done) | None => {
                    if let Some(rest) = splitter.flush_remaining() {
                        ctx.publish_sentence(&voice, rest).await;
                    }
                    break;
                }
            }
        }

        if !continue_with_tools {
            break;
        }
        if round == ctx.cfg.max_tool_rounds {
            warn!(target: "orchestrator", conversation = %id, "tool round limit reached");
        }
    }

    if !assistant_text.trim().is_empty() {
        history.push(Turn::new(Role::Assistant, assistant_text));
        if let Err(e) = ctx.store.put(&history_key, &history, keys::HISTORY_TTL) {
            warn!(target: "orchestrator", error = %e, "failed to persist assistant turn");
        }
    }
    debug!(target: "orchestrator", conversation = %id, "generation finished");
}

/// Model failure: silence in-flight synthesis and speak a terminal apology.
/// History keeps the user turn but not the failed assistant turn.
async fn apologize(ctx: &GenerationContext, voice: &str) {
    ctx.publish_tts_stop().await;
    let apology = ctx.cfg.apology.clone();
    ctx.publish_token(&apology).await;
    ctx.publish_sentence(voice, apology).await;
}
