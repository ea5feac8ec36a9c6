mod config;

use std::sync::Arc;
use std::time::Duration;

use config::AssistantConfig;
use parley_audio::{AsrEngine, AudioWorker, EnergyVad, ScriptedAsr, WhisperCliAsr};
use parley_core::broker::Broker;
use parley_core::kv::TtlStore;
use parley_gateway::Gateway;
use parley_orchestrator::{
    GetTimeTool, OpenAiCompatModel, OrchestratorWorker, ToolRouter,
};
use parley_tts::{PiperCliTts, ToneSynthesizer, TtsEngine, TtsWorker};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,parley_core=info,assistant=info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(
        target: "assistant",
        "Starting assistant: client ⇄ gateway ⇄ {{VAD/ASR, LLM orchestrator, TTS}}"
    );

    let cfg = AssistantConfig::load();

    // Shared plumbing: the broker and the TTL scratch store.
    let broker = Broker::shared();
    let store = Arc::new(TtlStore::new());
    let _sweeper = store.start_sweeper(Duration::from_secs(5));

    // 1) VAD/ASR worker: mic PCM → transcripts + barge-in.
    let asr: Arc<dyn AsrEngine> = match cfg.asr_engine.as_str() {
        "scripted" => Arc::new(ScriptedAsr::new(["Hello, can you hear me?"])),
        _ => Arc::new(WhisperCliAsr::new(cfg.whisper.clone())),
    };
    let audio = AudioWorker::new(
        Arc::clone(&broker),
        Arc::clone(&store),
        asr,
        || Box::new(EnergyVad::new()),
        cfg.audio.clone(),
    );
    let audio_handle = audio.start().await?;

    // 2) Orchestrator: final transcripts → tokens + sentences + tools.
    let router = Arc::new(ToolRouter::new(Arc::clone(&broker), cfg.router.clone()));
    router.register(Arc::new(GetTimeTool));
    let orchestrator = OrchestratorWorker::new(
        Arc::clone(&broker),
        Arc::clone(&store),
        Arc::new(OpenAiCompatModel::new(cfg.llm.clone())?),
        Arc::clone(&router),
        cfg.orchestrator.clone(),
    );
    let orchestrator_handle = orchestrator.start().await?;

    // 3) TTS worker: sentences → per-conversation audio streams.
    let engine: Arc<dyn TtsEngine> = match cfg.tts_engine.as_str() {
        "tone" => Arc::new(ToneSynthesizer::new(cfg.tone.clone())),
        _ => Arc::new(PiperCliTts::new(cfg.piper.clone())),
    };
    let tts = TtsWorker::new(
        Arc::clone(&broker),
        Arc::clone(&store),
        engine,
        cfg.tts_worker.clone(),
    );
    let tts_handle = tts.start().await?;

    // 4) Gateway: the client-facing WebSocket boundary.
    let gateway = Gateway::new(Arc::clone(&broker), cfg.gateway.clone());
    let (gateway_handle, addr) = gateway.start().await?;
    info!(target: "assistant", %addr, "ready for clients on /v1/ws/audio");

    signal::ctrl_c().await?;
    info!(target: "assistant", "shutting down");

    gateway_handle.abort();
    tts_handle.abort();
    orchestrator_handle.abort();
    audio_handle.abort();
    Ok(())
}
