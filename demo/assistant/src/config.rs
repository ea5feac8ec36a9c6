use std::path::Path;

use parley_audio::{AudioWorkerConfig, WhisperConfig};
use parley_gateway::GatewayConfig;
use parley_orchestrator::{LlmConfig, OrchestratorConfig, ToolRouterConfig};
use parley_tts::{PiperConfig, ToneConfig, TtsWorkerConfig};
use serde::Deserialize;
use tracing::{info, warn};

/// High-level configuration for the assistant demo.
#[derive(Clone, Debug)]
pub struct AssistantConfig {
    pub gateway: GatewayConfig,
    pub audio: AudioWorkerConfig,
    pub whisper: WhisperConfig,
    pub orchestrator: OrchestratorConfig,
    pub router: ToolRouterConfig,
    pub llm: LlmConfig,
    pub tts_worker: TtsWorkerConfig,
    pub piper: PiperConfig,
    pub tone: ToneConfig,
    /// "piper" for the CLI engine, "tone" for the built-in test tone.
    pub tts_engine: String,
    /// "whisper" for the CLI engine, "scripted" for the test double.
    pub asr_engine: String,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            audio: AudioWorkerConfig::default(),
            whisper: WhisperConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            router: ToolRouterConfig::default(),
            llm: LlmConfig::default(),
            tts_worker: TtsWorkerConfig::default(),
            piper: PiperConfig::default(),
            tone: ToneConfig::default(),
            tts_engine: std::env::var("PARLEY_TTS_ENGINE").unwrap_or_else(|_| "piper".into()),
            asr_engine: std::env::var("PARLEY_ASR_ENGINE").unwrap_or_else(|_| "whisper".into()),
        }
    }
}

/// Optional TOML overlay applied on top of defaults + env.
#[derive(Debug, Default, Deserialize)]
struct Overlay {
    gateway_addr: Option<String>,
    auth_token: Option<String>,
    system_prompt: Option<String>,
    default_voice: Option<String>,
    tts_engine: Option<String>,
    asr_engine: Option<String>,
    llm_base_url: Option<String>,
    llm_model: Option<String>,
}

impl AssistantConfig {
    /// Defaults (which already consider env vars), then the TOML file named
    /// by `PARLEY_CONFIG` if present.
    pub fn load() -> Self {
        let mut cfg = Self::default();
        let Some(path) = std::env::var("PARLEY_CONFIG").ok().filter(|p| !p.is_empty()) else {
            return cfg;
        };
        let overlay = match std::fs::read_to_string(Path::new(&path)) {
            Ok(raw) => match toml::from_str::<Overlay>(&raw) {
                Ok(overlay) => overlay,
                Err(e) => {
                    warn!(target: "assistant", %path, error = %e, "ignoring unparsable config file");
                    return cfg;
                }
            },
            Err(e) => {
                warn!(target: "assistant", %path, error = %e, "ignoring unreadable config file");
                return cfg;
            }
        };
        info!(target: "assistant", %path, "applied config overlay");

        if let Some(addr) = overlay.gateway_addr {
            cfg.gateway.bind_addr = addr;
        }
        if let Some(token) = overlay.auth_token {
            cfg.gateway.auth_token = Some(token);
        }
        if let Some(prompt) = overlay.system_prompt {
            cfg.orchestrator.system_prompt = prompt;
        }
        if let Some(voice) = overlay.default_voice {
            cfg.orchestrator.default_voice = voice;
        }
        if let Some(engine) = overlay.tts_engine {
            cfg.tts_engine = engine;
        }
        if let Some(engine) = overlay.asr_engine {
            cfg.asr_engine = engine;
        }
        if let Some(url) = overlay.llm_base_url {
            cfg.llm.base_url = url;
        }
        if let Some(model) = overlay.llm_model {
            cfg.llm.model = model;
        }
        cfg
    }
}
