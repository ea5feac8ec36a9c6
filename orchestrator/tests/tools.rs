//! Tool routing: server tools, the client RPC bridge, timeouts and
//! duplicate-result handling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parley_core::broker::{Broker, Payload, QosLevel};
use parley_core::kv::TtlStore;
use parley_core::messages::{ToolCapability, ToolStatus, WireMessage};
use parley_core::{topics, Subscription};
use parley_orchestrator::llm::ScriptItem;
use parley_orchestrator::{
    GetTimeTool, OrchestratorConfig, OrchestratorWorker, ScriptedModel, ToolOutcome, ToolRouter,
    ToolRouterConfig,
};
use serde_json::json;
use tokio::time::timeout;

async fn next_control(sub: &mut Subscription, wait: Duration) -> Option<WireMessage> {
    match timeout(wait, sub.recv()).await {
        Ok(Some(Payload::Control(msg))) => Some(msg),
        _ => None,
    }
}

fn screenshot_caps() -> HashMap<String, ToolCapability> {
    let mut caps = HashMap::new();
    caps.insert(
        "takeScreenshot".to_string(),
        ToolCapability {
            description: "Capture the client screen".into(),
            parameters: json!({"type": "object", "properties": {}, "required": []}),
        },
    );
    caps
}

#[tokio::test]
async fn server_tool_roundtrip_with_status_events() {
    let broker = Broker::shared();
    let store = Arc::new(TtlStore::new());
    let router = Arc::new(ToolRouter::new(
        Arc::clone(&broker),
        ToolRouterConfig::default(),
    ));
    router.register(Arc::new(GetTimeTool));

    let model = Arc::new(ScriptedModel::new([
        vec![ScriptItem::ToolCall {
            id: "call_1".into(),
            name: "get_time".into(),
            arguments: json!({}),
        }],
        vec![ScriptItem::Token("It is noon.".into())],
    ]));
    let worker = OrchestratorWorker::new(
        Arc::clone(&broker),
        Arc::clone(&store),
        Arc::clone(&model) as Arc<dyn parley_orchestrator::LanguageModel>,
        router,
        OrchestratorConfig::default(),
    );
    let handle = worker.start().await.expect("worker starts");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut statuses = broker.subscribe(topics::LLM_TOOL_CALL, QosLevel::Batched);
    let mut sentences = broker.subscribe(topics::TTS_REQUEST, QosLevel::Batched);

    broker
        .publish(
            topics::TRANSCRIPT,
            Payload::Control(WireMessage::FinalTranscript {
                conversation_id: "c1".into(),
                transcript: "what time is it".into(),
                timestamp_ms: parley_core::now_ms(),
            }),
        )
        .await
        .expect("publish transcript");

    match next_control(&mut statuses, Duration::from_secs(2)).await {
        Some(WireMessage::Tool { status, name, .. }) => {
            assert_eq!(status, ToolStatus::Running);
            assert_eq!(name, "get_time");
        }
        other => panic!("expected running status, got {other:?}"),
    }
    match next_control(&mut statuses, Duration::from_secs(2)).await {
        Some(WireMessage::Tool { status, result, .. }) => {
            assert_eq!(status, ToolStatus::Completed);
            assert!(result.expect("result present")["now"].is_string());
        }
        other => panic!("expected completed status, got {other:?}"),
    }

    // The follow-up stream saw the tool turn and spoke the answer.
    match next_control(&mut sentences, Duration::from_secs(2)).await {
        Some(WireMessage::SentenceRequest { text, .. }) => assert_eq!(text, "It is noon."),
        other => panic!("expected sentence, got {other:?}"),
    }
    let histories = model.histories();
    assert_eq!(histories.len(), 2);
    assert!(histories[1]
        .iter()
        .any(|t| t.role == parley_core::Role::Tool && t.content.contains("get_time")));

    handle.abort();
}

#[tokio::test]
async fn client_tool_roundtrip_over_the_broker() {
    let broker = Broker::shared();
    let store = Arc::new(TtlStore::new());
    let router = Arc::new(ToolRouter::new(
        Arc::clone(&broker),
        ToolRouterConfig::default(),
    ));

    let model = Arc::new(ScriptedModel::new([
        vec![ScriptItem::ToolCall {
            id: "call_shot".into(),
            name: "takeScreenshot".into(),
            arguments: json!({}),
        }],
        vec![ScriptItem::Token("Saved to /tmp/x.png.".into())],
    ]));
    let worker = OrchestratorWorker::new(
        Arc::clone(&broker),
        Arc::clone(&store),
        Arc::clone(&model) as Arc<dyn parley_orchestrator::LanguageModel>,
        router,
        OrchestratorConfig::default(),
    );
    let handle = worker.start().await.expect("worker starts");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut requests = broker.subscribe(topics::CLIENT_TOOL_REQUEST, QosLevel::Batched);
    let mut sentences = broker.subscribe(topics::TTS_REQUEST, QosLevel::Batched);

    // The client advertises the tool, then the user asks for it.
    broker
        .publish(
            topics::CLIENT_CAPABILITIES,
            Payload::Control(WireMessage::ClientCapabilities {
                conversation_id: "c1".into(),
                client_id: "desktop-1".into(),
                capabilities: screenshot_caps(),
            }),
        )
        .await
        .expect("publish capabilities");
    tokio::time::sleep(Duration::from_millis(50)).await;

    broker
        .publish(
            topics::TRANSCRIPT,
            Payload::Control(WireMessage::FinalTranscript {
                conversation_id: "c1".into(),
                transcript: "take a screenshot".into(),
                timestamp_ms: parley_core::now_ms(),
            }),
        )
        .await
        .expect("publish transcript");

    // Play the client: answer the request on the response channel.
    let tool_call_id = match next_control(&mut requests, Duration::from_secs(2)).await {
        Some(WireMessage::ToolRequest {
            tool_call_id,
            tool_name,
            timeout_ms,
            ..
        }) => {
            assert_eq!(tool_name, "takeScreenshot");
            assert!(timeout_ms > 0);
            tool_call_id
        }
        other => panic!("expected tool request, got {other:?}"),
    };
    broker
        .publish(
            topics::CLIENT_TOOL_RESPONSE,
            Payload::Control(WireMessage::ToolResponse {
                tool_call_id,
                conversation_id: "c1".into(),
                success: true,
                result: json!({"path": "/tmp/x.png"}),
            }),
        )
        .await
        .expect("publish tool response");

    match next_control(&mut sentences, Duration::from_secs(2)).await {
        Some(WireMessage::SentenceRequest { text, .. }) => {
            assert_eq!(text, "Saved to /tmp/x.png.")
        }
        other => panic!("expected acknowledgement sentence, got {other:?}"),
    }
    handle.abort();
}

#[tokio::test]
async fn unanswered_client_tool_times_out_with_failed_status() {
    let broker = Broker::shared();
    let store = Arc::new(TtlStore::new());
    // Short timeout so the test does not wait the default 30 s.
    let router = Arc::new(ToolRouter::new(
        Arc::clone(&broker),
        ToolRouterConfig {
            call_timeout: Duration::from_millis(200),
        },
    ));

    let model = Arc::new(ScriptedModel::new([
        vec![ScriptItem::ToolCall {
            id: "call_shot".into(),
            name: "takeScreenshot".into(),
            arguments: json!({}),
        }],
        vec![ScriptItem::Token("The screenshot tool failed.".into())],
    ]));
    let worker = OrchestratorWorker::new(
        Arc::clone(&broker),
        Arc::clone(&store),
        Arc::clone(&model) as Arc<dyn parley_orchestrator::LanguageModel>,
        router,
        OrchestratorConfig::default(),
    );
    let handle = worker.start().await.expect("worker starts");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut statuses = broker.subscribe(topics::LLM_TOOL_CALL, QosLevel::Batched);
    let mut sentences = broker.subscribe(topics::TTS_REQUEST, QosLevel::Batched);

    broker
        .publish(
            topics::CLIENT_CAPABILITIES,
            Payload::Control(WireMessage::ClientCapabilities {
                conversation_id: "c1".into(),
                client_id: "desktop-1".into(),
                capabilities: screenshot_caps(),
            }),
        )
        .await
        .expect("publish capabilities");
    tokio::time::sleep(Duration::from_millis(50)).await;

    broker
        .publish(
            topics::TRANSCRIPT,
            Payload::Control(WireMessage::FinalTranscript {
                conversation_id: "c1".into(),
                transcript: "screenshot please".into(),
                timestamp_ms: parley_core::now_ms(),
            }),
        )
        .await
        .expect("publish transcript");

    // Nobody answers: running, then failed with a synthesized error.
    let mut saw_failed = false;
    for _ in 0..2 {
        if let Some(WireMessage::Tool { status, result, .. }) =
            next_control(&mut statuses, Duration::from_secs(2)).await
        {
            if status == ToolStatus::Failed {
                let result = result.expect("failure carries a result");
                assert!(result["error"].as_str().expect("error string").contains("timed out"));
                saw_failed = true;
            }
        }
    }
    assert!(saw_failed, "expected a failed tool status");

    // Generation continues rather than stalling.
    match next_control(&mut sentences, Duration::from_secs(2)).await {
        Some(WireMessage::SentenceRequest { text, .. }) => {
            assert_eq!(text, "The screenshot tool failed.")
        }
        other => panic!("expected continuation sentence, got {other:?}"),
    }
    handle.abort();
}

#[tokio::test]
async fn duplicate_and_unknown_tool_responses_are_dropped() {
    let broker = Broker::shared();
    let router = ToolRouter::new(Arc::clone(&broker), ToolRouterConfig::default());

    // Unknown toolCallId: dropped without effect.
    router.handle_response("never-issued", true, json!({}));

    // Issue a client call by hand and answer it twice.
    router.register_client_capabilities("c1", "desktop-1", screenshot_caps());
    let mut requests = broker.subscribe(topics::CLIENT_TOOL_REQUEST, QosLevel::Batched);

    let router = Arc::new(router);
    let dispatch = {
        let router = Arc::clone(&router);
        tokio::spawn(async move {
            router
                .dispatch("c1", "call_7", "takeScreenshot", json!({}))
                .await
        })
    };

    match next_control(&mut requests, Duration::from_secs(2)).await {
        Some(WireMessage::ToolRequest { tool_call_id, .. }) => assert_eq!(tool_call_id, "call_7"),
        other => panic!("expected tool request, got {other:?}"),
    }

    router.handle_response("call_7", true, json!({"n": 1}));
    // Second response for the same id: silently discarded.
    router.handle_response("call_7", true, json!({"n": 2}));

    let outcome = dispatch.await.expect("dispatch completes");
    assert_eq!(outcome, ToolOutcome::ok(json!({"n": 1})));
}

#[tokio::test]
async fn unknown_tool_and_bad_arguments_fail_cleanly() {
    let broker = Broker::shared();
    let router = ToolRouter::new(Arc::clone(&broker), ToolRouterConfig::default());
    router.register(Arc::new(GetTimeTool));

    let outcome = router.dispatch("c1", "call_1", "no_such_tool", json!({})).await;
    assert!(!outcome.success);

    // Client tool with a required property the model failed to provide.
    let mut caps = HashMap::new();
    caps.insert(
        "openUrl".to_string(),
        ToolCapability {
            description: "Open a URL".into(),
            parameters: json!({"type": "object", "required": ["url"]}),
        },
    );
    router.register_client_capabilities("c1", "desktop-1", caps);
    let outcome = router.dispatch("c1", "call_2", "openUrl", json!({})).await;
    assert!(!outcome.success);
    assert!(outcome.result["error"]
        .as_str()
        .expect("error string")
        .contains("url"));
}
