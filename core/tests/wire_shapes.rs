//! Wire-shape tests: exact `type` tags and field casing, as the client and
//! the broker consumers see them.

use std::collections::HashMap;

use serde_json::{json, Value};

use parley_core::messages::{
    Role, ToolCapability, ToolStatus, TtsControlAction, WireMessage,
};

fn to_value(msg: &WireMessage) -> Value {
    serde_json::from_str(&msg.to_json()).expect("serialized message is valid JSON")
}

#[test]
fn system_event_shape() {
    let v = to_value(&WireMessage::SystemEvent {
        event: "conversation_started".into(),
        conversation_id: "c1".into(),
    });
    assert_eq!(
        v,
        json!({"type": "system_event", "event": "conversation_started", "conversationId": "c1"})
    );
}

#[test]
fn transcript_shapes() {
    let v = to_value(&WireMessage::PartialTranscript {
        conversation_id: "c1".into(),
        transcript: "bonj".into(),
        timestamp_ms: 42,
    });
    assert_eq!(v["type"], "partial_transcript");
    assert_eq!(v["conversationId"], "c1");
    assert_eq!(v["transcript"], "bonj");
    assert_eq!(v["timestampMs"], 42);

    let v = to_value(&WireMessage::FinalTranscript {
        conversation_id: "c1".into(),
        transcript: "bonjour".into(),
        timestamp_ms: 43,
    });
    assert_eq!(v["type"], "final_transcript");
}

#[test]
fn token_shape() {
    let v = to_value(&WireMessage::Token {
        conversation_id: "c1".into(),
        role: Role::Assistant,
        content: "Hel".into(),
    });
    assert_eq!(
        v,
        json!({"type": "token", "conversationId": "c1", "role": "assistant", "content": "Hel"})
    );
}

#[test]
fn tool_status_shape_omits_absent_result() {
    let v = to_value(&WireMessage::Tool {
        conversation_id: "c1".into(),
        tool_call_id: "t1".into(),
        name: "get_time".into(),
        status: ToolStatus::Running,
        result: None,
    });
    assert_eq!(v["type"], "tool");
    assert_eq!(v["status"], "running");
    assert!(v.get("result").is_none());

    let v = to_value(&WireMessage::Tool {
        conversation_id: "c1".into(),
        tool_call_id: "t1".into(),
        name: "get_time".into(),
        status: ToolStatus::Completed,
        result: Some(json!({"time": "12:00"})),
    });
    assert_eq!(v["status"], "completed");
    assert_eq!(v["result"]["time"], "12:00");
}

#[test]
fn tool_request_shape() {
    let v = to_value(&WireMessage::ToolRequest {
        conversation_id: "c1".into(),
        tool_call_id: "t1".into(),
        tool_name: "takeScreenshot".into(),
        arguments: json!({"display": 1}),
        timeout_ms: 30_000,
    });
    assert_eq!(v["type"], "tool_request");
    assert_eq!(v["toolCallId"], "t1");
    assert_eq!(v["toolName"], "takeScreenshot");
    assert_eq!(v["timeoutMs"], 30_000);
}

#[test]
fn audio_envelope_shapes() {
    let v = to_value(&WireMessage::AudioStreamStart {
        conversation_id: "c1".into(),
        sample_rate: 16_000,
        channels: 1,
        format: "pcm_s16le".into(),
    });
    assert_eq!(
        v,
        json!({
            "type": "audio_stream_start",
            "conversationId": "c1",
            "sampleRate": 16_000,
            "channels": 1,
            "format": "pcm_s16le"
        })
    );

    let v = to_value(&WireMessage::AudioStreamEnd {
        conversation_id: "c1".into(),
        reason: None,
    });
    assert_eq!(v, json!({"type": "audio_stream_end", "conversationId": "c1"}));

    let v = to_value(&WireMessage::AudioStreamEnd {
        conversation_id: "c1".into(),
        reason: Some("interrupted".into()),
    });
    assert_eq!(v["reason"], "interrupted");

    let v = to_value(&WireMessage::AudioStreamError {
        conversation_id: "c1".into(),
        error: "engine exploded".into(),
    });
    assert_eq!(v["type"], "audio_stream_error");
}

#[test]
fn barge_in_shape() {
    let v = to_value(&WireMessage::BargeInNotification {
        conversation_id: "c1".into(),
        timestamp_ms: 99,
    });
    assert_eq!(
        v,
        json!({"type": "barge_in_notification", "conversationId": "c1", "timestampMs": 99})
    );
}

#[test]
fn sentence_request_shape() {
    let v = to_value(&WireMessage::SentenceRequest {
        conversation_id: "c1".into(),
        text: "Hello there.".into(),
        voice_id: "default".into(),
        sequence_number: 3,
    });
    assert_eq!(v["type"], "sentence_request");
    assert_eq!(v["sequenceNumber"], 3);
    assert_eq!(v["voiceId"], "default");
}

#[test]
fn tts_control_shape() {
    let v = to_value(&WireMessage::TtsControl {
        conversation_id: "c1".into(),
        action: TtsControlAction::Stop,
    });
    assert_eq!(
        v,
        json!({"type": "tts_control", "conversationId": "c1", "action": "stop"})
    );
}

#[test]
fn connection_event_shape() {
    let msg = WireMessage::disconnected("c1", "client_closed");
    let v = to_value(&msg);
    assert_eq!(v["type"], "connection_event");
    assert_eq!(v["kind"], "disconnected");
    assert_eq!(v["reason"], "client_closed");
    assert!(v["timestampMs"].as_i64().is_some());
}

#[test]
fn client_messages_parse() {
    let msg = WireMessage::parse(
        r#"{"type": "client_capabilities", "clientId": "desktop-1",
            "capabilities": {"takeScreenshot": {"description": "Grab the screen",
            "parameters": {"type": "object", "properties": {}}}}}"#,
    )
    .expect("capabilities parse");
    match msg {
        WireMessage::ClientCapabilities {
            conversation_id,
            client_id,
            capabilities,
        } => {
            assert!(conversation_id.is_empty(), "client omits conversationId");
            assert_eq!(client_id, "desktop-1");
            let cap: &ToolCapability = &capabilities["takeScreenshot"];
            assert_eq!(cap.description, "Grab the screen");
        }
        other => panic!("wrong variant: {other:?}"),
    }

    let msg = WireMessage::parse(
        r#"{"type": "tool_response", "toolCallId": "t1", "conversationId": "c1",
            "success": true, "result": {"path": "/tmp/x.png"}}"#,
    )
    .expect("tool response parse");
    match msg {
        WireMessage::ToolResponse {
            tool_call_id,
            success,
            result,
            ..
        } => {
            assert_eq!(tool_call_id, "t1");
            assert!(success);
            assert_eq!(result["path"], "/tmp/x.png");
        }
        other => panic!("wrong variant: {other:?}"),
    }
}

#[test]
fn unknown_type_is_rejected() {
    let err = WireMessage::parse(r#"{"type": "telepathy", "conversationId": "c1"}"#);
    assert!(err.is_err());

    let err = WireMessage::parse("not json at all");
    assert!(err.is_err());
}

#[test]
fn roundtrip_through_json() {
    let mut caps = HashMap::new();
    caps.insert(
        "openUrl".to_string(),
        ToolCapability {
            description: "Open a URL".into(),
            parameters: json!({"type": "object", "properties": {"url": {"type": "string"}}}),
        },
    );
    let originals = vec![
        WireMessage::SystemEvent {
            event: "conversation_started".into(),
            conversation_id: "c1".into(),
        },
        WireMessage::ClientCapabilities {
            conversation_id: "c1".into(),
            client_id: "web".into(),
            capabilities: caps,
        },
        WireMessage::SentenceRequest {
            conversation_id: "c1".into(),
            text: "One.".into(),
            voice_id: "v".into(),
            sequence_number: 0,
        },
    ];
    for original in originals {
        let parsed = WireMessage::parse(&original.to_json()).expect("roundtrip parse");
        assert_eq!(parsed, original);
    }
}
