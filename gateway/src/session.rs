//! Per-socket session actor.
//!
//! One actor per accepted WebSocket: socket ingress publishes to the broker,
//! five egress forwarders subscribe and fan matching events back to the
//! client through a single writer task (so text and binary never reorder on
//! the wire).

use std::collections::VecDeque;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use parley_core::broker::{Broker, Payload, QosLevel};
use parley_core::messages::{AudioFrame, WireMessage};
use parley_core::{new_conversation_id, topics};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::AppState;

/// Drop-oldest buffer between the socket reader and the broker publisher.
/// The socket read loop never awaits broker capacity.
struct IngressBuffer {
    queue: std::sync::Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
    cap: usize,
}

impl IngressBuffer {
    fn new(cap: usize) -> Self {
        Self {
            queue: std::sync::Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            cap: cap.max(1),
        }
    }

    /// Push a frame, discarding the oldest when full. Returns the number of
    /// frames dropped (0 or 1).
    fn push(&self, frame: Vec<u8>) -> usize {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let mut dropped = 0;
        if queue.len() >= self.cap {
            queue.pop_front();
            dropped = 1;
        }
        queue.push_back(frame);
        drop(queue);
        self.notify.notify_one();
        dropped
    }

    async fn pop(&self) -> Vec<u8> {
        loop {
            if let Some(frame) = self
                .queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
            {
                return frame;
            }
            self.notify.notified().await;
        }
    }
}

pub(crate) async fn run_session(state: AppState, socket: WebSocket) {
    let broker = Arc::clone(&state.broker);
    let conversation_id = new_conversation_id();
    info!(target: "gateway", conversation = %conversation_id, "session started");

    let (mut sink, mut stream) = socket.split();

    // Single writer: everything destined for the client funnels through here.
    let (writer_tx, mut writer_rx) = mpsc::channel::<Message>(256);
    let writer: JoinHandle<()> = tokio::spawn(async move {
        while let Some(msg) = writer_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let started = WireMessage::SystemEvent {
        event: "conversation_started".to_string(),
        conversation_id: conversation_id.clone(),
    };
    let _ = writer_tx.send(Message::Text(started.to_json())).await;

    // Egress duties: one forwarder per topic family.
    let mut duties: Vec<JoinHandle<()>> = Vec::new();
    for topic in [
        topics::TRANSCRIPT,
        topics::LLM_TOKEN,
        topics::LLM_TOOL_CALL,
        topics::CLIENT_TOOL_REQUEST,
        topics::BARGE_IN,
    ] {
        duties.push(spawn_control_egress(
            &broker,
            topic,
            conversation_id.clone(),
            writer_tx.clone(),
        ));
    }
    duties.push(spawn_audio_egress(
        &broker,
        conversation_id.clone(),
        writer_tx.clone(),
    ));

    // Inbound audio: drop-oldest buffer feeding a dedicated publisher.
    let ingress = Arc::new(IngressBuffer::new(state.cfg.ingress_buffer));
    {
        let ingress = Arc::clone(&ingress);
        let broker = Arc::clone(&broker);
        let conversation_id = conversation_id.clone();
        duties.push(tokio::spawn(async move {
            loop {
                let pcm = ingress.pop().await;
                let frame = AudioFrame::new(conversation_id.clone(), pcm);
                if let Err(e) = broker.publish(topics::AUDIO_IN, Payload::Audio(frame)).await {
                    warn!(target: "gateway", error = %e, "failed to publish inbound audio");
                }
            }
        }));
    }

    // Ingress loop drives the session lifecycle.
    let mut reason = "client_closed";
    loop {
        let msg = match stream.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                debug!(target: "gateway", conversation = %conversation_id, error = %e, "socket read error");
                reason = "socket_error";
                break;
            }
            None => break,
        };

        match msg {
            Message::Binary(pcm) => {
                if pcm.is_empty() {
                    continue;
                }
                let dropped = ingress.push(pcm);
                if dropped > 0 {
                    warn!(target: "gateway", conversation = %conversation_id, "inbound audio buffer full; dropped oldest frame");
                }
            }
            Message::Text(text) => {
                handle_client_control(&broker, &conversation_id, &text).await;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    // Teardown: lifecycle record first, then stop the duties.
    let disconnect = WireMessage::disconnected(conversation_id.clone(), reason);
    if let Err(e) = broker
        .publish(topics::CONNECTION_EVENTS, Payload::Control(disconnect))
        .await
    {
        warn!(target: "gateway", error = %e, "failed to publish disconnect event");
    }
    for duty in &duties {
        duty.abort();
    }
    writer.abort();
    info!(target: "gateway", conversation = %conversation_id, %reason, "session ended");
}

/// Client control messages: capability registration and tool responses.
/// Anything else (or malformed JSON) is logged and dropped.
async fn handle_client_control(broker: &Arc<Broker>, conversation_id: &str, text: &str) {
    let msg = match WireMessage::parse(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(target: "gateway", conversation = %conversation_id, error = %e, "dropping malformed client message");
            return;
        }
    };

    match msg {
        WireMessage::ClientCapabilities {
            client_id,
            capabilities,
            ..
        } => {
            let stamped = WireMessage::ClientCapabilities {
                conversation_id: conversation_id.to_string(),
                client_id,
                capabilities,
            };
            if let Err(e) = broker
                .publish(topics::CLIENT_CAPABILITIES, Payload::Control(stamped))
                .await
            {
                warn!(target: "gateway", error = %e, "failed to publish client capabilities");
            }
        }
        WireMessage::ToolResponse {
            tool_call_id,
            success,
            result,
            ..
        } => {
            let stamped = WireMessage::ToolResponse {
                tool_call_id,
                conversation_id: conversation_id.to_string(),
                success,
                result,
            };
            if let Err(e) = broker
                .publish(topics::CLIENT_TOOL_RESPONSE, Payload::Control(stamped))
                .await
            {
                warn!(target: "gateway", error = %e, "failed to publish tool response");
            }
        }
        other => {
            debug!(target: "gateway", conversation = %conversation_id, "dropping unexpected client message: {other:?}");
        }
    }
}

/// Forward control messages for this conversation from `topic` to the client.
fn spawn_control_egress(
    broker: &Arc<Broker>,
    topic: &str,
    conversation_id: String,
    writer: mpsc::Sender<Message>,
) -> JoinHandle<()> {
    let mut sub = broker.subscribe(topic, QosLevel::Batched);
    tokio::spawn(async move {
        while let Some(payload) = sub.recv().await {
            let Payload::Control(msg) = payload else {
                continue;
            };
            if msg.conversation_id() != conversation_id {
                continue;
            }
            if writer.send(Message::Text(msg.to_json())).await.is_err() {
                break;
            }
        }
    })
}

/// Forward the per-conversation audio stream verbatim: binary frames as
/// binary, envelopes as JSON, in broker order.
fn spawn_audio_egress(
    broker: &Arc<Broker>,
    conversation_id: String,
    writer: mpsc::Sender<Message>,
) -> JoinHandle<()> {
    let mut sub = broker.subscribe(
        &topics::audio_output_stream(&conversation_id),
        QosLevel::Realtime,
    );
    tokio::spawn(async move {
        while let Some(payload) = sub.recv().await {
            let msg = match payload {
                Payload::Audio(frame) => Message::Binary(frame.pcm),
                Payload::Control(envelope) => Message::Text(envelope.to_json()),
            };
            if writer.send(msg).await.is_err() {
                break;
            }
        }
    })
}
