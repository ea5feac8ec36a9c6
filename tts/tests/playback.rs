//! Playback ordering, interruption and flag lifecycle.

use std::sync::Arc;
use std::time::Duration;

use parley_core::broker::{Broker, Payload, QosLevel};
use parley_core::kv::{keys, TtlStore};
use parley_core::messages::{TtsControlAction, WireMessage};
use parley_core::{topics, Subscription};
use parley_tts::{ToneConfig, ToneSynthesizer, TtsWorker, TtsWorkerConfig};
use tokio::time::timeout;

async fn start_worker(
    broker: &Arc<Broker>,
    store: &Arc<TtlStore>,
    tone: ToneConfig,
) -> tokio::task::JoinHandle<()> {
    let worker = TtsWorker::new(
        Arc::clone(broker),
        Arc::clone(store),
        Arc::new(ToneSynthesizer::new(tone)),
        TtsWorkerConfig::default(),
    );
    let handle = worker.start().await.expect("worker starts");
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle
}

async fn send_sentence(broker: &Arc<Broker>, id: &str, seq: u64, text: &str) {
    broker
        .publish(
            topics::TTS_REQUEST,
            Payload::Control(WireMessage::SentenceRequest {
                conversation_id: id.to_string(),
                text: text.to_string(),
                voice_id: "default".into(),
                sequence_number: seq,
            }),
        )
        .await
        .expect("publish sentence request");
}

#[derive(Debug, PartialEq)]
enum Item {
    Start,
    Frame(usize),
    End(Option<String>),
    Error,
}

async fn collect_items(sub: &mut Subscription, quiet: Duration) -> Vec<Item> {
    let mut items = Vec::new();
    while let Ok(Some(payload)) = timeout(quiet, sub.recv()).await {
        match payload {
            Payload::Control(WireMessage::AudioStreamStart {
                sample_rate,
                channels,
                format,
                ..
            }) => {
                assert_eq!(sample_rate, 16_000);
                assert_eq!(channels, 1);
                assert_eq!(format, "pcm_s16le");
                items.push(Item::Start);
            }
            Payload::Control(WireMessage::AudioStreamEnd { reason, .. }) => {
                items.push(Item::End(reason));
            }
            Payload::Control(WireMessage::AudioStreamError { .. }) => items.push(Item::Error),
            Payload::Audio(frame) => items.push(Item::Frame(frame.pcm.len())),
            other => panic!("unexpected payload on audio topic: {other:?}"),
        }
    }
    items
}

#[tokio::test]
async fn five_sentences_play_in_strict_order() {
    let broker = Broker::shared();
    let store = Arc::new(TtlStore::new());
    let handle = start_worker(&broker, &store, ToneConfig::default()).await;

    let mut audio = broker.subscribe(&topics::audio_output_stream("c1"), QosLevel::Batched);

    for seq in 0..5 {
        send_sentence(&broker, "c1", seq, "One sentence to speak.").await;
    }

    let items = collect_items(&mut audio, Duration::from_millis(800)).await;

    // Exactly five start/end pairs, each with at least one frame between,
    // never interleaved.
    let mut pairs = 0;
    let mut open = false;
    let mut frames_in_current = 0;
    for item in &items {
        match item {
            Item::Start => {
                assert!(!open, "start before the previous sentence ended");
                open = true;
                frames_in_current = 0;
            }
            Item::Frame(len) => {
                assert!(open, "frame outside an envelope");
                assert!(*len <= 4_096, "oversized chunk: {len}");
                assert!(*len % 2 == 0, "frames carry whole s16le samples");
                frames_in_current += 1;
            }
            Item::End(reason) => {
                assert!(open, "end without start");
                assert_eq!(reason.as_deref(), None);
                assert!(frames_in_current > 0, "sentence without audio");
                open = false;
                pairs += 1;
            }
            Item::Error => panic!("unexpected error envelope"),
        }
    }
    assert_eq!(pairs, 5);
    assert!(!open);

    // Flag cleared once the queue drained.
    assert!(!store.exists(&keys::tts_active("c1")));
    handle.abort();
}

#[tokio::test]
async fn flag_is_set_while_streaming() {
    let broker = Broker::shared();
    let store = Arc::new(TtlStore::new());
    let handle = start_worker(
        &broker,
        &store,
        ToneConfig {
            chunk_delay: Duration::from_millis(20),
            ..ToneConfig::default()
        },
    )
    .await;

    let mut audio = broker.subscribe(&topics::audio_output_stream("c1"), QosLevel::Batched);
    send_sentence(&broker, "c1", 0, "A reasonably long sentence to keep the stream open.").await;

    // Wait for the start envelope, then sample the flag mid-stream.
    match timeout(Duration::from_secs(2), audio.recv()).await {
        Ok(Some(Payload::Control(WireMessage::AudioStreamStart { .. }))) => {}
        other => panic!("expected stream start, got {other:?}"),
    }
    assert!(store.exists(&keys::tts_active("c1")));

    // Drain to completion; the flag must be gone afterwards.
    let items = collect_items(&mut audio, Duration::from_millis(600)).await;
    assert!(items.iter().any(|i| matches!(i, Item::End(None))));
    assert!(!store.exists(&keys::tts_active("c1")));
    handle.abort();
}

#[tokio::test]
async fn barge_in_interrupts_and_drops_the_queue() {
    let broker = Broker::shared();
    let store = Arc::new(TtlStore::new());
    let handle = start_worker(
        &broker,
        &store,
        ToneConfig {
            chunk_delay: Duration::from_millis(30),
            ..ToneConfig::default()
        },
    )
    .await;

    let mut audio = broker.subscribe(&topics::audio_output_stream("c1"), QosLevel::Batched);

    // A long active sentence plus a queued one that must never play.
    send_sentence(&broker, "c1", 0, &"very long sentence ".repeat(20)).await;
    send_sentence(&broker, "c1", 1, "Queued and doomed.").await;

    // Let the first frames flow.
    match timeout(Duration::from_secs(2), audio.recv()).await {
        Ok(Some(Payload::Control(WireMessage::AudioStreamStart { .. }))) => {}
        other => panic!("expected stream start, got {other:?}"),
    }
    match timeout(Duration::from_secs(2), audio.recv()).await {
        Ok(Some(Payload::Audio(_))) => {}
        other => panic!("expected a frame, got {other:?}"),
    }

    broker
        .publish(
            topics::BARGE_IN,
            Payload::Control(WireMessage::BargeInNotification {
                conversation_id: "c1".into(),
                timestamp_ms: parley_core::now_ms(),
            }),
        )
        .await
        .expect("publish barge-in");

    let items = collect_items(&mut audio, Duration::from_millis(500)).await;
    let end_idx = items
        .iter()
        .position(|i| matches!(i, Item::End(Some(r)) if r == "interrupted"))
        .expect("interrupted end envelope");
    assert!(
        !items[end_idx..].iter().any(|i| matches!(i, Item::Frame(_))),
        "no frames may follow the interrupted end"
    );
    assert!(
        !items.iter().any(|i| *i == Item::Start),
        "the queued sentence must not start"
    );
    assert!(!store.exists(&keys::tts_active("c1")));
    handle.abort();
}

#[tokio::test]
async fn stop_command_behaves_like_barge_in() {
    let broker = Broker::shared();
    let store = Arc::new(TtlStore::new());
    let handle = start_worker(
        &broker,
        &store,
        ToneConfig {
            chunk_delay: Duration::from_millis(30),
            ..ToneConfig::default()
        },
    )
    .await;

    let mut audio = broker.subscribe(&topics::audio_output_stream("c1"), QosLevel::Batched);
    send_sentence(&broker, "c1", 0, &"keep going ".repeat(30)).await;

    match timeout(Duration::from_secs(2), audio.recv()).await {
        Ok(Some(Payload::Control(WireMessage::AudioStreamStart { .. }))) => {}
        other => panic!("expected stream start, got {other:?}"),
    }

    broker
        .publish(
            topics::TTS_CONTROL,
            Payload::Control(WireMessage::TtsControl {
                conversation_id: "c1".into(),
                action: TtsControlAction::Stop,
            }),
        )
        .await
        .expect("publish stop");

    let items = collect_items(&mut audio, Duration::from_millis(500)).await;
    assert!(items
        .iter()
        .any(|i| matches!(i, Item::End(Some(r)) if r == "interrupted")));
    assert!(!store.exists(&keys::tts_active("c1")));
    handle.abort();
}

#[tokio::test]
async fn engine_failure_publishes_error_and_goes_idle() {
    let broker = Broker::shared();
    let store = Arc::new(TtlStore::new());
    let handle = start_worker(
        &broker,
        &store,
        ToneConfig {
            fail_after_chunks: Some(1),
            ..ToneConfig::default()
        },
    )
    .await;

    let mut audio = broker.subscribe(&topics::audio_output_stream("c1"), QosLevel::Batched);
    send_sentence(&broker, "c1", 0, &"doomed sentence ".repeat(20)).await;

    let items = collect_items(&mut audio, Duration::from_millis(600)).await;
    assert!(items.contains(&Item::Error), "expected error envelope: {items:?}");
    assert!(!store.exists(&keys::tts_active("c1")));

    // The worker survives and serves the next sentence normally.
    handle.abort();
}

#[tokio::test]
async fn disconnect_cleanup_is_idempotent_and_state_restarts_clean() {
    let broker = Broker::shared();
    let store = Arc::new(TtlStore::new());
    let handle = start_worker(
        &broker,
        &store,
        ToneConfig {
            chunk_delay: Duration::from_millis(20),
            ..ToneConfig::default()
        },
    )
    .await;

    let mut audio = broker.subscribe(&topics::audio_output_stream("c1"), QosLevel::Batched);
    send_sentence(&broker, "c1", 0, &"speaking at disconnect ".repeat(10)).await;

    match timeout(Duration::from_secs(2), audio.recv()).await {
        Ok(Some(Payload::Control(WireMessage::AudioStreamStart { .. }))) => {}
        other => panic!("expected stream start, got {other:?}"),
    }

    for _ in 0..2 {
        broker
            .publish(
                topics::CONNECTION_EVENTS,
                Payload::Control(WireMessage::disconnected("c1", "client_closed")),
            )
            .await
            .expect("publish disconnect");
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!store.exists(&keys::tts_active("c1")));

    // Fresh work for the same id plays from a clean slate.
    let mut drained = collect_items(&mut audio, Duration::from_millis(300)).await;
    drained.clear();
    send_sentence(&broker, "c1", 1, "Back again.").await;
    let items = collect_items(&mut audio, Duration::from_millis(800)).await;
    assert!(items.iter().any(|i| *i == Item::Start));
    assert!(items.iter().any(|i| matches!(i, Item::End(None))));
    handle.abort();
}
