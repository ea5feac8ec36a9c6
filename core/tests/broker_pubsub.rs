use parley_core::messages::{AudioFrame, WireMessage};
use parley_core::{Broker, Payload, QosLevel, Result};

fn token(conversation_id: &str, content: &str) -> Payload {
    Payload::Control(WireMessage::Token {
        conversation_id: conversation_id.to_string(),
        role: parley_core::Role::Assistant,
        content: content.to_string(),
    })
}

#[tokio::test]
async fn fan_out_reaches_every_subscriber() -> Result<()> {
    let broker = Broker::new();
    let mut a = broker.subscribe("t", QosLevel::Batched);
    let mut b = broker.subscribe("t", QosLevel::Batched);

    let delivered = broker.publish("t", token("c1", "hi")).await?;
    assert_eq!(delivered, 2);

    for sub in [&mut a, &mut b] {
        match sub.recv().await {
            Some(Payload::Control(WireMessage::Token { content, .. })) => {
                assert_eq!(content, "hi")
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
    Ok(())
}

#[tokio::test]
async fn publish_without_subscribers_is_not_an_error() -> Result<()> {
    let broker = Broker::new();
    let delivered = broker.publish("nobody", token("c1", "x")).await?;
    assert_eq!(delivered, 0);
    let stats = broker.stats("nobody").expect("stats exist");
    assert_eq!(stats.total_published, 1);
    assert_eq!(stats.total_delivered, 0);
    Ok(())
}

#[tokio::test]
async fn late_subscribers_miss_earlier_messages() -> Result<()> {
    let broker = Broker::new();
    broker.publish("t", token("c1", "before")).await?;

    let mut sub = broker.subscribe("t", QosLevel::Batched);
    broker.publish("t", token("c1", "after")).await?;

    match sub.recv().await {
        Some(Payload::Control(WireMessage::Token { content, .. })) => {
            assert_eq!(content, "after")
        }
        other => panic!("unexpected payload: {other:?}"),
    }
    assert!(sub.try_recv().is_none());
    Ok(())
}

#[tokio::test]
async fn realtime_drops_audio_for_slow_subscriber() -> Result<()> {
    let broker = Broker::new();
    // Never consumed: the 64-slot realtime queue fills and further frames drop.
    let _sub = broker.subscribe("audio", QosLevel::Realtime);

    for i in 0..200u16 {
        let frame = AudioFrame::new("c1", i.to_le_bytes().to_vec());
        broker.publish("audio", Payload::Audio(frame)).await?;
    }

    let stats = broker.stats("audio").expect("stats exist");
    assert_eq!(stats.total_published, 200);
    assert!(stats.dropped > 0, "expected drops under backpressure");
    assert_eq!(stats.total_delivered + stats.dropped, 200);
    Ok(())
}

#[tokio::test]
async fn frames_arrive_in_publish_order() -> Result<()> {
    let broker = Broker::new();
    let mut sub = broker.subscribe("audio", QosLevel::Batched);

    for i in 0..32u16 {
        let frame = AudioFrame::new("c1", i.to_le_bytes().to_vec());
        broker.publish("audio", Payload::Audio(frame)).await?;
    }

    for i in 0..32u16 {
        match sub.recv().await {
            Some(Payload::Audio(frame)) => assert_eq!(frame.pcm, i.to_le_bytes().to_vec()),
            other => panic!("unexpected payload: {other:?}"),
        }
    }
    Ok(())
}

#[tokio::test]
async fn unsubscribe_stops_delivery() -> Result<()> {
    let broker = Broker::new();
    let sub = broker.subscribe("t", QosLevel::Batched);
    let id = sub.id.clone();

    broker.unsubscribe(&id);
    let delivered = broker.publish("t", token("c1", "x")).await?;
    assert_eq!(delivered, 0);

    // Unknown ids are a no-op.
    broker.unsubscribe(&id);
    broker.unsubscribe("sub_missing");
    Ok(())
}

#[tokio::test]
async fn dropped_receiver_is_pruned_on_next_publish() -> Result<()> {
    let broker = Broker::new();
    let sub = broker.subscribe("t", QosLevel::Batched);
    drop(sub);

    broker.publish("t", token("c1", "x")).await?;
    let stats = broker.stats("t").expect("stats exist");
    assert_eq!(stats.active_subscriptions, 0);
    Ok(())
}
