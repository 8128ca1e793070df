// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use broker_receiver::{
    codec::{JsonCodec, TextCodec},
    config::BrokerConfig,
    dispatcher::Dispatcher,
    errors::{CodecError, HandlerError, ProcessingError},
    handler::{handler_fn, MessageContext},
    lifecycle::Managed,
    memory::InMemoryBroker,
    message::OutboundMessage,
    policy::{from_fn, Disposition, RollbackOnException},
};
use serde::{Deserialize, Serialize};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::{sleep, Instant};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderMsg {
    id: u32,
    item: String,
}

fn dispatcher(broker: &InMemoryBroker) -> Dispatcher {
    Dispatcher::new(
        BrokerConfig::new("memory://"),
        Arc::new(broker.clone()),
        Arc::new(broker.clone()),
    )
}

async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(120);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn orders_are_decoded_and_bad_payloads_go_through_the_policy() {
    let broker = InMemoryBroker::new();
    let mut dispatcher = dispatcher(&broker);

    let orders = Arc::new(Mutex::new(vec![]));
    let failures = Arc::new(Mutex::new(vec![]));

    let sink = orders.clone();
    let failed = failures.clone();
    let receiver = dispatcher.register(
        "queue:orders",
        JsonCodec::<OrderMsg>::new(),
        handler_fn(move |_: MessageContext, order: OrderMsg| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(order);
                Ok::<(), HandlerError>(())
            }
        }),
        Arc::new(from_fn(move |text, err| {
            let is_decode_error = matches!(
                err,
                ProcessingError::Codec(CodecError::ParsePayloadError(_))
            );
            failed
                .lock()
                .unwrap()
                .push((text.map(str::to_owned), is_decode_error));
            Disposition::Acknowledge
        })),
    );
    let sender = dispatcher.create_sender("queue:orders", false);

    dispatcher.start().await;
    eventually("receiver to listen", || receiver.is_receiving()).await;

    sender
        .send(&OrderMsg {
            id: 1,
            item: "book".to_owned(),
        })
        .await
        .unwrap();
    sender.send_json("{\"id\": 2, \"item\":").await.unwrap();
    sender
        .send(&OrderMsg {
            id: 3,
            item: "pen".to_owned(),
        })
        .await
        .unwrap();

    eventually("both orders", || orders.lock().unwrap().len() == 2).await;

    assert_eq!(
        orders.lock().unwrap().iter().map(|o| o.id).collect::<Vec<_>>(),
        vec![1, 3]
    );
    assert_eq!(
        *failures.lock().unwrap(),
        vec![(Some("{\"id\": 2, \"item\":".to_owned()), true)]
    );
    assert!(receiver.is_receiving());
    assert_eq!(broker.pending("queue:orders").await, 0);

    dispatcher.stop().await;
    assert!(!receiver.is_receiving());
}

#[tokio::test(start_paused = true)]
async fn rolled_back_messages_are_redelivered() {
    let broker = InMemoryBroker::new();
    let mut dispatcher = dispatcher(&broker);

    let attempts = Arc::new(Mutex::new(vec![]));
    let sink = attempts.clone();
    let receiver = dispatcher.register(
        "work",
        TextCodec,
        handler_fn(move |ctx: MessageContext, _: String| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(ctx.is_redelivered());
                if ctx.is_redelivered() {
                    Ok(())
                } else {
                    Err::<(), HandlerError>("first attempt fails".into())
                }
            }
        }),
        Arc::new(RollbackOnException),
    );

    dispatcher.start().await;
    eventually("receiver to listen", || receiver.is_receiving()).await;
    broker.publish("work", OutboundMessage::new("job")).await;

    eventually("redelivery", || attempts.lock().unwrap().len() == 2).await;
    assert_eq!(*attempts.lock().unwrap(), vec![false, true]);

    dispatcher.stop().await;
    assert_eq!(broker.pending("work").await, 0);
}

#[tokio::test(start_paused = true)]
async fn replies_carry_the_request_correlation_id() {
    let broker = InMemoryBroker::new();
    let mut dispatcher = dispatcher(&broker);
    let replies = dispatcher.create_sender("queue:replies", false);

    dispatcher.register_with_ack_flag(
        "queue:requests",
        TextCodec,
        handler_fn(move |_: MessageContext, request: String| {
            let replies = replies.clone();
            async move {
                replies.send_json(&format!("\"re: {}\"", request)).await?;
                Ok::<(), HandlerError>(())
            }
        }),
        false,
    );

    let seen = Arc::new(Mutex::new(vec![]));
    let sink = seen.clone();
    dispatcher.register_with_ack_flag(
        "queue:replies",
        TextCodec,
        handler_fn(move |ctx: MessageContext, reply: String| {
            let sink = sink.clone();
            async move {
                sink.lock()
                    .unwrap()
                    .push((reply, ctx.correlation_id().map(str::to_owned)));
                Ok::<(), HandlerError>(())
            }
        }),
        false,
    );

    dispatcher.start().await;
    broker
        .publish(
            "queue:requests",
            OutboundMessage::new("ping").with_correlation_id("abc-123"),
        )
        .await;

    eventually("reply", || !seen.lock().unwrap().is_empty()).await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![("\"re: ping\"".to_owned(), Some("abc-123".to_owned()))]
    );

    dispatcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn topics_fan_out_to_every_receiver() {
    let broker = InMemoryBroker::new();
    let mut dispatcher = dispatcher(&broker);

    let received = Arc::new(Mutex::new(vec![]));
    let mut receivers = vec![];
    for name in ["left", "right"] {
        let sink = received.clone();
        receivers.push(dispatcher.register_with_ack_flag(
            "topic:prices",
            TextCodec,
            handler_fn(move |_: MessageContext, price: String| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push((name, price));
                    Ok::<(), HandlerError>(())
                }
            }),
            true,
        ));
    }

    dispatcher.start().await;
    eventually("subscribers", || receivers.iter().all(|r| r.is_receiving())).await;

    dispatcher
        .create_sender("topic:prices", false)
        .send_json("42")
        .await
        .unwrap();

    eventually("fan out", || received.lock().unwrap().len() == 2).await;
    let mut received = received.lock().unwrap().clone();
    received.sort();
    assert_eq!(
        received,
        vec![("left", "42".to_owned()), ("right", "42".to_owned())]
    );

    dispatcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn receivers_recover_from_closed_consumers_and_refused_connections() {
    let broker = InMemoryBroker::new();
    let mut dispatcher = dispatcher(&broker);

    let received = Arc::new(Mutex::new(vec![]));
    let sink = received.clone();
    let receiver = dispatcher.register_with_ack_flag(
        "queue:events",
        TextCodec,
        handler_fn(move |_: MessageContext, event: String| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(event);
                Ok::<(), HandlerError>(())
            }
        }),
        false,
    );

    broker.fail_next_connections(2);
    let started = Instant::now();
    dispatcher.start().await;
    eventually("receiver to listen", || receiver.is_receiving()).await;
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(broker.connections_created(), 1);

    broker.close_consumers().await;
    broker.publish("queue:events", OutboundMessage::new("after close")).await;

    eventually("event", || !received.lock().unwrap().is_empty()).await;
    assert_eq!(*received.lock().unwrap(), vec!["after close".to_owned()]);
    assert_eq!(broker.connections_created(), 2);
    assert_eq!(receiver.state().consecutive_errors(), 0);

    dispatcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn health_probes_follow_receivers_and_broker() {
    let broker = InMemoryBroker::new();
    let mut dispatcher = dispatcher(&broker).with_name("main");
    let receiver = dispatcher.register_with_ack_flag(
        "queue:health",
        TextCodec,
        handler_fn(|_: MessageContext, _: String| async { Ok::<(), HandlerError>(()) }),
        true,
    );

    let checks = dispatcher.health_checks();
    assert_eq!(checks[0].0, "receiver queue:health");
    assert_eq!(checks[1].0, "broker_main");
    assert!(!checks[0].1.check().await.is_healthy());

    dispatcher.start().await;
    eventually("receiver to listen", || receiver.is_receiving()).await;

    let status = checks[0].1.check().await;
    assert!(status.is_healthy());
    assert_eq!(status.message(), Some("Is receiving from queue:health"));
    assert!(checks[1].1.check().await.is_healthy());

    dispatcher.stop().await;
    assert!(!checks[0].1.check().await.is_healthy());
}
