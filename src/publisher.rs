// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! A [`Sender`] publishes single messages to one destination. Every call borrows
//! a connection from the factory, opens a fresh session and producer, sends, and
//! closes producer, session and connection again. Nothing is reused across
//! calls, pooling is left to the connection factory.
//!
//! When called while a message is being processed, the ambient correlation id is
//! copied to outgoing messages that do not carry one of their own. The current
//! OpenTelemetry context is propagated in the message properties.

use crate::{
    broker::{
        close_silently, AckMode, BrokerConnection, BrokerSession, ConnectionFactory,
        MessageProducer,
    },
    correlation,
    destination::{self, Destination},
    errors::{HandlerError, SendError},
    message::OutboundMessage,
    otel,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Applied, in registration order, to every outgoing message right before it is sent.
pub trait SenderFilter: Send + Sync {
    fn apply(&self, message: &mut OutboundMessage);
}

/// Publishes messages to one destination.
#[derive(Clone)]
pub struct Sender {
    factory: Arc<dyn ConnectionFactory>,
    destination: String,
    persistent: bool,
    ttl: Option<Duration>,
    filters: Vec<Arc<dyn SenderFilter>>,
}

impl Sender {
    /// Creates a sender for the logical `destination`.
    ///
    /// # Parameters
    /// * `factory` - Connection factory, usually pooled
    /// * `destination` - Logical destination, e.g. `queue:orders`
    /// * `persistent` - Whether messages survive a broker restart
    /// * `ttl` - Time after which the broker may discard undelivered messages
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        destination: &str,
        persistent: bool,
        ttl: Option<Duration>,
    ) -> Self {
        Sender {
            factory,
            destination: destination.to_owned(),
            persistent,
            ttl,
            filters: vec![],
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn SenderFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Serializes `value` as JSON and sends it as a text message.
    pub async fn send<T>(&self, value: &T) -> Result<(), SendError>
    where
        T: Serialize + ?Sized,
    {
        let json = serde_json::to_string(value)
            .map_err(|err| SendError::SerializationError(err.to_string()))?;
        self.send_json(&json).await
    }

    /// Sends an already serialized JSON document as a text message.
    pub async fn send_json(&self, json: &str) -> Result<(), SendError> {
        self.send_message(OutboundMessage::new(json)).await
    }

    /// Sends a fully built message.
    pub async fn send_message(&self, message: OutboundMessage) -> Result<(), SendError> {
        self.dispatch(move |_| Ok(message)).await
    }

    /// Sends the message produced by `build`, which receives the resolved
    /// destination and runs once the producer is open.
    pub async fn send_with<F>(&self, build: F) -> Result<(), SendError>
    where
        F: FnOnce(&Destination) -> Result<OutboundMessage, HandlerError> + Send,
    {
        self.dispatch(move |destination| build(destination).map_err(SendError::BuilderError))
            .await
    }

    async fn dispatch<F>(&self, build: F) -> Result<(), SendError>
    where
        F: FnOnce(&Destination) -> Result<OutboundMessage, SendError> + Send,
    {
        let destination = destination::resolve(&self.destination);

        let connection = self.factory.create_connection().await?;
        let result = self
            .dispatch_on(connection.as_ref(), &destination, build)
            .await;
        close_silently("connection", connection.close()).await;

        if let Err(err) = &result {
            error!(
                error = err.to_string(),
                destination = self.destination,
                "error publishing message"
            );
        }
        result
    }

    async fn dispatch_on<F>(
        &self,
        connection: &dyn BrokerConnection,
        destination: &Destination,
        build: F,
    ) -> Result<(), SendError>
    where
        F: FnOnce(&Destination) -> Result<OutboundMessage, SendError> + Send,
    {
        let session = connection.create_session(AckMode::Auto).await?;
        let result = self.dispatch_in(session.as_ref(), destination, build).await;
        close_silently("session", session.close()).await;
        result
    }

    async fn dispatch_in<F>(
        &self,
        session: &dyn BrokerSession,
        destination: &Destination,
        build: F,
    ) -> Result<(), SendError>
    where
        F: FnOnce(&Destination) -> Result<OutboundMessage, SendError> + Send,
    {
        let mut producer = session.create_producer(destination).await?;
        let result = self.deliver(producer.as_mut(), destination, build).await;
        close_silently("producer", producer.close()).await;
        result
    }

    async fn deliver<F>(
        &self,
        producer: &mut dyn MessageProducer,
        destination: &Destination,
        build: F,
    ) -> Result<(), SendError>
    where
        F: FnOnce(&Destination) -> Result<OutboundMessage, SendError> + Send,
    {
        let mut message = build(destination)?;

        if message.correlation_id().is_none() {
            message.set_correlation_id(correlation::current());
        }

        for filter in &self.filters {
            filter.apply(&mut message);
        }

        message.set_persistent(self.persistent);
        if self.ttl.is_some() {
            message.set_ttl(self.ttl);
        }
        if message.message_id().is_none() {
            message.set_message_id(&Uuid::new_v4().to_string());
        }
        otel::inject(&Context::current(), message.properties_mut());

        info!(destination = self.destination, "sending message");
        debug!(payload = message.payload().as_text().unwrap_or_default(), "payload");

        producer.send(message).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{
            MockBrokerConnection, MockBrokerSession, MockConnectionFactory, MockMessageProducer,
        },
        errors::BrokerError,
        message::Payload,
    };
    use mockall::Sequence;
    use std::sync::Mutex;

    struct Sent(Arc<Mutex<Vec<OutboundMessage>>>);

    /// Wires a factory whose single connection, session and producer must each be
    /// closed exactly once, producer first.
    fn mock_factory(
        expected: Destination,
        send_result: Result<(), BrokerError>,
    ) -> (MockConnectionFactory, Sent) {
        let sent = Arc::new(Mutex::new(vec![]));
        let mut seq = Sequence::new();

        let mut producer = MockMessageProducer::new();
        let sink = sent.clone();
        producer.expect_send().returning(move |message| {
            sink.lock().unwrap().push(message);
            send_result.clone()
        });
        producer
            .expect_close()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(BrokerError::CloseError("ignored".to_owned())));

        let mut session = MockBrokerSession::new();
        session
            .expect_create_producer()
            .withf(move |destination| *destination == expected)
            .times(1)
            .return_once(move |_| Ok(Box::new(producer)));
        session
            .expect_close()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));

        let mut connection = MockBrokerConnection::new();
        connection
            .expect_create_session()
            .withf(|mode| *mode == AckMode::Auto)
            .times(1)
            .return_once(move |_| Ok(Box::new(session)));
        connection
            .expect_close()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));

        let mut factory = MockConnectionFactory::new();
        factory
            .expect_create_connection()
            .times(1)
            .return_once(move || Ok(Box::new(connection)));

        (factory, Sent(sent))
    }

    #[tokio::test]
    async fn sends_built_message_and_closes_everything() {
        let (factory, sent) = mock_factory(Destination::queue("myQueue"), Ok(()));
        let sender = Sender::new(Arc::new(factory), "myQueue", false, None);

        sender
            .send_with(|destination| {
                Ok(OutboundMessage::new("{'a': 2}")
                    .with_correlation_id("my-id")
                    .with_reply_to(destination.clone()))
            })
            .await
            .unwrap();

        let sent = sent.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload().as_text(), Some("{'a': 2}"));
        assert_eq!(sent[0].correlation_id(), Some("my-id"));
        assert_eq!(sent[0].reply_to(), Some(&Destination::queue("myQueue")));
        assert!(!sent[0].is_persistent());
        assert!(sent[0].message_id().is_some());
    }

    #[tokio::test]
    async fn failing_builder_still_closes_everything() {
        let (factory, sent) = mock_factory(Destination::queue("myQueue"), Ok(()));
        let sender = Sender::new(Arc::new(factory), "queue:myQueue", false, None);

        let result = sender
            .send_with(|_| Err::<OutboundMessage, HandlerError>("Test".into()))
            .await;

        assert!(matches!(result, Err(SendError::BuilderError(_))));
        assert!(sent.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn broker_failure_is_returned() {
        let (factory, _) = mock_factory(
            Destination::topic("prices"),
            Err(BrokerError::PublishingError("nope".to_owned())),
        );
        let sender = Sender::new(Arc::new(factory), "topic:prices", true, None);

        let result = sender.send_json("{}").await;

        assert!(matches!(
            result,
            Err(SendError::Broker(BrokerError::PublishingError(_)))
        ));
    }

    #[tokio::test]
    async fn applies_persistence_ttl_and_serializes() {
        #[derive(Serialize)]
        struct Animal {
            name: &'static str,
        }

        let (factory, sent) = mock_factory(Destination::queue("animals"), Ok(()));
        let sender = Sender::new(
            Arc::new(factory),
            "animals",
            true,
            Some(Duration::from_secs(30)),
        );

        sender.send(&Animal { name: "cat" }).await.unwrap();

        let sent = sent.0.lock().unwrap();
        assert_eq!(sent[0].payload().as_text(), Some(r#"{"name":"cat"}"#));
        assert!(sent[0].is_persistent());
        assert_eq!(sent[0].ttl(), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn ambient_correlation_id_fills_only_missing_ids() {
        let (factory, sent) = mock_factory(Destination::queue("q"), Ok(()));
        let sender = Sender::new(Arc::new(factory), "q", false, None);
        correlation::scope(Some("ambient".to_owned()), sender.send_json("{}"))
            .await
            .unwrap();
        assert_eq!(sent.0.lock().unwrap()[0].correlation_id(), Some("ambient"));

        let (factory, sent) = mock_factory(Destination::queue("q"), Ok(()));
        let sender = Sender::new(Arc::new(factory), "q", false, None);
        correlation::scope(
            Some("ambient".to_owned()),
            sender.send_message(OutboundMessage::new("{}").with_correlation_id("own")),
        )
        .await
        .unwrap();
        assert_eq!(sent.0.lock().unwrap()[0].correlation_id(), Some("own"));
    }

    #[tokio::test]
    async fn filters_run_in_order_before_sending() {
        struct Tag(&'static str);

        impl SenderFilter for Tag {
            fn apply(&self, message: &mut OutboundMessage) {
                let trail = message
                    .properties()
                    .get("trail")
                    .cloned()
                    .unwrap_or_default();
                message
                    .properties_mut()
                    .insert("trail".to_owned(), format!("{}{}", trail, self.0));
            }
        }

        let (factory, sent) = mock_factory(Destination::queue("q"), Ok(()));
        let sender = Sender::new(Arc::new(factory), "q", false, None)
            .with_filter(Arc::new(Tag("a")))
            .with_filter(Arc::new(Tag("b")));

        sender
            .send_message(OutboundMessage::new(Payload::Text("x".to_owned())))
            .await
            .unwrap();

        assert_eq!(
            sent.0.lock().unwrap()[0].properties().get("trail").map(String::as_str),
            Some("ab")
        );
    }
}
