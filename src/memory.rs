// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! An in-process broker implementing the broker traits, used by tests and by
//! applications that want the receiver engine without an external broker.
//!
//! Queues deliver each message to one consumer in FIFO order. Messages taken by a
//! client-acknowledged consumer stay in flight until acknowledged; rolling back,
//! or closing the consumer, puts them back at the head of the queue flagged as
//! redelivered. Topics fan out to the subscribers connected at publish time.
//!
//! Faults can be injected: [`InMemoryBroker::fail_next_connections`] makes
//! connection attempts fail and [`InMemoryBroker::close_consumers`] closes every
//! live consumer under the engine's feet.

use crate::{
    broker::{
        AckMode, BrokerConnection, BrokerSession, ConnectionFactory, MessageConsumer,
        MessageProducer,
    },
    destination::{self, Destination, DestinationKind},
    errors::BrokerError,
    message::{InboundMessage, OutboundMessage},
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, Notify},
    time::Instant,
};
use tracing::{debug, warn};

struct Stored {
    message: InboundMessage,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Queue {
    messages: Mutex<VecDeque<Stored>>,
    available: Notify,
}

impl Queue {
    async fn push(&self, stored: Stored) {
        self.messages.lock().await.push_back(stored);
        self.available.notify_one();
    }

    /// Puts messages back at the head, keeping their relative order.
    async fn requeue(&self, messages: Vec<InboundMessage>) {
        let mut queue = self.messages.lock().await;
        for message in messages.into_iter().rev() {
            queue.push_front(Stored {
                message: message.redelivered(true),
                expires_at: None,
            });
        }
        self.available.notify_one();
    }

    async fn pop(&self) -> Option<InboundMessage> {
        let mut queue = self.messages.lock().await;
        let now = Instant::now();
        while let Some(stored) = queue.pop_front() {
            if stored.expires_at.is_some_and(|at| at <= now) {
                debug!(tag = stored.message.delivery_tag(), "dropping expired message");
                continue;
            }
            return Some(stored.message);
        }
        None
    }

    async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }
}

#[derive(Default)]
struct State {
    queues: Mutex<HashMap<String, Arc<Queue>>>,
    subscriptions: Mutex<HashMap<String, Vec<(u64, Arc<Queue>)>>>,
    failing_connections: AtomicU32,
    connections_created: AtomicU64,
    consumer_epoch: AtomicU64,
    next_id: AtomicU64,
}

impl State {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn queue(&self, name: &str) -> Arc<Queue> {
        self.queues
            .lock()
            .await
            .entry(name.to_owned())
            .or_default()
            .clone()
    }

    fn store(&self, message: OutboundMessage) -> Stored {
        let expires_at = message.ttl.map(|ttl| Instant::now() + ttl);
        let mut inbound = InboundMessage::new(self.next_id(), message.payload)
            .with_properties(message.properties);
        inbound.correlation_id = message.correlation_id;
        Stored {
            message: inbound,
            expires_at,
        }
    }

    async fn publish(&self, destination: &Destination, message: OutboundMessage) {
        match destination.kind() {
            DestinationKind::Queue => {
                let queue = self.queue(destination.name()).await;
                queue.push(self.store(message)).await;
            }
            DestinationKind::Topic => {
                let subscribers: Vec<Arc<Queue>> = self
                    .subscriptions
                    .lock()
                    .await
                    .get(destination.name())
                    .map(|subs| subs.iter().map(|(_, queue)| queue.clone()).collect())
                    .unwrap_or_default();

                if subscribers.is_empty() {
                    debug!(topic = destination.name(), "no subscribers, message dropped");
                }
                for queue in subscribers {
                    queue.push(self.store(message.clone())).await;
                }
            }
        }
    }

    async fn subscribe(&self, topic: &str) -> (u64, Arc<Queue>) {
        let id = self.next_id();
        let queue = Arc::new(Queue::default());
        self.subscriptions
            .lock()
            .await
            .entry(topic.to_owned())
            .or_default()
            .push((id, queue.clone()));
        (id, queue)
    }

    async fn unsubscribe(&self, topic: &str, id: u64) {
        if let Some(subs) = self.subscriptions.lock().await.get_mut(topic) {
            subs.retain(|(sub_id, _)| *sub_id != id);
        }
    }
}

/// In-process broker. Cloning yields another handle on the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<State>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_next_connections(&self, count: u32) {
        self.state
            .failing_connections
            .store(count, Ordering::SeqCst);
    }

    /// Number of connections handed out so far.
    pub fn connections_created(&self) -> u64 {
        self.state.connections_created.load(Ordering::SeqCst)
    }

    /// Closes every live consumer. Their next operation fails with
    /// [`BrokerError::ConsumerClosed`].
    pub async fn close_consumers(&self) {
        warn!("closing all consumers");
        self.state.consumer_epoch.fetch_add(1, Ordering::SeqCst);

        for queue in self.state.queues.lock().await.values() {
            queue.available.notify_waiters();
        }
        for subs in self.state.subscriptions.lock().await.values() {
            for (_, queue) in subs {
                queue.available.notify_waiters();
            }
        }
    }

    /// Publishes directly, bypassing connections and sessions.
    pub async fn publish(&self, destination: &str, message: OutboundMessage) {
        self.state
            .publish(&destination::resolve(destination), message)
            .await;
    }

    /// Number of messages waiting on a queue, not counting those in flight.
    pub async fn pending(&self, queue: &str) -> usize {
        let destination = destination::resolve(queue);
        let queues = self.state.queues.lock().await;
        match queues.get(destination.name()) {
            Some(queue) => queue.len().await,
            None => 0,
        }
    }
}

#[async_trait]
impl ConnectionFactory for InMemoryBroker {
    async fn create_connection(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let refused = self
            .state
            .failing_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BrokerError::ConnectionError(
                "connection refused by in-memory broker".to_owned(),
            ));
        }

        self.state.connections_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
        }))
    }
}

struct MemoryConnection {
    state: Arc<State>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_session(
        &self,
        ack_mode: AckMode,
    ) -> Result<Box<dyn BrokerSession>, BrokerError> {
        Ok(Box::new(MemorySession {
            state: self.state.clone(),
            ack_mode,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

struct MemorySession {
    state: Arc<State>,
    ack_mode: AckMode,
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn create_consumer(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn MessageConsumer>, BrokerError> {
        let (queue, subscription) = match destination.kind() {
            DestinationKind::Queue => (self.state.queue(destination.name()).await, None),
            DestinationKind::Topic => {
                let (id, queue) = self.state.subscribe(destination.name()).await;
                (queue, Some((destination.name().to_owned(), id)))
            }
        };

        Ok(Box::new(MemoryConsumer {
            state: self.state.clone(),
            queue,
            subscription,
            ack_mode: self.ack_mode,
            epoch: self.state.consumer_epoch.load(Ordering::SeqCst),
            in_flight: vec![],
            closed: false,
        }))
    }

    async fn create_producer(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn MessageProducer>, BrokerError> {
        Ok(Box::new(MemoryProducer {
            state: self.state.clone(),
            destination: destination.clone(),
            closed: false,
        }))
    }

    async fn create_temporary_queue(&self) -> Result<Destination, BrokerError> {
        let name = format!("temp-queue-{}", self.state.next_id());
        self.state.queue(&name).await;
        Ok(Destination::queue(&name))
    }

    async fn delete_temporary_queue(&self, destination: &Destination) -> Result<(), BrokerError> {
        self.state.queues.lock().await.remove(destination.name());
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

struct MemoryConsumer {
    state: Arc<State>,
    queue: Arc<Queue>,
    subscription: Option<(String, u64)>,
    ack_mode: AckMode,
    epoch: u64,
    in_flight: Vec<InboundMessage>,
    closed: bool,
}

impl MemoryConsumer {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed || self.state.consumer_epoch.load(Ordering::SeqCst) != self.epoch {
            Err(BrokerError::ConsumerClosed)
        } else {
            Ok(())
        }
    }

    fn take_in_flight(&mut self, message: &InboundMessage) -> Option<InboundMessage> {
        let position = self
            .in_flight
            .iter()
            .position(|m| m.delivery_tag() == message.delivery_tag())?;
        Some(self.in_flight.remove(position))
    }
}

#[async_trait]
impl MessageConsumer for MemoryConsumer {
    async fn receive(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.ensure_open()?;

            if let Some(message) = self.queue.pop().await {
                if self.ack_mode == AckMode::Client {
                    self.in_flight.push(message.clone());
                }
                return Ok(Some(message));
            }

            if tokio::time::timeout_at(deadline, self.queue.available.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn acknowledge(&mut self, message: &InboundMessage) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.take_in_flight(message);
        Ok(())
    }

    async fn rollback(&mut self, message: &InboundMessage) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if let Some(message) = self.take_in_flight(message) {
            self.queue.requeue(vec![message]).await;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let in_flight = std::mem::take(&mut self.in_flight);
        if !in_flight.is_empty() {
            debug!(count = in_flight.len(), "returning unacknowledged messages");
            self.queue.requeue(in_flight).await;
        }
        if let Some((topic, id)) = self.subscription.take() {
            self.state.unsubscribe(&topic, id).await;
        }
        Ok(())
    }
}

struct MemoryProducer {
    state: Arc<State>,
    destination: Destination,
    closed: bool,
}

#[async_trait]
impl MessageProducer for MemoryProducer {
    async fn send(&mut self, message: OutboundMessage) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::ProducerError("producer is closed".to_owned()));
        }
        self.state.publish(&self.destination, message).await;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.closed = true;
        Ok(())
    }
}
