// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstraction
//!
//! The engine talks to the broker only through these traits. A connection factory
//! hands out connections, connections open sessions, sessions open consumers and
//! producers on a [`Destination`]. Implementations exist for AMQP (see
//! [`crate::channel`]) and for an in-process broker (see [`crate::memory`]).
//!
//! Pooling is the factory's business: closing a pooled connection returns it
//! to the pool.

use crate::{
    destination::Destination,
    errors::BrokerError,
    message::{InboundMessage, OutboundMessage},
};
use async_trait::async_trait;
use std::{future::Future, time::Duration};
use tracing::debug;

/// Acknowledge mode of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Deliveries are acknowledged by the broker as soon as they are sent
    Auto,
    /// Deliveries must be explicitly acknowledged or rolled back
    Client,
}

/// Hands out broker connections. Must be safe for concurrent use.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create_connection(&self) -> Result<Box<dyn BrokerConnection>, BrokerError>;
}

/// A live (or pooled) connection to the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_session(&self, ack_mode: AckMode)
        -> Result<Box<dyn BrokerSession>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A session scoped to one connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn create_consumer(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn MessageConsumer>, BrokerError>;

    async fn create_producer(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn MessageProducer>, BrokerError>;

    /// Creates a queue that lives as long as this session.
    async fn create_temporary_queue(&self) -> Result<Destination, BrokerError>;

    async fn delete_temporary_queue(&self, destination: &Destination) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Receiving side of a session, with explicit acknowledgment capabilities.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageConsumer: Send {
    /// Waits at most `timeout` for the next message. `Ok(None)` means nothing arrived.
    async fn receive(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, BrokerError>;

    async fn acknowledge(&mut self, message: &InboundMessage) -> Result<(), BrokerError>;

    /// Hands an unacknowledged message back to the broker for redelivery.
    async fn rollback(&mut self, message: &InboundMessage) -> Result<(), BrokerError>;

    async fn close(&mut self) -> Result<(), BrokerError>;
}

/// Sending side of a session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageProducer: Send {
    async fn send(&mut self, message: OutboundMessage) -> Result<(), BrokerError>;

    async fn close(&mut self) -> Result<(), BrokerError>;
}

/// Runs a close operation, swallowing and logging its failure.
pub async fn close_silently<F>(resource: &str, close: F)
where
    F: Future<Output = Result<(), BrokerError>>,
{
    if let Err(err) = close.await {
        debug!(error = err.to_string(), resource, "suppressed failure to close");
    }
}
