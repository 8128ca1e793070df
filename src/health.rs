// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Health Checks
//!
//! Two kinds of probes are exposed to the hosting application's health registry:
//! one per registered receiver, reporting whether it is currently listening, and
//! one per broker, round-tripping a test message through a temporary queue.

use crate::{
    broker::{close_silently, AckMode, BrokerConnection, BrokerSession, ConnectionFactory},
    destination::Destination,
    errors::BrokerError,
    message::OutboundMessage,
    receiver::ReceptionState,
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};
use uuid::Uuid;

/// Result of a health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStatus {
    healthy: bool,
    message: Option<String>,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        HealthStatus {
            healthy: true,
            message: None,
        }
    }

    pub fn healthy_with(message: impl Into<String>) -> Self {
        HealthStatus {
            healthy: true,
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        HealthStatus {
            healthy: false,
            message: Some(message.into()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Human readable reason.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> HealthStatus;
}

/// Reports whether a receiver is currently listening. Never blocks.
#[derive(Debug, Clone)]
pub struct ReceiverHealthCheck {
    destination: String,
    state: Arc<ReceptionState>,
}

impl ReceiverHealthCheck {
    pub(crate) fn new(destination: &str, state: Arc<ReceptionState>) -> Self {
        ReceiverHealthCheck {
            destination: destination.to_owned(),
            state,
        }
    }

    pub fn status(&self) -> HealthStatus {
        if self.state.is_receiving() {
            HealthStatus::healthy_with(format!("Is receiving from {}", self.destination))
        } else {
            HealthStatus::unhealthy(format!("Is NOT receiving from {}", self.destination))
        }
    }
}

#[async_trait]
impl HealthCheck for ReceiverHealthCheck {
    async fn check(&self) -> HealthStatus {
        self.status()
    }
}

/// Round-trips a test message through a temporary queue.
///
/// Should be given a factory with its own connections rather than a pool
/// shared with receivers, since an exhausted pool would make the probe hang.
pub struct ConnectivityHealthCheck {
    factory: Arc<dyn ConnectionFactory>,
    wait: Duration,
}

impl ConnectivityHealthCheck {
    pub fn new(factory: Arc<dyn ConnectionFactory>, wait: Duration) -> Self {
        ConnectivityHealthCheck { factory, wait }
    }

    async fn round_trip(&self) -> Result<HealthStatus, BrokerError> {
        let connection = self.factory.create_connection().await?;
        let result = self.round_trip_on(connection.as_ref()).await;
        close_silently("connection", connection.close()).await;
        result
    }

    async fn round_trip_on(
        &self,
        connection: &dyn BrokerConnection,
    ) -> Result<HealthStatus, BrokerError> {
        let session = connection.create_session(AckMode::Auto).await?;
        let result = self.round_trip_in(session.as_ref()).await;
        close_silently("session", session.close()).await;
        result
    }

    async fn round_trip_in(
        &self,
        session: &dyn BrokerSession,
    ) -> Result<HealthStatus, BrokerError> {
        let temp_queue = session.create_temporary_queue().await?;
        let text = format!("Test message-{}", Uuid::new_v4());

        let result = self.exchange(session, &temp_queue, &text).await;

        close_silently(
            "temporary queue",
            session.delete_temporary_queue(&temp_queue),
        )
        .await;
        result
    }

    async fn exchange(
        &self,
        session: &dyn BrokerSession,
        temp_queue: &Destination,
        text: &str,
    ) -> Result<HealthStatus, BrokerError> {
        let mut producer = session.create_producer(temp_queue).await?;
        let sent = producer.send(OutboundMessage::new(text)).await;
        close_silently("producer", producer.close()).await;
        sent?;

        let mut consumer = session.create_consumer(temp_queue).await?;
        let received = consumer.receive(self.wait).await;
        close_silently("consumer", consumer.close()).await;

        match received?.as_ref().and_then(|message| message.text()) {
            Some(received) if received == text => Ok(HealthStatus::healthy()),
            _ => Ok(HealthStatus::unhealthy(format!(
                "Did not receive testMessage via tempQueue in {} milliseconds",
                self.wait.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl HealthCheck for ConnectivityHealthCheck {
    async fn check(&self) -> HealthStatus {
        match self.round_trip().await {
            Ok(status) => {
                debug!(healthy = status.is_healthy(), "broker connectivity checked");
                status
            }
            Err(err) => {
                warn!(error = err.to_string(), "broker connectivity check failed");
                HealthStatus::unhealthy(err.to_string())
            }
        }
    }
}
