// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Destination Topology
//!
//! Maps destinations onto AMQP 0-9-1 objects:
//! - a queue is a durable queue reached through the default exchange
//! - a topic is a durable fanout exchange; each subscriber consumes from its own
//!   exclusive, auto-delete queue bound to it
//! - a temporary queue is a server-named exclusive queue
//!
//! Declarations are idempotent, so they run every time a consumer or producer
//! is opened. Server-owned names (`amq.` prefix) are never declared.

use crate::{
    destination::{Destination, DestinationKind},
    errors::BrokerError,
};
use lapin::{
    options::{
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    types::FieldTable,
    Channel, ExchangeKind,
};
use tracing::{debug, error};

/// Prefix reserved by the broker for server-generated names
pub const AMQP_RESERVED_PREFIX: &str = "amq.";
/// The default (nameless) direct exchange
pub const AMQP_DEFAULT_EXCHANGE: &str = "";

/// Where a producer publishes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PublishTarget {
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
}

/// Declares what `destination` needs for consuming and returns the queue to consume from.
pub(crate) async fn declare_consumer_queue(
    channel: &Channel,
    destination: &Destination,
) -> Result<String, BrokerError> {
    match destination.kind() {
        DestinationKind::Queue => {
            declare_queue(channel, destination.name()).await?;
            Ok(destination.name().to_owned())
        }
        DestinationKind::Topic => {
            declare_fanout(channel, destination.name()).await?;
            let queue = declare_exclusive_queue(channel).await?;

            debug!(
                "binding queue: {} to the exchange: {}",
                queue,
                destination.name()
            );
            if let Err(err) = channel
                .queue_bind(
                    &queue,
                    destination.name(),
                    "",
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
            {
                error!(error = err.to_string(), "error to bind queue to exchange");
                return Err(BrokerError::DestinationError(format!(
                    "binding {} to {}: {}",
                    queue,
                    destination.name(),
                    err
                )));
            }

            Ok(queue)
        }
    }
}

/// Declares what `destination` needs for publishing.
pub(crate) async fn declare_publish_target(
    channel: &Channel,
    destination: &Destination,
) -> Result<PublishTarget, BrokerError> {
    match destination.kind() {
        DestinationKind::Queue => {
            declare_queue(channel, destination.name()).await?;
            Ok(PublishTarget {
                exchange: AMQP_DEFAULT_EXCHANGE.to_owned(),
                routing_key: destination.name().to_owned(),
            })
        }
        DestinationKind::Topic => {
            declare_fanout(channel, destination.name()).await?;
            Ok(PublishTarget {
                exchange: destination.name().to_owned(),
                routing_key: String::new(),
            })
        }
    }
}

/// Declares a server-named queue living as long as the connection.
pub(crate) async fn declare_exclusive_queue(channel: &Channel) -> Result<String, BrokerError> {
    match channel
        .queue_declare(
            "",
            QueueDeclareOptions {
                passive: false,
                durable: false,
                exclusive: true,
                auto_delete: true,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "failure to declare exclusive queue");
            Err(BrokerError::TemporaryQueueError(err.to_string()))
        }
        Ok(queue) => {
            debug!("queue: {} was created", queue.name());
            Ok(queue.name().as_str().to_owned())
        }
    }
}

pub(crate) async fn delete_queue(channel: &Channel, name: &str) -> Result<(), BrokerError> {
    match channel
        .queue_delete(name, QueueDeleteOptions::default())
        .await
    {
        Err(err) => Err(BrokerError::DestinationError(format!(
            "deleting {}: {}",
            name, err
        ))),
        Ok(_) => {
            debug!("queue: {} was deleted", name);
            Ok(())
        }
    }
}

async fn declare_queue(channel: &Channel, name: &str) -> Result<(), BrokerError> {
    if name.starts_with(AMQP_RESERVED_PREFIX) {
        return Ok(());
    }

    debug!("creating queue: {}", name);
    match channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                passive: false,
                durable: true,
                exclusive: false,
                auto_delete: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), name, "error to declare the queue");
            Err(BrokerError::DestinationError(format!("queue {}: {}", name, err)))
        }
        _ => Ok(()),
    }
}

async fn declare_fanout(channel: &Channel, name: &str) -> Result<(), BrokerError> {
    debug!("creating exchange: {}", name);
    match channel
        .exchange_declare(
            name,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                passive: false,
                durable: true,
                auto_delete: false,
                internal: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), name, "error to declare the exchange");
            Err(BrokerError::DestinationError(format!("topic {}: {}", name, err)))
        }
        _ => Ok(()),
    }
}
