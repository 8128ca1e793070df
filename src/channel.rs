// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Transport
//!
//! A [`ConnectionFactory`] over AMQP 0-9-1 built on `lapin`. Sessions are AMQP
//! channels, consumers are `basic_consume` subscriptions and producers publish
//! through `basic_publish`. Destinations are mapped to exchanges and queues by
//! [`crate::topology`].
//!
//! Connections are pooled: at most `max_connections` are opened and handed out
//! round-robin, and each one admits at most `max_sessions_per_connection` open
//! channels. When a connection is full, opening a session either waits for a
//! slot or fails with [`BrokerError::PoolExhausted`]. Closing a pooled
//! connection only returns it to the pool, broken connections are dropped and
//! replaced on the next request.

use crate::{
    broker::{
        AckMode, BrokerConnection, BrokerSession, ConnectionFactory, MessageConsumer,
        MessageProducer,
    },
    config::{BrokerConfig, PoolConfig},
    destination::Destination,
    errors::BrokerError,
    message::{InboundMessage, OutboundMessage, Payload, PayloadMap, Properties},
    topology::{self, PublishTarget},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    uri::{AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use std::{
    collections::BTreeMap,
    str::FromStr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error};
use uuid::Uuid;

/// Header marking payloads sent as key/value maps
pub const PAYLOAD_KIND_HEADER: &str = "x-payload-kind";
/// Value of [`PAYLOAD_KIND_HEADER`] for map payloads
pub const MAP_PAYLOAD_KIND: &str = "map";

const TEXT_CONTENT_TYPE: &str = "text/plain";
const JSON_CONTENT_TYPE: &str = "application/json";
const BYTES_CONTENT_TYPE: &str = "application/octet-stream";

const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

const REPLY_SUCCESS: u16 = 200;

struct SharedConnection {
    connection: Connection,
    sessions: Arc<Semaphore>,
}

/// Connection factory for an AMQP broker.
pub struct AmqpConnectionFactory {
    uri: AMQPUri,
    name: String,
    pool: PoolConfig,
    pooled: bool,
    connections: Mutex<Vec<Arc<SharedConnection>>>,
    next: AtomicUsize,
}

impl AmqpConnectionFactory {
    /// Creates a pooled factory.
    ///
    /// # Parameters
    /// * `cfg` - Broker settings; credentials override the ones in the URL
    /// * `name` - Connection name shown by the broker
    ///
    /// # Returns
    /// The factory, or [`BrokerError::ConnectionError`] when the URL is invalid
    pub fn new(cfg: &BrokerConfig, name: &str) -> Result<Self, BrokerError> {
        let mut uri = AMQPUri::from_str(&cfg.broker_url).map_err(|err| {
            error!(error = err.as_str(), "invalid broker url");
            BrokerError::ConnectionError(err)
        })?;

        if let Some(username) = &cfg.broker_username {
            uri.authority.userinfo = AMQPUserInfo {
                username: username.clone(),
                password: cfg.broker_password.clone().unwrap_or_default(),
            };
        }

        Ok(AmqpConnectionFactory {
            uri,
            name: name.to_owned(),
            pool: cfg.pool.clone(),
            pooled: true,
            connections: Mutex::new(vec![]),
            next: AtomicUsize::new(0),
        })
    }

    /// Creates a factory opening a dedicated connection per request, closed
    /// again when the caller closes it.
    pub fn unpooled(cfg: &BrokerConfig, name: &str) -> Result<Self, BrokerError> {
        let mut factory = Self::new(cfg, name)?;
        factory.pooled = false;
        Ok(factory)
    }

    async fn connect(&self) -> Result<Arc<SharedConnection>, BrokerError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.name.clone()));

        let connection = match Connection::connect_uri(self.uri.clone(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(BrokerError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        Ok(Arc::new(SharedConnection {
            connection,
            sessions: Arc::new(Semaphore::new(self.pool.max_sessions_per_connection.max(1))),
        }))
    }

    async fn borrow(&self) -> Result<Arc<SharedConnection>, BrokerError> {
        let mut connections = self.connections.lock().await;
        connections.retain(|shared| shared.connection.status().connected());

        if connections.len() < self.pool.max_connections.max(1) {
            let shared = self.connect().await?;
            connections.push(shared.clone());
            return Ok(shared);
        }

        let index = self.next.fetch_add(1, Ordering::Relaxed) % connections.len();
        Ok(connections[index].clone())
    }
}

#[async_trait]
impl ConnectionFactory for AmqpConnectionFactory {
    async fn create_connection(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let shared = if self.pooled {
            self.borrow().await?
        } else {
            self.connect().await?
        };

        Ok(Box::new(AmqpConnection {
            shared,
            owned: !self.pooled,
            block_if_full: self.pool.block_if_session_pool_is_full,
        }))
    }
}

struct AmqpConnection {
    shared: Arc<SharedConnection>,
    owned: bool,
    block_if_full: bool,
}

impl AmqpConnection {
    async fn session_permit(&self) -> Result<OwnedSemaphorePermit, BrokerError> {
        let sessions = self.shared.sessions.clone();
        if self.block_if_full {
            sessions
                .acquire_owned()
                .await
                .map_err(|_| BrokerError::PoolExhausted)
        } else {
            sessions
                .try_acquire_owned()
                .map_err(|_| BrokerError::PoolExhausted)
        }
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_session(
        &self,
        ack_mode: AckMode,
    ) -> Result<Box<dyn BrokerSession>, BrokerError> {
        let permit = self.session_permit().await?;

        debug!("creating amqp channel...");
        let channel = match self.shared.connection.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(BrokerError::SessionError(err.to_string()))
            }
        }?;

        if ack_mode == AckMode::Client {
            channel
                .basic_qos(1, BasicQosOptions { global: false })
                .await
                .map_err(|err| BrokerError::SessionError(err.to_string()))?;
        }
        debug!("channel created");

        Ok(Box::new(AmqpSession {
            channel: Arc::new(channel),
            ack_mode,
            _permit: permit,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.owned {
            return Ok(());
        }

        self.shared
            .connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| BrokerError::CloseError(err.to_string()))
    }
}

struct AmqpSession {
    channel: Arc<Channel>,
    ack_mode: AckMode,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn create_consumer(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn MessageConsumer>, BrokerError> {
        let queue = topology::declare_consumer_queue(&self.channel, destination).await?;
        let tag = format!("{}-{}", queue, Uuid::new_v4());

        let consumer = match self
            .channel
            .basic_consume(
                &queue,
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: self.ack_mode == AckMode::Auto,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(BrokerError::ConsumerDeclarationError(err.to_string()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(Box::new(AmqpConsumer {
            channel: self.channel.clone(),
            consumer,
            tag,
            ack_mode: self.ack_mode,
        }))
    }

    async fn create_producer(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn MessageProducer>, BrokerError> {
        let target = topology::declare_publish_target(&self.channel, destination).await?;
        Ok(Box::new(AmqpProducer {
            channel: self.channel.clone(),
            target,
        }))
    }

    async fn create_temporary_queue(&self) -> Result<Destination, BrokerError> {
        let name = topology::declare_exclusive_queue(&self.channel).await?;
        Ok(Destination::queue(&name))
    }

    async fn delete_temporary_queue(&self, destination: &Destination) -> Result<(), BrokerError> {
        topology::delete_queue(&self.channel, destination.name()).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| BrokerError::CloseError(err.to_string()))
    }
}

struct AmqpConsumer {
    channel: Arc<Channel>,
    consumer: Consumer,
    tag: String,
    ack_mode: AckMode,
}

#[async_trait]
impl MessageConsumer for AmqpConsumer {
    async fn receive(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, BrokerError> {
        match tokio::time::timeout(timeout, self.consumer.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(BrokerError::ConsumerClosed),
            Ok(Some(Err(err))) => Err(BrokerError::ConsumerError(err.to_string())),
            Ok(Some(Ok(delivery))) => Ok(Some(inbound(delivery))),
        }
    }

    async fn acknowledge(&mut self, message: &InboundMessage) -> Result<(), BrokerError> {
        if self.ack_mode == AckMode::Auto {
            return Ok(());
        }

        self.channel
            .basic_ack(message.delivery_tag(), BasicAckOptions { multiple: false })
            .await
            .map_err(|err| BrokerError::AckMessageError(err.to_string()))
    }

    async fn rollback(&mut self, message: &InboundMessage) -> Result<(), BrokerError> {
        if self.ack_mode == AckMode::Auto {
            return Ok(());
        }

        self.channel
            .basic_nack(
                message.delivery_tag(),
                BasicNackOptions {
                    multiple: false,
                    requeue: true,
                },
            )
            .await
            .map_err(|err| BrokerError::RollbackMessageError(err.to_string()))
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(&self.tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| BrokerError::CloseError(err.to_string()))
    }
}

struct AmqpProducer {
    channel: Arc<Channel>,
    target: PublishTarget,
}

#[async_trait]
impl MessageProducer for AmqpProducer {
    async fn send(&mut self, message: OutboundMessage) -> Result<(), BrokerError> {
        let (data, properties) = outbound(message)?;

        match self
            .channel
            .basic_publish(
                &self.target.exchange,
                &self.target.routing_key,
                BasicPublishOptions::default(),
                &data,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(BrokerError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }
}

fn inbound(delivery: Delivery) -> InboundMessage {
    let mut properties = headers_to_properties(delivery.properties.headers().as_ref());
    let is_map = properties.remove(PAYLOAD_KIND_HEADER).as_deref() == Some(MAP_PAYLOAD_KIND);

    let payload = decode_payload(delivery.data, is_map);
    let mut message = InboundMessage::new(delivery.delivery_tag, payload)
        .with_properties(properties)
        .redelivered(delivery.redelivered);
    message.correlation_id = delivery
        .properties
        .correlation_id()
        .as_ref()
        .map(|id| id.as_str().to_owned());
    message
}

fn decode_payload(data: Vec<u8>, is_map: bool) -> Payload {
    if is_map {
        if let Ok(map) = serde_json::from_slice::<PayloadMap>(&data) {
            return Payload::Map(map);
        }
    }

    match String::from_utf8(data) {
        Ok(text) => Payload::Text(text),
        Err(err) => Payload::Bytes(err.into_bytes()),
    }
}

fn outbound(message: OutboundMessage) -> Result<(Vec<u8>, BasicProperties), BrokerError> {
    let mut headers = properties_to_headers(&message.properties);

    let (data, content_type) = match message.payload {
        Payload::Text(text) => (text.into_bytes(), TEXT_CONTENT_TYPE),
        Payload::Map(map) => {
            headers.insert(
                ShortString::from(PAYLOAD_KIND_HEADER),
                AMQPValue::LongString(LongString::from(MAP_PAYLOAD_KIND)),
            );
            let data = serde_json::to_vec(&map)
                .map_err(|err| BrokerError::PublishingError(err.to_string()))?;
            (data, JSON_CONTENT_TYPE)
        }
        Payload::Bytes(bytes) => (bytes, BYTES_CONTENT_TYPE),
        Payload::Object(object) => {
            return Err(BrokerError::UnsupportedPayload(format!(
                "native object {} cannot be sent over amqp",
                object.type_name()
            )))
        }
    };

    let mut properties = BasicProperties::default()
        .with_content_type(ShortString::from(content_type))
        .with_delivery_mode(if message.persistent {
            DELIVERY_MODE_PERSISTENT
        } else {
            DELIVERY_MODE_TRANSIENT
        })
        .with_headers(FieldTable::from(headers));

    if let Some(id) = message.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(id));
    }
    if let Some(id) = message.message_id {
        properties = properties.with_message_id(ShortString::from(id));
    }
    if let Some(reply_to) = message.reply_to {
        properties = properties.with_reply_to(ShortString::from(reply_to.to_string()));
    }
    if let Some(ttl) = message.ttl {
        properties = properties.with_expiration(ShortString::from(ttl.as_millis().to_string()));
    }

    Ok((data, properties))
}

fn headers_to_properties(headers: Option<&FieldTable>) -> Properties {
    let Some(headers) = headers else {
        return Properties::default();
    };

    headers
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(value) => {
                    String::from_utf8_lossy(value.as_bytes()).into_owned()
                }
                AMQPValue::ShortString(value) => value.as_str().to_owned(),
                _ => return None,
            };
            Some((key.as_str().to_owned(), value))
        })
        .collect()
}

fn properties_to_headers(properties: &Properties) -> BTreeMap<ShortString, AMQPValue> {
    properties
        .iter()
        .map(|(key, value)| {
            (
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            )
        })
        .collect()
}
