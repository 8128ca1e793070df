// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelopes
//!
//! Wire payloads are a sum type decoded once at the transport boundary. Inbound
//! messages carry the payload plus the broker metadata the engine needs to
//! acknowledge or roll back, outbound messages carry the payload plus delivery
//! settings applied by the publish path.

use crate::destination::Destination;
use std::{any::Any, collections::BTreeMap, fmt, sync::Arc, time::Duration};

/// Generic key/value payload carried by map messages.
pub type PayloadMap = serde_json::Map<String, serde_json::Value>;

/// String properties (headers) carried alongside a payload.
pub type Properties = BTreeMap<String, String>;

/// A value handed over in-process without serialization.
#[derive(Clone)]
pub struct NativeObject {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl NativeObject {
    pub fn new<T>(value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        NativeObject {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Name of the carried value's type.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Returns a copy of the carried value when it is a `T`.
    pub fn downcast<T>(&self) -> Option<T>
    where
        T: Any + Clone,
    {
        self.value.downcast_ref::<T>().cloned()
    }
}

impl fmt::Debug for NativeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeObject")
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Wire payload of a message.
#[derive(Debug, Clone)]
pub enum Payload {
    Text(String),
    Map(PayloadMap),
    Object(NativeObject),
    Bytes(Vec<u8>),
}

impl Payload {
    /// Short name of the wire kind, used in logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Text(_) => "text",
            Payload::Map(_) => "map",
            Payload::Object(_) => "object",
            Payload::Bytes(_) => "bytes",
        }
    }

    /// The raw text of a text payload.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_owned())
    }
}

impl From<PayloadMap> for Payload {
    fn from(value: PayloadMap) -> Self {
        Payload::Map(value)
    }
}

/// A message received from a consumer.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub(crate) delivery_tag: u64,
    pub(crate) payload: Payload,
    pub(crate) correlation_id: Option<String>,
    pub(crate) properties: Properties,
    pub(crate) redelivered: bool,
}

impl InboundMessage {
    pub fn new(delivery_tag: u64, payload: Payload) -> Self {
        InboundMessage {
            delivery_tag,
            payload,
            correlation_id: None,
            properties: Properties::default(),
            redelivered: false,
        }
    }

    pub fn with_correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Broker token identifying this delivery on its consumer.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    /// Raw text of the payload, when the message is a text message.
    pub fn text(&self) -> Option<&str> {
        self.payload.as_text()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }
}

/// A message about to be published.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub(crate) payload: Payload,
    pub(crate) correlation_id: Option<String>,
    pub(crate) message_id: Option<String>,
    pub(crate) reply_to: Option<Destination>,
    pub(crate) properties: Properties,
    pub(crate) persistent: bool,
    pub(crate) ttl: Option<Duration>,
}

impl OutboundMessage {
    pub fn new(payload: impl Into<Payload>) -> Self {
        OutboundMessage {
            payload: payload.into(),
            correlation_id: None,
            message_id: None,
            reply_to: None,
            properties: Properties::default(),
            persistent: false,
            ttl: None,
        }
    }

    pub fn with_correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn with_reply_to(mut self, destination: Destination) -> Self {
        self.reply_to = Some(destination);
        self
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn set_correlation_id(&mut self, id: Option<String>) {
        self.correlation_id = id;
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn set_message_id(&mut self, id: &str) {
        self.message_id = Some(id.to_owned());
    }

    pub fn reply_to(&self) -> Option<&Destination> {
        self.reply_to.as_ref()
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn set_persistent(&mut self, persistent: bool) {
        self.persistent = persistent;
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn set_ttl(&mut self, ttl: Option<Duration>) {
        self.ttl = ttl;
    }
}
