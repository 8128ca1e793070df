// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! Error taxonomy for the receiver engine and the publish path. Broker errors
//! describe transport failures and drive the reconnect loop, codec and processing
//! errors stay local to one message and are routed through an exception policy,
//! send errors are returned to the caller of a publish.

use thiserror::Error;

/// Error type returned by user handlers, message builders and filters.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Represents failures of the broker transport.
///
/// Every variant raised while a consumer generation is being set up or is
/// listening tears that generation down and triggers a reconnect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Error establishing a connection to the broker
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a session from an established connection
    #[error("failure to create a session `{0}`")]
    SessionError(String),

    /// Error declaring or resolving a destination
    #[error("failure to declare destination `{0}`")]
    DestinationError(String),

    /// Error creating a consumer on a destination
    #[error("failure to create consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error receiving from a consumer
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// The broker closed the consumer underneath us. Usually a transient state.
    #[error("the consumer is closed")]
    ConsumerClosed,

    /// Error creating a producer on a destination
    #[error("failure to create producer `{0}`")]
    ProducerError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(String),

    /// Error rolling back a message
    #[error("failure to rollback message `{0}`")]
    RollbackMessageError(String),

    /// Error creating or deleting a temporary queue
    #[error("failure to manage temporary queue `{0}`")]
    TemporaryQueueError(String),

    /// The payload kind can not travel over this transport
    #[error("unsupported payload for this transport `{0}`")]
    UnsupportedPayload(String),

    /// The connection pool has no session available and is configured not to block
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// Error closing a consumer, producer, session or connection
    #[error("failure to close `{0}`")]
    CloseError(String),
}

/// Represents failures converting a wire payload into the handler's type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The text payload is not valid JSON for the target type
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// A map payload was received but the target type is not a map
    #[error("received a map message, the receiver must use a map codec to receive it")]
    MapTargetMismatch,

    /// A native object payload does not carry a value of the target type
    #[error("incompatible receiver types, `{expected}` is not assignable from `{found}`")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// The wire kind is not one the codec knows how to decode
    #[error("do not know how to handle messages of kind `{0}`")]
    UnsupportedPayload(&'static str),
}

/// Represents a failure processing one inbound message.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("receiver filter failure: {0}")]
    Filter(HandlerError),

    #[error("handler failure: {0}")]
    Handler(HandlerError),
}

/// Represents failures of a single publish call.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("failure to serialize payload `{0}`")]
    SerializationError(String),

    #[error("failure to build message: {0}")]
    BuilderError(HandlerError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Represents failures loading configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
}
