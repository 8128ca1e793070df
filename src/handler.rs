// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! User processing logic is expressed as a [`MessageHandler`] over the codec's
//! target type. Handlers receive a [`MessageContext`] carrying the metadata of
//! the message being processed, including its correlation id.

use crate::{
    errors::HandlerError,
    message::{InboundMessage, Properties},
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::future::Future;

/// Metadata of the message being handled.
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    destination: String,
    correlation_id: Option<String>,
    properties: Properties,
    redelivered: bool,
    trace: Context,
}

impl MessageContext {
    pub(crate) fn new(destination: &str, message: &InboundMessage, trace: Context) -> Self {
        MessageContext {
            destination: destination.to_owned(),
            correlation_id: message.correlation_id().map(str::to_owned),
            properties: message.properties().clone(),
            redelivered: message.is_redelivered(),
            trace,
        }
    }

    /// Logical destination the message was received from.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    /// OpenTelemetry context propagated by the publisher of the message.
    pub fn trace_context(&self) -> &Context {
        &self.trace
    }
}

/// Processes decoded messages of type `T`.
///
/// Returning an error hands the message to the receiver's exception policy.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync {
    async fn handle(&self, ctx: &MessageContext, message: T) -> Result<(), HandlerError>;
}

/// A handler backed by an async closure.
pub struct FnHandler<F> {
    f: F,
}

/// Builds a handler from a closure taking the context and the decoded message.
pub fn handler_fn<F>(f: F) -> FnHandler<F> {
    FnHandler { f }
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for FnHandler<F>
where
    T: Send + 'static,
    F: Fn(MessageContext, T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, ctx: &MessageContext, message: T) -> Result<(), HandlerError> {
        (self.f)(ctx.clone(), message).await
    }
}

/// Applied, in registration order, to every inbound message before it is decoded.
pub trait ReceiverFilter: Send + Sync {
    fn apply(&self, message: &mut InboundMessage) -> Result<(), HandlerError>;
}
