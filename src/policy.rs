// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exception Policies
//!
//! When decoding or handling a message fails, an [`ExceptionPolicy`] decides what
//! happens to it. Acknowledging discards the message for good, rolling back hands
//! it back to the broker for redelivery.

use crate::{errors::ProcessingError, message::InboundMessage};
use std::sync::Arc;
use tracing::error;

/// Outcome chosen for a message whose processing failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge anyway, the message is lost
    Acknowledge,
    /// Roll back so the broker redelivers the message
    Rollback,
}

/// Decides the fate of a message whose processing failed.
///
/// The failed broker message is available for inspection, its raw text
/// through [`InboundMessage::text`].
#[cfg_attr(test, mockall::automock)]
pub trait ExceptionPolicy: Send + Sync {
    fn on_exception(&self, message: &InboundMessage, error: &ProcessingError) -> Disposition;
}

/// Logs the failure and acknowledges the message.
#[derive(Debug, Clone, Copy, Default)]
pub struct AckOnException;

impl ExceptionPolicy for AckOnException {
    fn on_exception(&self, message: &InboundMessage, err: &ProcessingError) -> Disposition {
        error!(
            error = err.to_string(),
            payload = message.text().unwrap_or_default(),
            "error processing received message - acknowledging it anyway"
        );
        Disposition::Acknowledge
    }
}

/// Logs the failure and rolls the message back.
#[derive(Debug, Clone, Copy, Default)]
pub struct RollbackOnException;

impl ExceptionPolicy for RollbackOnException {
    fn on_exception(&self, message: &InboundMessage, err: &ProcessingError) -> Disposition {
        error!(
            error = err.to_string(),
            payload = message.text().unwrap_or_default(),
            "error processing received message - NOT acknowledging it"
        );
        Disposition::Rollback
    }
}

/// Picks one of the two standard policies.
pub fn ack_on_exception(ack: bool) -> Arc<dyn ExceptionPolicy> {
    if ack {
        Arc::new(AckOnException)
    } else {
        Arc::new(RollbackOnException)
    }
}

/// A policy backed by a closure over the raw text and the error.
pub struct FnPolicy<F> {
    decide: F,
}

/// Builds a policy from a closure receiving the raw text (if the message was a
/// text message) and the processing error.
pub fn from_fn<F>(decide: F) -> FnPolicy<F>
where
    F: Fn(Option<&str>, &ProcessingError) -> Disposition + Send + Sync,
{
    FnPolicy { decide }
}

impl<F> ExceptionPolicy for FnPolicy<F>
where
    F: Fn(Option<&str>, &ProcessingError) -> Disposition + Send + Sync,
{
    fn on_exception(&self, message: &InboundMessage, error: &ProcessingError) -> Disposition {
        (self.decide)(message.text(), error)
    }
}
