// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Codecs
//!
//! A codec turns a wire [`Payload`] into the value a handler receives. The codec
//! chosen at registration fixes the handler's target type:
//!
//! - [`TextCodec`] passes text payloads through untouched.
//! - [`MapCodec`] accepts map payloads, and JSON objects sent as text.
//! - [`JsonCodec`] decodes text payloads as JSON into any deserializable type.
//!
//! Native object payloads are accepted by every codec as long as they carry a
//! value of exactly the target type.

use crate::{
    errors::CodecError,
    message::{NativeObject, Payload, PayloadMap},
};
use serde::de::DeserializeOwned;
use std::{any::Any, marker::PhantomData};

/// Decodes payloads into values of type `T`.
pub trait MessageCodec<T>: Send + Sync {
    fn decode(&self, payload: &Payload) -> Result<T, CodecError>;
}

fn from_object<T>(object: &NativeObject) -> Result<T, CodecError>
where
    T: Any + Clone,
{
    object.downcast::<T>().ok_or(CodecError::TypeMismatch {
        expected: std::any::type_name::<T>(),
        found: object.type_name(),
    })
}

fn from_json<T>(text: &str) -> Result<T, CodecError>
where
    T: DeserializeOwned,
{
    serde_json::from_str(text).map_err(|err| CodecError::ParsePayloadError(err.to_string()))
}

/// Hands text payloads to the handler as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl MessageCodec<String> for TextCodec {
    fn decode(&self, payload: &Payload) -> Result<String, CodecError> {
        match payload {
            Payload::Text(text) => Ok(text.clone()),
            Payload::Map(_) => Err(CodecError::MapTargetMismatch),
            Payload::Object(object) => from_object(object),
            Payload::Bytes(_) => Err(CodecError::UnsupportedPayload(payload.kind())),
        }
    }
}

/// Hands map payloads to the handler as a generic key/value map.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapCodec;

impl MessageCodec<PayloadMap> for MapCodec {
    fn decode(&self, payload: &Payload) -> Result<PayloadMap, CodecError> {
        match payload {
            Payload::Text(text) => from_json(text),
            Payload::Map(map) => Ok(map.clone()),
            Payload::Object(object) => from_object(object),
            Payload::Bytes(_) => Err(CodecError::UnsupportedPayload(payload.kind())),
        }
    }
}

/// Decodes text payloads as JSON into `T`.
pub struct JsonCodec<T> {
    _target: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        JsonCodec {
            _target: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageCodec<T> for JsonCodec<T>
where
    T: DeserializeOwned + Any + Clone,
{
    fn decode(&self, payload: &Payload) -> Result<T, CodecError> {
        match payload {
            Payload::Text(text) => from_json(text),
            Payload::Map(_) => Err(CodecError::MapTargetMismatch),
            Payload::Object(object) => from_object(object),
            Payload::Bytes(_) => Err(CodecError::UnsupportedPayload(payload.kind())),
        }
    }
}
