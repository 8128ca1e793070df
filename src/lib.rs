// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;
mod topology;

pub mod broker;
pub mod channel;
pub mod codec;
pub mod config;
pub mod correlation;
pub mod destination;
pub mod dispatcher;
pub mod errors;
pub mod handler;
pub mod health;
pub mod lifecycle;
pub mod memory;
pub mod message;
pub mod policy;
pub mod publisher;
pub mod receiver;
