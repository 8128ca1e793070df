// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use async_trait::async_trait;

/// Managed-lifecycle contract invoked by the hosting application.
///
/// `start` is called once the application is ready for traffic, `stop` on
/// shutdown. Both are best effort and never fail.
#[async_trait]
pub trait Managed: Send + Sync {
    async fn start(&self);

    async fn stop(&self);
}
