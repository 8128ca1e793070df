// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Task-scoped correlation id.
//!
//! The receiver installs the inbound message's correlation id around the
//! processing of that one message. Senders invoked from within the handler pick
//! it up and copy it to outgoing messages that do not carry their own. The value
//! is bound to the future being processed, spawned tasks do not inherit it.

use std::future::Future;

tokio::task_local! {
    static CORRELATION_ID: Option<String>;
}

/// Runs `fut` with `id` as the ambient correlation id.
pub async fn scope<F>(id: Option<String>, fut: F) -> F::Output
where
    F: Future,
{
    CORRELATION_ID.scope(id, fut).await
}

/// The ambient correlation id, if the caller runs inside a [`scope`] that has one.
pub fn current() -> Option<String> {
    CORRELATION_ID.try_with(|id| id.clone()).ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn id_is_visible_only_inside_scope() {
        assert_eq!(current(), None);

        let seen = scope(Some("abc".to_owned()), async { current() }).await;
        assert_eq!(seen, Some("abc".to_owned()));

        assert_eq!(current(), None);
    }

    #[tokio::test]
    async fn spawned_tasks_do_not_inherit_the_id() {
        let inner = scope(Some("abc".to_owned()), async {
            tokio::spawn(async { current() }).await.unwrap()
        })
        .await;
        assert_eq!(inner, None);
    }
}
