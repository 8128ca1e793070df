// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Processing
//!
//! Processes one inbound message: filters it, decodes it, hands it to the handler
//! and acknowledges it. When any of that fails the receiver's exception policy
//! decides between acknowledging anyway and rolling back for redelivery. Only a
//! failing acknowledge or rollback is reported to the caller, since it means the
//! session itself is broken.

use crate::{
    broker::MessageConsumer,
    codec::MessageCodec,
    correlation,
    errors::{BrokerError, ProcessingError},
    handler::{MessageContext, MessageHandler, ReceiverFilter},
    message::InboundMessage,
    otel,
    policy::{Disposition, ExceptionPolicy},
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error};

/// Everything needed to process messages of one registered destination.
pub(crate) struct ReceiverDefinition<T> {
    pub(crate) destination: String,
    pub(crate) codec: Arc<dyn MessageCodec<T>>,
    pub(crate) handler: Arc<dyn MessageHandler<T>>,
    pub(crate) policy: Arc<dyn ExceptionPolicy>,
    pub(crate) filters: Vec<Arc<dyn ReceiverFilter>>,
}

impl<T> Clone for ReceiverDefinition<T> {
    fn clone(&self) -> Self {
        ReceiverDefinition {
            destination: self.destination.clone(),
            codec: self.codec.clone(),
            handler: self.handler.clone(),
            policy: self.policy.clone(),
            filters: self.filters.clone(),
        }
    }
}

/// Processes a message and settles it on `consumer`.
///
/// The message's correlation id is the ambient correlation id for the whole
/// call. Returns how the message was settled.
pub(crate) async fn process_message<T>(
    tracer: &BoxedTracer,
    def: &ReceiverDefinition<T>,
    consumer: &mut dyn MessageConsumer,
    mut message: InboundMessage,
) -> Result<Disposition, BrokerError>
where
    T: Send + 'static,
{
    let (trace_ctx, mut span) = otel::new_span(message.properties(), tracer, &def.destination);
    let correlation_id = message.correlation_id().map(str::to_owned);

    correlation::scope(correlation_id, async move {
        debug!(
            destination = def.destination,
            kind = message.payload().kind(),
            payload = message.text().unwrap_or_default(),
            "received"
        );

        let disposition = match deliver(def, trace_ctx, &mut message).await {
            Ok(()) => {
                debug!("message successfully processed");
                span.set_status(Status::Ok);
                Disposition::Acknowledge
            }
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("failure to process message"),
                });
                def.policy.on_exception(&message, &err)
            }
        };

        let settled = match disposition {
            Disposition::Acknowledge => consumer.acknowledge(&message).await,
            Disposition::Rollback => consumer.rollback(&message).await,
        };

        if let Err(err) = settled {
            error!(
                error = err.to_string(),
                destination = def.destination,
                "error whiling settling msg"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to settle msg"),
            });
            return Err(err);
        }

        Ok(disposition)
    })
    .await
}

async fn deliver<T>(
    def: &ReceiverDefinition<T>,
    trace_ctx: opentelemetry::Context,
    message: &mut InboundMessage,
) -> Result<(), ProcessingError>
where
    T: Send + 'static,
{
    for filter in &def.filters {
        filter.apply(message).map_err(ProcessingError::Filter)?;
    }

    let value = def.codec.decode(message.payload())?;
    let ctx = MessageContext::new(&def.destination, message, trace_ctx);

    def.handler
        .handle(&ctx, value)
        .await
        .map_err(ProcessingError::Handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::MockMessageConsumer,
        codec::{JsonCodec, TextCodec},
        errors::{CodecError, HandlerError},
        handler::handler_fn,
        message::Payload,
        policy::{AckOnException, MockExceptionPolicy, RollbackOnException},
    };
    use opentelemetry::global;
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct OrderMsg {
        id: u32,
    }

    fn definition<T: Send + 'static>(
        codec: Arc<dyn MessageCodec<T>>,
        handler: Arc<dyn MessageHandler<T>>,
        policy: Arc<dyn ExceptionPolicy>,
    ) -> ReceiverDefinition<T> {
        ReceiverDefinition {
            destination: "queue:orders".to_owned(),
            codec,
            handler,
            policy,
            filters: vec![],
        }
    }

    /// Appends its tag to a text payload and records itself in the `seen-by` property.
    struct Tag(&'static str);

    impl ReceiverFilter for Tag {
        fn apply(&self, message: &mut InboundMessage) -> Result<(), HandlerError> {
            if let Payload::Text(text) = message.payload_mut() {
                text.push_str(self.0);
            }
            message
                .properties_mut()
                .entry("seen-by".to_owned())
                .and_modify(|seen| seen.push_str(self.0))
                .or_insert_with(|| self.0.to_owned());
            Ok(())
        }
    }

    struct Reject;

    impl ReceiverFilter for Reject {
        fn apply(&self, _: &mut InboundMessage) -> Result<(), HandlerError> {
            Err("rejected by filter".into())
        }
    }

    fn consumer_expecting(acks: usize, rollbacks: usize) -> MockMessageConsumer {
        let mut consumer = MockMessageConsumer::new();
        consumer
            .expect_acknowledge()
            .times(acks)
            .returning(|_| Ok(()));
        consumer
            .expect_rollback()
            .times(rollbacks)
            .returning(|_| Ok(()));
        consumer
    }

    #[tokio::test]
    async fn decodes_handles_and_acknowledges() {
        let seen = Arc::new(Mutex::new(vec![]));
        let sink = seen.clone();
        let def = definition::<OrderMsg>(
            Arc::new(JsonCodec::<OrderMsg>::new()),
            Arc::new(handler_fn(move |ctx: MessageContext, msg: OrderMsg| {
                let sink = sink.clone();
                async move {
                    sink.lock()
                        .unwrap()
                        .push((msg, ctx.correlation_id().map(str::to_owned)));
                    Ok::<(), HandlerError>(())
                }
            })),
            Arc::new(RollbackOnException),
        );
        let mut consumer = consumer_expecting(1, 0);

        let message =
            InboundMessage::new(7, Payload::from(r#"{"id":42}"#)).with_correlation_id("c-1");
        let outcome = process_message(&global::tracer("test"), &def, &mut consumer, message)
            .await
            .unwrap();

        assert_eq!(outcome, Disposition::Acknowledge);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(OrderMsg { id: 42 }, Some("c-1".to_owned()))]
        );
    }

    #[tokio::test]
    async fn malformed_payload_goes_through_policy_with_raw_text() {
        let mut policy = MockExceptionPolicy::new();
        policy
            .expect_on_exception()
            .withf(|msg, err| {
                msg.text() == Some("{oops")
                    && matches!(
                        err,
                        ProcessingError::Codec(CodecError::ParsePayloadError(_))
                    )
            })
            .times(1)
            .return_const(Disposition::Rollback);

        let def = definition::<OrderMsg>(
            Arc::new(JsonCodec::<OrderMsg>::new()),
            Arc::new(handler_fn(|_: MessageContext, _: OrderMsg| async {
                Ok::<(), HandlerError>(())
            })),
            Arc::new(policy),
        );
        let mut consumer = consumer_expecting(0, 1);

        let outcome = process_message(
            &global::tracer("test"),
            &def,
            &mut consumer,
            InboundMessage::new(1, Payload::from("{oops")),
        )
        .await
        .unwrap();

        assert_eq!(outcome, Disposition::Rollback);
    }

    #[tokio::test]
    async fn handler_failure_is_acknowledged_when_policy_says_so() {
        let def = definition::<String>(
            Arc::new(TextCodec),
            Arc::new(handler_fn(|_: MessageContext, _: String| async {
                Err::<(), HandlerError>("boom".into())
            })),
            Arc::new(AckOnException),
        );
        let mut consumer = consumer_expecting(1, 0);

        let outcome = process_message(
            &global::tracer("test"),
            &def,
            &mut consumer,
            InboundMessage::new(1, Payload::from("anything")),
        )
        .await
        .unwrap();

        assert_eq!(outcome, Disposition::Acknowledge);
    }

    #[tokio::test]
    async fn failing_acknowledge_is_reported() {
        let def = definition::<String>(
            Arc::new(TextCodec),
            Arc::new(handler_fn(|_: MessageContext, _: String| async {
                Ok::<(), HandlerError>(())
            })),
            Arc::new(AckOnException),
        );
        let mut consumer = MockMessageConsumer::new();
        consumer
            .expect_acknowledge()
            .returning(|_| Err(BrokerError::AckMessageError("gone".to_owned())));

        let result = process_message(
            &global::tracer("test"),
            &def,
            &mut consumer,
            InboundMessage::new(1, Payload::from("a")),
        )
        .await;

        assert_eq!(
            result.unwrap_err(),
            BrokerError::AckMessageError("gone".to_owned())
        );
    }

    #[tokio::test]
    async fn correlation_id_is_ambient_only_while_processing() {
        let def = definition::<String>(
            Arc::new(TextCodec),
            Arc::new(handler_fn(|_: MessageContext, _: String| async {
                assert_eq!(correlation::current(), Some("c-9".to_owned()));
                Ok::<(), HandlerError>(())
            })),
            Arc::new(RollbackOnException),
        );
        let mut consumer = consumer_expecting(1, 0);

        process_message(
            &global::tracer("test"),
            &def,
            &mut consumer,
            InboundMessage::new(1, Payload::from("a")).with_correlation_id("c-9"),
        )
        .await
        .unwrap();

        assert_eq!(correlation::current(), None);
    }

    #[tokio::test]
    async fn filters_run_in_order_before_decoding() {
        let seen = Arc::new(Mutex::new(vec![]));
        let sink = seen.clone();
        let mut def = definition::<String>(
            Arc::new(TextCodec),
            Arc::new(handler_fn(move |ctx: MessageContext, text: String| {
                let sink = sink.clone();
                async move {
                    sink.lock()
                        .unwrap()
                        .push((text, ctx.properties().get("seen-by").cloned()));
                    Ok::<(), HandlerError>(())
                }
            })),
            Arc::new(RollbackOnException),
        );
        def.filters = vec![Arc::new(Tag("-a")), Arc::new(Tag("-b"))];
        let mut consumer = consumer_expecting(1, 0);

        let outcome = process_message(
            &global::tracer("test"),
            &def,
            &mut consumer,
            InboundMessage::new(1, Payload::from("x")),
        )
        .await
        .unwrap();

        assert_eq!(outcome, Disposition::Acknowledge);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("x-a-b".to_owned(), Some("-a-b".to_owned()))]
        );
    }

    #[tokio::test]
    async fn failing_filter_skips_handler_and_goes_through_policy() {
        let mut policy = MockExceptionPolicy::new();
        policy
            .expect_on_exception()
            .withf(|msg, err| {
                msg.text() == Some("x-a")
                    && matches!(
                        err,
                        ProcessingError::Filter(cause) if cause.to_string() == "rejected by filter"
                    )
            })
            .times(1)
            .return_const(Disposition::Rollback);

        let handled = Arc::new(Mutex::new(0));
        let count = handled.clone();
        let mut def = definition::<String>(
            Arc::new(TextCodec),
            Arc::new(handler_fn(move |_: MessageContext, _: String| {
                let count = count.clone();
                async move {
                    *count.lock().unwrap() += 1;
                    Ok::<(), HandlerError>(())
                }
            })),
            Arc::new(policy),
        );
        def.filters = vec![Arc::new(Tag("-a")), Arc::new(Reject), Arc::new(Tag("-b"))];
        let mut consumer = consumer_expecting(0, 1);

        let outcome = process_message(
            &global::tracer("test"),
            &def,
            &mut consumer,
            InboundMessage::new(1, Payload::from("x")),
        )
        .await
        .unwrap();

        assert_eq!(outcome, Disposition::Rollback);
        assert_eq!(*handled.lock().unwrap(), 0);
    }
}
