// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels between publisher and receiver inside the message
//! properties. The publish path injects the current context, the receiver
//! extracts it and opens a consumer span around the processing of the message.

use crate::message::Properties;
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::borrow::Cow;

/// Writes trace context entries into outgoing message properties.
pub(crate) struct PropertiesInjector<'a> {
    properties: &'a mut Properties,
}

impl<'a> PropertiesInjector<'a> {
    pub(crate) fn new(properties: &'a mut Properties) -> Self {
        Self { properties }
    }
}

impl Injector for PropertiesInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.properties.insert(key.to_lowercase(), value);
    }
}

/// Reads trace context entries from inbound message properties.
pub(crate) struct PropertiesExtractor<'a> {
    properties: &'a Properties,
}

impl<'a> PropertiesExtractor<'a> {
    pub(crate) fn new(properties: &'a Properties) -> Self {
        Self { properties }
    }
}

impl Extractor for PropertiesExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.properties.keys().map(String::as_str).collect()
    }
}

/// Injects `ctx` into `properties` using the globally registered propagator.
pub(crate) fn inject(ctx: &Context, properties: &mut Properties) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut PropertiesInjector::new(properties))
    });
}

/// Creates a consumer span for processing a message.
///
/// Returns the context extracted from the message properties along with the
/// new span, which is a child of that context.
pub(crate) fn new_span(
    properties: &Properties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&PropertiesExtractor::new(properties))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injector_lowercases_keys() {
        let mut props = Properties::default();
        PropertiesInjector::new(&mut props).set("TraceParent", "00-abc".to_owned());
        assert_eq!(props.get("traceparent").map(String::as_str), Some("00-abc"));
    }

    #[test]
    fn extractor_reads_properties() {
        let mut props = Properties::default();
        props.insert("traceparent".to_owned(), "00-abc".to_owned());
        props.insert("other".to_owned(), "x".to_owned());

        let extractor = PropertiesExtractor::new(&props);
        assert_eq!(extractor.get("traceparent"), Some("00-abc"));
        assert_eq!(extractor.get("missing"), None);
        assert_eq!(extractor.keys(), vec!["other", "traceparent"]);
    }
}
