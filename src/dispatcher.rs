// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Dispatcher
//!
//! The entry point for applications. A [`Dispatcher`] is bound to one broker
//! and acts as registry for everything talking to it:
//! - receivers are registered during start-up and started or stopped together
//!   through the [`Managed`] contract
//! - senders are created on demand and share the dispatcher's sender filters
//! - health probes are exposed for the host's health registry, one per receiver
//!   plus one broker connectivity probe
//!
//! Several brokers can be served side by side by giving each dispatcher a name.

use crate::{
    broker::ConnectionFactory,
    channel::AmqpConnectionFactory,
    codec::MessageCodec,
    config::BrokerConfig,
    errors::BrokerError,
    handler::MessageHandler,
    health::{ConnectivityHealthCheck, HealthCheck, ReceiverHealthCheck},
    lifecycle::Managed,
    policy::{ack_on_exception, ExceptionPolicy},
    publisher::{Sender, SenderFilter},
    receiver::{Receiver, ReceiverOptions},
};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::{sync::Arc, time::Duration};
use tracing::info;

const DEFAULT_NAME: &str = "broker-receiver";

struct RegisteredReceiver {
    destination: String,
    managed: Arc<dyn Managed>,
    health: ReceiverHealthCheck,
}

/// Registry of receivers, senders and health probes for one broker.
pub struct Dispatcher {
    name: Option<String>,
    config: BrokerConfig,
    factory: Arc<dyn ConnectionFactory>,
    probe_factory: Arc<dyn ConnectionFactory>,
    sender_filters: Vec<Arc<dyn SenderFilter>>,
    receivers: Vec<RegisteredReceiver>,
}

impl Dispatcher {
    /// Creates a dispatcher over the given factories.
    ///
    /// # Parameters
    /// * `config` - Broker settings
    /// * `factory` - Connection factory shared by receivers and senders
    /// * `probe_factory` - Connection factory used by the connectivity probe
    pub fn new(
        config: BrokerConfig,
        factory: Arc<dyn ConnectionFactory>,
        probe_factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Dispatcher {
            name: None,
            config,
            factory,
            probe_factory,
            sender_filters: vec![],
            receivers: vec![],
        }
    }

    /// Creates a dispatcher for an AMQP broker, with a pooled factory for
    /// receivers and senders and a dedicated one for the connectivity probe.
    pub fn amqp(config: BrokerConfig) -> Result<Self, BrokerError> {
        info!("setting up broker");
        let factory = AmqpConnectionFactory::new(&config, DEFAULT_NAME)?;
        let probe_factory = AmqpConnectionFactory::unpooled(&config, DEFAULT_NAME)?;
        Ok(Self::new(config, Arc::new(factory), Arc::new(probe_factory)))
    }

    /// Names this dispatcher, telling its probes apart from other brokers'.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The factory receivers and senders connect through.
    pub fn connection_factory(&self) -> Arc<dyn ConnectionFactory> {
        self.factory.clone()
    }

    /// Registers a receiver for `destination`. It is started along with the
    /// dispatcher.
    ///
    /// # Parameters
    /// * `destination` - Logical destination, e.g. `queue:orders`
    /// * `codec` - Decodes payloads into `T`
    /// * `handler` - Processes decoded messages
    /// * `policy` - Decides what happens to messages whose processing failed
    ///
    /// # Returns
    /// A handle on the registered receiver
    pub fn register<T, C, H>(
        &mut self,
        destination: &str,
        codec: C,
        handler: H,
        policy: Arc<dyn ExceptionPolicy>,
    ) -> Arc<Receiver<T>>
    where
        T: Send + 'static,
        C: MessageCodec<T> + 'static,
        H: MessageHandler<T> + 'static,
    {
        let receiver = Receiver::new(destination, self.factory.clone(), codec, handler, policy)
            .with_options(ReceiverOptions {
                shutdown_wait: self.config.shutdown_wait(),
                ..ReceiverOptions::default()
            });
        self.register_receiver(receiver)
    }

    /// Registers a receiver that either acknowledges or rolls back failed messages.
    pub fn register_with_ack_flag<T, C, H>(
        &mut self,
        destination: &str,
        codec: C,
        handler: H,
        ack_on_error: bool,
    ) -> Arc<Receiver<T>>
    where
        T: Send + 'static,
        C: MessageCodec<T> + 'static,
        H: MessageHandler<T> + 'static,
    {
        self.register(destination, codec, handler, ack_on_exception(ack_on_error))
    }

    /// Registers an already built receiver, e.g. one with filters.
    pub fn register_receiver<T>(&mut self, receiver: Receiver<T>) -> Arc<Receiver<T>>
    where
        T: Send + 'static,
    {
        info!(destination = receiver.destination(), "registering receiver");
        let receiver = Arc::new(receiver);

        self.receivers.push(RegisteredReceiver {
            destination: receiver.destination().to_owned(),
            managed: receiver.clone(),
            health: receiver.health_check(),
        });
        receiver
    }

    /// Adds a filter applied to messages sent by senders created afterwards.
    pub fn add_sender_filter(&mut self, filter: Arc<dyn SenderFilter>) {
        self.sender_filters.push(filter);
    }

    /// Creates a sender using the configured default time to live.
    pub fn create_sender(&self, destination: &str, persistent: bool) -> Sender {
        self.build_sender(destination, persistent, self.config.default_ttl())
    }

    /// Creates a sender with its own time to live.
    pub fn create_sender_with_ttl(
        &self,
        destination: &str,
        persistent: bool,
        ttl: Duration,
    ) -> Sender {
        self.build_sender(destination, persistent, Some(ttl))
    }

    fn build_sender(&self, destination: &str, persistent: bool, ttl: Option<Duration>) -> Sender {
        self.sender_filters.iter().fold(
            Sender::new(self.factory.clone(), destination, persistent, ttl),
            |sender, filter| sender.with_filter(filter.clone()),
        )
    }

    /// Name under which the connectivity probe is registered.
    pub fn broker_health_check_name(&self) -> String {
        match &self.name {
            Some(name) => format!("broker_{}", name),
            None => "broker".to_owned(),
        }
    }

    /// Health probes to register with the host: one per receiver, then the
    /// broker connectivity probe.
    pub fn health_checks(&self) -> Vec<(String, Arc<dyn HealthCheck>)> {
        let mut checks: Vec<(String, Arc<dyn HealthCheck>)> = self
            .receivers
            .iter()
            .map(|registered| {
                (
                    format!("receiver {}", registered.destination),
                    Arc::new(registered.health.clone()) as Arc<dyn HealthCheck>,
                )
            })
            .collect();

        checks.push((
            self.broker_health_check_name(),
            Arc::new(ConnectivityHealthCheck::new(
                self.probe_factory.clone(),
                self.config.health_check_wait(),
            )),
        ));
        checks
    }
}

#[async_trait]
impl Managed for Dispatcher {
    async fn start(&self) {
        for registered in &self.receivers {
            registered.managed.start().await;
        }
    }

    async fn stop(&self) {
        join_all(self.receivers.iter().map(|registered| registered.managed.stop())).await;
    }
}
