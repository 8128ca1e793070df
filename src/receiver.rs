// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Receiver Engine
//!
//! A [`Receiver`] keeps one destination subscribed for as long as it runs. It
//! spawns a dedicated task that repeatedly opens a [`ConsumerSession`], polls it
//! for messages and processes them one at a time. Whenever the session breaks,
//! the session is torn down and a new one is opened, sleeping a fixed backoff
//! when failures happen back to back. The task only ends when [`Receiver::stop`]
//! is called.
//!
//! ```text
//! STOPPED -> CONNECTING -> LISTENING -> (error) -> BACKOFF -> CONNECTING -> ... -> STOPPED
//! ```

use crate::{
    broker::{
        close_silently, AckMode, BrokerConnection, BrokerSession, ConnectionFactory,
        MessageConsumer,
    },
    codec::MessageCodec,
    consumer::{process_message, ReceiverDefinition},
    destination::{self, Destination},
    errors::BrokerError,
    handler::{MessageHandler, ReceiverFilter},
    health::ReceiverHealthCheck,
    lifecycle::Managed,
    policy::ExceptionPolicy,
};
use async_trait::async_trait;
use futures_util::FutureExt;
use opentelemetry::global::{self, BoxedTracer};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, Notify},
    task::JoinHandle,
    time::{sleep, Instant},
};
use tracing::{debug, error, info, trace, warn};

/// Default bounded wait of a single poll
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(400);
/// Default sleep between reconnect attempts after repeated failures
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(10);
/// Default maximum time `stop` waits for the receiver task
pub const DEFAULT_SHUTDOWN_WAIT: Duration = Duration::from_secs(20);

const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// Timing knobs of a receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverOptions {
    pub poll_timeout: Duration,
    pub backoff: Duration,
    pub shutdown_wait: Duration,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        ReceiverOptions {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            backoff: DEFAULT_BACKOFF,
            shutdown_wait: DEFAULT_SHUTDOWN_WAIT,
        }
    }
}

/// Shared state of a receiver.
///
/// `should_stop` is written by [`Receiver::start`] and [`Receiver::stop`],
/// everything else only by the receiver task.
#[derive(Debug, Default)]
pub struct ReceptionState {
    should_stop: AtomicBool,
    is_receiving: AtomicBool,
    errors_in_a_row: AtomicU32,
    wake: Notify,
}

impl ReceptionState {
    pub fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::SeqCst)
    }

    pub fn is_receiving(&self) -> bool {
        self.is_receiving.load(Ordering::SeqCst)
    }

    /// Number of consecutive failed session generations.
    pub fn consecutive_errors(&self) -> u32 {
        self.errors_in_a_row.load(Ordering::SeqCst)
    }

    fn request_stop(&self) {
        self.should_stop.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Clears a previous stop request, including a wake-up nobody consumed.
    /// Only called while no receiver task is running.
    fn reset(&self) {
        self.should_stop.store(false, Ordering::SeqCst);
        let _ = self.wake.notified().now_or_never();
    }
}

/// One connection, session and consumer triple, exclusively owned by the
/// receiver task for the duration of one generation.
pub(crate) struct ConsumerSession {
    connection: Box<dyn BrokerConnection>,
    session: Box<dyn BrokerSession>,
    consumer: Box<dyn MessageConsumer>,
}

impl ConsumerSession {
    /// Opens the triple in client-acknowledge mode. Whatever was opened before a
    /// failure is closed again.
    pub(crate) async fn open(
        factory: &dyn ConnectionFactory,
        destination: &Destination,
    ) -> Result<ConsumerSession, BrokerError> {
        let connection = factory.create_connection().await?;

        let session = match connection.create_session(AckMode::Client).await {
            Ok(session) => session,
            Err(err) => {
                close_silently("connection", connection.close()).await;
                return Err(err);
            }
        };

        let consumer = match session.create_consumer(destination).await {
            Ok(consumer) => consumer,
            Err(err) => {
                close_silently("session", session.close()).await;
                close_silently("connection", connection.close()).await;
                return Err(err);
            }
        };

        Ok(ConsumerSession {
            connection,
            session,
            consumer,
        })
    }

    pub(crate) fn consumer(&mut self) -> &mut dyn MessageConsumer {
        self.consumer.as_mut()
    }

    /// Closes consumer, session and connection, in that order.
    pub(crate) async fn close(mut self) {
        close_silently("consumer", self.consumer.close()).await;
        close_silently("session", self.session.close()).await;
        close_silently("connection", self.connection.close()).await;
    }
}

/// Long-lived subscription to one destination.
pub struct Receiver<T> {
    def: ReceiverDefinition<T>,
    factory: Arc<dyn ConnectionFactory>,
    options: ReceiverOptions,
    state: Arc<ReceptionState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T> Receiver<T>
where
    T: Send + 'static,
{
    /// Creates a stopped receiver for the logical `destination`.
    pub fn new<C, H>(
        destination: &str,
        factory: Arc<dyn ConnectionFactory>,
        codec: C,
        handler: H,
        policy: Arc<dyn ExceptionPolicy>,
    ) -> Self
    where
        C: MessageCodec<T> + 'static,
        H: MessageHandler<T> + 'static,
    {
        Receiver {
            def: ReceiverDefinition {
                destination: destination.to_owned(),
                codec: Arc::new(codec),
                handler: Arc::new(handler),
                policy,
                filters: vec![],
            },
            factory,
            options: ReceiverOptions::default(),
            state: Arc::new(ReceptionState::default()),
            task: Mutex::new(None),
        }
    }

    pub fn with_options(mut self, options: ReceiverOptions) -> Self {
        self.options = options;
        self
    }

    /// Adds a filter applied to every message before it is decoded.
    pub fn with_filter(mut self, filter: Arc<dyn ReceiverFilter>) -> Self {
        self.def.filters.push(filter);
        self
    }

    pub fn destination(&self) -> &str {
        &self.def.destination
    }

    pub fn options(&self) -> &ReceiverOptions {
        &self.options
    }

    pub fn is_receiving(&self) -> bool {
        self.state.is_receiving()
    }

    pub fn state(&self) -> Arc<ReceptionState> {
        self.state.clone()
    }

    /// Health probe reporting whether this receiver is currently listening.
    pub fn health_check(&self) -> ReceiverHealthCheck {
        ReceiverHealthCheck::new(&self.def.destination, self.state.clone())
    }

    /// Spawns the receiver task. Starting a running receiver does nothing.
    ///
    /// When a previous [`Receiver::stop`] gave up on a task that is still
    /// winding down, this waits for that task to end first, so there is never
    /// more than one task per receiver.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            if !handle.is_finished() {
                if !self.state.should_stop() {
                    warn!(destination = self.def.destination, "receiver already started");
                    *task = Some(handle);
                    return;
                }

                info!(
                    destination = self.def.destination,
                    "waiting for the previous receiver task to end"
                );
                if let Err(err) = handle.await {
                    error!(error = err.to_string(), "previous receiver task failed");
                }
            }
        }

        info!(destination = self.def.destination, "starting receiver");
        self.state.reset();

        *task = Some(tokio::spawn(run(
            self.def.clone(),
            self.factory.clone(),
            self.options.clone(),
            self.state.clone(),
        )));
    }

    /// Asks the receiver task to stop and waits for it, at most the configured
    /// shutdown wait. Past that it gives up and returns anyway, the task keeps
    /// its stop request and ends on its own.
    pub async fn stop(&self) {
        info!(
            destination = self.def.destination,
            wait_secs = self.options.shutdown_wait.as_secs(),
            "stopping receiver"
        );

        let mut task = self.task.lock().await;
        if let Some(handle) = task.as_ref() {
            self.state.request_stop();

            let start = Instant::now();
            while !handle.is_finished() {
                if start.elapsed() >= self.options.shutdown_wait {
                    warn!(
                        destination = self.def.destination,
                        "giving up waiting for receiver task shutdown"
                    );
                    break;
                }
                debug!("receiver task is still alive..");
                sleep(STOP_CHECK_INTERVAL).await;
            }

            if handle.is_finished() {
                *task = None;
            }
        }

        info!(destination = self.def.destination, "stopped receiver");
    }
}

#[async_trait]
impl<T> Managed for Receiver<T>
where
    T: Send + 'static,
{
    async fn start(&self) {
        Receiver::start(self).await
    }

    async fn stop(&self) {
        Receiver::stop(self).await
    }
}

async fn run<T>(
    def: ReceiverDefinition<T>,
    factory: Arc<dyn ConnectionFactory>,
    options: ReceiverOptions,
    state: Arc<ReceptionState>,
) where
    T: Send + 'static,
{
    let tracer = global::tracer("receiver");
    state.errors_in_a_row.store(0, Ordering::SeqCst);

    // The first "consumer is closed" failure is a known transient, the set-up
    // that follows it is logged quietly.
    let mut verbose = true;

    while !state.should_stop() {
        if verbose {
            info!(destination = def.destination, "setting up receiver");
        } else {
            debug!(destination = def.destination, "setting up receiver");
        }

        let outcome = generation(&tracer, &def, factory.as_ref(), &options, &state, verbose).await;
        let Err(err) = outcome else {
            continue;
        };

        let errors_in_a_row = state.errors_in_a_row.fetch_add(1, Ordering::SeqCst) + 1;
        let continuing = errors_in_a_row > 1;
        verbose = true;

        if err == BrokerError::ConsumerClosed && !continuing {
            debug!(
                destination = def.destination,
                "consumer is closed - will try to recover"
            );
            verbose = false;
        } else {
            error!(
                error = err.to_string(),
                destination = def.destination,
                "uncaught error - will try to recover"
            );
        }

        if continuing {
            warn!(
                errors_in_a_row,
                backoff_ms = options.backoff.as_millis() as u64,
                "errors in a row - going to sleep before retrying"
            );
            tokio::select! {
                _ = sleep(options.backoff) => {}
                _ = state.wake.notified() => {}
            }
        }
    }

    debug!(destination = def.destination, "receiver task stopped");
}

/// One connect, listen, teardown cycle.
async fn generation<T>(
    tracer: &BoxedTracer,
    def: &ReceiverDefinition<T>,
    factory: &dyn ConnectionFactory,
    options: &ReceiverOptions,
    state: &ReceptionState,
    verbose: bool,
) -> Result<(), BrokerError>
where
    T: Send + 'static,
{
    let destination = destination::resolve(&def.destination);
    let mut session = ConsumerSession::open(factory, &destination).await?;

    if verbose {
        info!(destination = def.destination, "started listening for messages");
    } else {
        debug!(destination = def.destination, "started listening for messages");
    }

    state.is_receiving.store(true, Ordering::SeqCst);
    let result = receive_loop(tracer, def, session.consumer(), options, state).await;
    state.is_receiving.store(false, Ordering::SeqCst);

    session.close().await;
    result
}

async fn receive_loop<T>(
    tracer: &BoxedTracer,
    def: &ReceiverDefinition<T>,
    consumer: &mut dyn MessageConsumer,
    options: &ReceiverOptions,
    state: &ReceptionState,
) -> Result<(), BrokerError>
where
    T: Send + 'static,
{
    while !state.should_stop() {
        trace!("checking for new message");
        let message = consumer.receive(options.poll_timeout).await?;
        state.errors_in_a_row.store(0, Ordering::SeqCst);

        if let Some(message) = message {
            process_message(tracer, def, consumer, message).await?;
        }
    }

    Ok(())
}
