//! Container event fan-out
//!
//! One upstream event stream is shared by every subscriber. A dedicated task
//! drains upstream and offers each event to every subscriber queue in turn:
//! - a full queue gets a bounded grace period, after which the subscriber is
//!   evicted and its sequence closed
//! - an upstream failure closes every subscriber and drops the upstream, the
//!   next subscription opens a fresh one

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tonic::Status;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::observability::{ResmgrMetrics, StructuredLogger};

/// Time a full subscriber queue gets to make room for an event.
pub const EVENT_RELAY_TIMEOUT: Duration = Duration::from_secs(1);

/// Events buffered per subscriber.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 128;

/// Upstream opens a subscription may go through before giving up.
const SUBSCRIBE_ATTEMPTS: usize = 3;

/// Upstream provider of the shared event stream.
#[async_trait]
pub trait EventSource<E>: Send + Sync + 'static {
    async fn open(&self) -> Result<BoxStream<'static, Result<E, Status>>, Status>;
}

struct Upstream {
    generation: u64,
    stop: oneshot::Sender<()>,
}

struct Registry<E> {
    subscribers: BTreeMap<u64, mpsc::Sender<E>>,
    upstream: Option<Upstream>,
    next_id: u64,
    generation: u64,
}

struct Inner<E> {
    source: Arc<dyn EventSource<E>>,
    registry: Mutex<Registry<E>>,
    opening: Mutex<()>,
    delivery_timeout: Duration,
    capacity: usize,
    metrics: ResmgrMetrics,
    logger: StructuredLogger,
}

/// Fan-out multiplexer for a single upstream event stream.
pub struct EventRelay<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for EventRelay<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// A subscriber's event sequence. Ends on eviction, upstream loss or relay stop.
#[derive(Debug)]
pub struct Subscription<E> {
    id: u64,
    events: mpsc::Receiver<E>,
}

impl<E> Subscription<E> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<E> {
        self.events.recv().await
    }
}

impl<E> Stream for Subscription<E> {
    type Item = E;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<E>> {
        self.events.poll_recv(cx)
    }
}

impl<E: Clone + Send + 'static> EventRelay<E> {
    pub fn new(source: Arc<dyn EventSource<E>>, node_name: &str) -> Self {
        Self::with_limits(
            source,
            node_name,
            EVENT_RELAY_TIMEOUT,
            SUBSCRIBER_QUEUE_CAPACITY,
        )
    }

    pub fn with_limits(
        source: Arc<dyn EventSource<E>>,
        node_name: &str,
        delivery_timeout: Duration,
        capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                registry: Mutex::new(Registry {
                    subscribers: BTreeMap::new(),
                    upstream: None,
                    next_id: 0,
                    generation: 0,
                }),
                opening: Mutex::new(()),
                delivery_timeout,
                capacity: capacity.max(1),
                metrics: ResmgrMetrics::new(),
                logger: StructuredLogger::new(node_name),
            }),
        }
    }

    /// Register a subscriber, opening the upstream stream if there is none.
    ///
    /// The subscriber is only registered while an upstream is live, so an
    /// upstream lost in between is reopened rather than leaving a sequence
    /// nothing will ever feed or close.
    pub async fn subscribe(&self) -> Result<Subscription<E>, RelayError> {
        let mut attempts = 0;
        let mut registry = loop {
            self.ensure_upstream().await?;
            let registry = self.inner.registry.lock().await;
            if registry.upstream.is_some() {
                break registry;
            }
            drop(registry);

            attempts += 1;
            if attempts >= SUBSCRIBE_ATTEMPTS {
                return Err(RelayError::EventStream(Status::unavailable(
                    "upstream container event stream keeps failing",
                )));
            }
            debug!(attempts, "Upstream lost before subscribing, reopening");
        };

        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.insert(id, tx);
        self.inner
            .metrics
            .set_event_subscribers(registry.subscribers.len());

        debug!(subscriber = id, "Registered container event subscriber");
        Ok(Subscription { id, events: rx })
    }

    /// Remove a subscriber, closing its sequence.
    pub async fn unsubscribe(&self, id: u64) {
        let mut registry = self.inner.registry.lock().await;
        if registry.subscribers.remove(&id).is_some() {
            debug!(subscriber = id, "Unregistered container event subscriber");
        }
        self.inner
            .metrics
            .set_event_subscribers(registry.subscribers.len());
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.registry.lock().await.subscribers.len()
    }

    /// Whether an upstream stream is currently open.
    pub async fn is_connected(&self) -> bool {
        self.inner.registry.lock().await.upstream.is_some()
    }

    /// Drop the upstream stream and close every subscriber.
    pub async fn stop(&self) {
        let mut registry = self.inner.registry.lock().await;
        if let Some(upstream) = registry.upstream.take() {
            let _ = upstream.stop.send(());
        }
        registry.subscribers.clear();
        self.inner.metrics.set_event_subscribers(0);
    }

    async fn ensure_upstream(&self) -> Result<(), RelayError> {
        if self.inner.registry.lock().await.upstream.is_some() {
            return Ok(());
        }

        // one opener at a time, the registry stays unlocked while opening
        let _opening = self.inner.opening.lock().await;
        if self.inner.registry.lock().await.upstream.is_some() {
            return Ok(());
        }

        let stream = self
            .inner
            .source
            .open()
            .await
            .map_err(RelayError::EventStream)?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let mut registry = self.inner.registry.lock().await;
        registry.generation += 1;
        let generation = registry.generation;
        registry.upstream = Some(Upstream {
            generation,
            stop: stop_tx,
        });
        drop(registry);

        info!(generation, "Opened upstream container event stream");
        tokio::spawn(relay_events(self.inner.clone(), generation, stream, stop_rx));
        Ok(())
    }
}

async fn relay_events<E: Clone + Send + 'static>(
    inner: Arc<Inner<E>>,
    generation: u64,
    mut stream: BoxStream<'static, Result<E, Status>>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        let next = tokio::select! {
            _ = &mut stop => {
                debug!(generation, "Upstream event relay stopped");
                return;
            }
            next = stream.next() => next,
        };

        let event = match next {
            Some(Ok(event)) => event,
            failure => {
                match failure {
                    Some(Err(status)) => {
                        warn!(generation, error = %status, "Upstream container event stream failed")
                    }
                    _ => warn!(generation, "Upstream container event stream closed"),
                }
                inner.metrics.inc_upstream_event_failures();

                let mut registry = inner.registry.lock().await;
                if registry
                    .upstream
                    .as_ref()
                    .map(|u| u.generation == generation)
                    .unwrap_or(false)
                {
                    registry.upstream = None;
                    registry.subscribers.clear();
                    inner.metrics.set_event_subscribers(0);
                }
                return;
            }
        };

        let mut registry = inner.registry.lock().await;
        let mut gone = Vec::new();
        for (&id, tx) in registry.subscribers.iter() {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Closed(_)) => gone.push(id),
                Err(TrySendError::Full(event)) => {
                    match tokio::time::timeout(inner.delivery_timeout, tx.send(event)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => gone.push(id),
                        Err(_) => {
                            inner.logger.log_subscriber_evicted(
                                id,
                                inner.delivery_timeout.as_millis() as u64,
                            );
                            inner.metrics.inc_evicted_subscribers();
                            gone.push(id);
                        }
                    }
                }
            }
        }

        for id in gone {
            registry.subscribers.remove(&id);
        }
        inner
            .metrics
            .set_event_subscribers(registry.subscribers.len());
    }
}
