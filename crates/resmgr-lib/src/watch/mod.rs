//! Reconnecting watches of single remote objects
//!
//! A `WatchSession` follows one named object through an `ObjectSource`:
//! - it queries the object once before watching and emits a synthetic
//!   `Missing` event if the object cannot be found
//! - it reopens the remote watch whenever the stream ends, backing off
//!   after failures
//! - it stops on request, or when the session is dropped
//!
//! A session without a target name is inert and never touches the source.

mod sources;

pub use sources::KubeObjectSource;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::WatchError;
use crate::observability::ResmgrMetrics;

/// Delay before retrying a failed watch.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

const EVENT_BUFFER: usize = 16;

/// Change notification for a watched object.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// The object did not exist when the session started.
    SyntheticMissing,
}

impl<K> WatchEvent<K> {
    /// The object carried by the event, if any.
    pub fn object(&self) -> Option<&K> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => Some(o),
            WatchEvent::SyntheticMissing => None,
        }
    }
}

/// Stream of remote events. Errors end the current watch.
pub type EventStream<K> = BoxStream<'static, Result<WatchEvent<K>, WatchError>>;

/// Remote store access for one kind of object.
#[async_trait]
pub trait ObjectSource<K>: Send + Sync + 'static {
    /// Kind of the watched objects, for logging.
    fn kind(&self) -> &str;

    /// Namespace of the watched objects, empty for cluster scoped kinds.
    fn namespace(&self) -> &str {
        ""
    }

    /// Fetch the named object, `None` if it does not exist.
    async fn query(&self, name: &str) -> Result<Option<K>, WatchError>;

    /// Open a watch on the named object.
    async fn open(&self, name: &str) -> Result<EventStream<K>, WatchError>;
}

struct Running<K> {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
    events: mpsc::Receiver<WatchEvent<K>>,
}

/// Self-healing watch on a single named object.
pub struct WatchSession<K> {
    source: Arc<dyn ObjectSource<K>>,
    name: String,
    backoff: Duration,
    running: Option<Running<K>>,
    metrics: ResmgrMetrics,
}

impl<K: Send + 'static> std::fmt::Debug for WatchSession<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSession")
            .field("target", &self.target())
            .field("running", &self.running.is_some())
            .finish()
    }
}

impl<K: Send + 'static> WatchSession<K> {
    /// Create an inert session.
    pub fn new(source: Arc<dyn ObjectSource<K>>) -> Self {
        Self {
            source,
            name: String::new(),
            backoff: DEFAULT_BACKOFF,
            running: None,
            metrics: ResmgrMetrics::new(),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Name of the watched object, empty when inert.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human readable target, `Kind:namespace/name`.
    pub fn target(&self) -> String {
        describe(self.source.as_ref(), &self.name)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// (Re)start watching `name`, dropping any previous target.
    ///
    /// Events of a previous target still queued are discarded. An empty name
    /// leaves the session inert.
    pub fn start(&mut self, name: impl Into<String>) {
        self.stop();
        self.name = name.into();
        if self.name.is_empty() {
            return;
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(run_session(
            self.source.clone(),
            self.name.clone(),
            self.backoff,
            event_tx,
            stop_rx,
            self.metrics.clone(),
        ));

        self.running = Some(Running {
            stop: stop_tx,
            task,
            events: event_rx,
        });
    }

    /// Stop the session. Safe to call in any state.
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            debug!(target_object = %self.target(), "Stopping watch");
            let _ = running.stop.send(());
            drop(running.task);
        }
    }

    /// Query the watched object. An inert session has nothing to query.
    pub async fn query(&self) -> Result<Option<K>, WatchError> {
        if self.name.is_empty() {
            return Ok(None);
        }
        self.source.query(&self.name).await
    }

    /// Receive the next event.
    ///
    /// Waits forever on an inert or stopped session, so it can sit in a
    /// `select!` next to live sessions.
    pub async fn recv(&mut self) -> WatchEvent<K> {
        if let Some(running) = self.running.as_mut() {
            if let Some(event) = running.events.recv().await {
                return event;
            }
        }
        std::future::pending().await
    }
}

impl<K> Drop for WatchSession<K> {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.stop.send(());
        }
    }
}

fn describe<K: Send + 'static>(source: &dyn ObjectSource<K>, name: &str) -> String {
    let name = if name.is_empty() { "<none>" } else { name };
    match source.namespace() {
        "" => format!("{}:{}", source.kind(), name),
        ns => format!("{}:{}/{}", source.kind(), ns, name),
    }
}

/// Deliver an event unless stopped. Returns false when the session is over.
async fn deliver<K>(
    tx: &mpsc::Sender<WatchEvent<K>>,
    stop: &mut oneshot::Receiver<()>,
    event: WatchEvent<K>,
) -> bool {
    tokio::select! {
        _ = stop => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

async fn run_session<K: Send + 'static>(
    source: Arc<dyn ObjectSource<K>>,
    name: String,
    backoff: Duration,
    tx: mpsc::Sender<WatchEvent<K>>,
    mut stop: oneshot::Receiver<()>,
    metrics: ResmgrMetrics,
) {
    let target = describe(source.as_ref(), &name);

    // let the consumer know not to expect an initial event
    let present = tokio::select! {
        _ = &mut stop => return,
        result = source.query(&name) => matches!(result, Ok(Some(_))),
    };
    if !present {
        debug!(target_object = %target, "Watched object is missing");
        if !deliver(&tx, &mut stop, WatchEvent::SyntheticMissing).await {
            return;
        }
    }

    loop {
        info!(target_object = %target, "Creating watch");
        let opened = tokio::select! {
            _ = &mut stop => return,
            result = source.open(&name) => result,
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                warn!(target_object = %target, error = %e, "Failed to create watch");
                metrics.inc_watch_reconnects(source.kind());
                tokio::select! {
                    _ = &mut stop => return,
                    _ = tokio::time::sleep(backoff) => continue,
                }
            }
        };

        loop {
            let next = tokio::select! {
                _ = &mut stop => return,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    if !deliver(&tx, &mut stop, event).await {
                        return;
                    }
                }
                Some(Err(e)) => {
                    warn!(target_object = %target, error = %e, "Watch failed, reopening");
                    metrics.inc_watch_reconnects(source.kind());
                    tokio::select! {
                        _ = &mut stop => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    break;
                }
                None => {
                    debug!(target_object = %target, "Watch closed, reopening");
                    break;
                }
            }
        }
    }
}
