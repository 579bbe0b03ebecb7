//! Runtime relay
//!
//! Serves the container runtime interface on the relay socket and forwards
//! every call unmodified to the real runtime. Container event streams are the
//! one exception: all subscribers share a single upstream stream through
//! [`EventRelay`].

mod backend;
mod codec;
pub mod events;
mod server;


pub use backend::{
    is_listening_socket, socket_path, GrpcRuntimeBackend, RuntimeBackend,
    CONTAINER_EVENTS_METHOD, IMAGE_SERVICE_PREFIX, RUNTIME_SERVICE_PREFIX,
};
pub use codec::RawCodec;
pub use events::{EventRelay, EventSource, Subscription};
pub use server::{ImageApi, RelayServer, RelayService, RelayedService, RuntimeApi};

use futures::stream::{BoxStream, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tonic::codegen::Bytes;
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::error::RelayError;
use crate::observability::ResmgrMetrics;

/// Describes a relayed request for diagnostics, given its method and payload.
pub type Qualifier = Arc<dyn Fn(&str, &[u8]) -> String + Send + Sync>;

/// Relay endpoints and diagnostics switches.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub relay_socket: PathBuf,
    pub runtime_socket: PathBuf,
    pub image_socket: Option<PathBuf>,
    pub dump_requests: bool,
    pub node_name: String,
}

/// Transparent forwarder of runtime calls.
pub struct ProtocolRelay {
    backend: Arc<dyn RuntimeBackend>,
    events: EventRelay<Bytes>,
    qualifier: Option<Qualifier>,
    dump_requests: bool,
    metrics: ResmgrMetrics,
}

impl std::fmt::Debug for ProtocolRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolRelay")
            .field("dump_requests", &self.dump_requests)
            .field("qualifier", &self.qualifier.is_some())
            .finish()
    }
}

impl ProtocolRelay {
    pub fn new(backend: Arc<dyn RuntimeBackend>, events: EventRelay<Bytes>) -> Self {
        Self {
            backend,
            events,
            qualifier: None,
            dump_requests: false,
            metrics: ResmgrMetrics::new(),
        }
    }

    /// Relay to the runtime sockets named in `options`.
    pub fn connect(options: &RelayOptions) -> Result<Self, RelayError> {
        let backend = Arc::new(GrpcRuntimeBackend::connect(
            &options.runtime_socket,
            options.image_socket.as_deref(),
        )?);
        let events = EventRelay::<Bytes>::new(backend.clone(), &options.node_name);

        Ok(Self::new(backend, events).with_request_dump(options.dump_requests))
    }

    pub fn with_qualifier(mut self, qualifier: Qualifier) -> Self {
        self.qualifier = Some(qualifier);
        self
    }

    pub fn with_request_dump(mut self, enabled: bool) -> Self {
        self.dump_requests = enabled;
        self
    }

    pub fn events(&self) -> &EventRelay<Bytes> {
        &self.events
    }

    /// Qualifier string for a request, empty without a qualifier.
    pub fn qualify(&self, method: &str, payload: &[u8]) -> String {
        self.qualifier
            .as_ref()
            .map(|q| q(method, payload))
            .unwrap_or_default()
    }

    /// Forward one unary call and hand back the runtime's reply verbatim.
    pub async fn forward(
        &self,
        method: &str,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, Status> {
        if self.dump_requests {
            let qualifier = self.qualify(method, request.get_ref());
            debug!(method, qualifier = %qualifier, size = request.get_ref().len(), "Relaying request");
        }

        let started = Instant::now();
        let result = self.backend.unary(method, request).await;
        self.metrics.observe_relayed_call(
            method,
            result.is_ok(),
            started.elapsed().as_secs_f64(),
        );

        if let Err(status) = &result {
            debug!(method, code = ?status.code(), "Runtime call failed");
        }
        result
    }

    /// Subscribe the caller to the shared container event stream.
    pub async fn container_events(
        &self,
    ) -> Result<BoxStream<'static, Result<Bytes, Status>>, Status> {
        if self.dump_requests {
            debug!(method = CONTAINER_EVENTS_METHOD, "Relaying request");
        }

        let subscription = self.events.subscribe().await.map_err(|e| match e {
            RelayError::EventStream(status) => status,
            other => Status::unavailable(other.to_string()),
        })?;
        Ok(subscription.map(Ok).boxed())
    }

    /// Stop the shared event stream, closing every subscriber.
    pub async fn stop(&self) {
        self.events.stop().await;
    }
}
