//! Server side of the relay: the runtime services offered on the relay socket

use std::future::Future;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::codegen::{http, Body, BoxFuture, Bytes, Service, StdError};
use tonic::server::{Grpc, NamedService, ServerStreamingService, UnaryService};
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use futures::stream::BoxStream;
use tracing::{info, warn};

use super::backend::{is_listening_socket, CONTAINER_EVENTS_METHOD};
use super::codec::RawCodec;
use super::ProtocolRelay;
use crate::error::RelayError;

/// A runtime interface service exposed by the relay.
pub trait RelayedService: Send + Sync + 'static {
    const NAME: &'static str;
}

#[derive(Debug, Clone, Copy)]
pub struct RuntimeApi;

#[derive(Debug, Clone, Copy)]
pub struct ImageApi;

impl RelayedService for RuntimeApi {
    const NAME: &'static str = "runtime.v1.RuntimeService";
}

impl RelayedService for ImageApi {
    const NAME: &'static str = "runtime.v1.ImageService";
}

/// tower service relaying every method of one runtime interface service.
pub struct RelayService<S> {
    relay: Arc<ProtocolRelay>,
    _service: PhantomData<S>,
}

impl<S> RelayService<S> {
    pub fn new(relay: Arc<ProtocolRelay>) -> Self {
        Self {
            relay,
            _service: PhantomData,
        }
    }
}

impl<S> Clone for RelayService<S> {
    fn clone(&self) -> Self {
        Self::new(self.relay.clone())
    }
}

impl<S: RelayedService> NamedService for RelayService<S> {
    const NAME: &'static str = S::NAME;
}

struct Forward {
    relay: Arc<ProtocolRelay>,
    method: String,
}

impl UnaryService<Bytes> for Forward {
    type Response = Bytes;
    type Future = BoxFuture<Response<Bytes>, Status>;

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        let relay = self.relay.clone();
        let method = std::mem::take(&mut self.method);
        Box::pin(async move { relay.forward(&method, request).await })
    }
}

struct ContainerEvents {
    relay: Arc<ProtocolRelay>,
}

impl ServerStreamingService<Bytes> for ContainerEvents {
    type Response = Bytes;
    type ResponseStream = BoxStream<'static, Result<Bytes, Status>>;
    type Future = BoxFuture<Response<Self::ResponseStream>, Status>;

    fn call(&mut self, _request: Request<Bytes>) -> Self::Future {
        let relay = self.relay.clone();
        Box::pin(async move { relay.container_events().await.map(Response::new) })
    }
}

impl<S, B> Service<http::Request<B>> for RelayService<S>
where
    S: RelayedService,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let relay = self.relay.clone();
        let method = req.uri().path().to_string();

        if method == CONTAINER_EVENTS_METHOD {
            return Box::pin(async move {
                let mut grpc = Grpc::new(RawCodec);
                Ok(grpc.server_streaming(ContainerEvents { relay }, req).await)
            });
        }

        let in_service = method
            .strip_prefix('/')
            .and_then(|m| m.strip_prefix(S::NAME))
            .map(|m| m.starts_with('/'))
            .unwrap_or(false);
        if !in_service {
            return Box::pin(async move {
                Ok(Status::unimplemented(format!("unknown method {}", method)).to_http())
            });
        }

        Box::pin(async move {
            let mut grpc = Grpc::new(RawCodec);
            Ok(grpc.unary(Forward { relay, method }, req).await)
        })
    }
}

/// The relay socket listener.
#[derive(Debug)]
pub struct RelayServer {
    socket: PathBuf,
    listener: UnixListener,
}

impl RelayServer {
    /// Bind the relay socket, replacing a stale socket file but refusing one
    /// another process still serves.
    pub async fn bind(socket: impl Into<PathBuf>) -> Result<Self, RelayError> {
        let socket = socket.into();
        let err = |source| RelayError::Socket {
            socket: socket.display().to_string(),
            source,
        };

        if socket.exists() {
            if is_listening_socket(&socket).await {
                return Err(err(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    "socket is in use by another process",
                )));
            }
            std::fs::remove_file(&socket).map_err(err)?;
        }
        if let Some(dir) = socket.parent() {
            std::fs::create_dir_all(dir).map_err(err)?;
        }

        let listener = UnixListener::bind(&socket).map_err(err)?;
        info!(socket = %socket.display(), "Relay socket created");
        Ok(Self { socket, listener })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Serve both runtime services until `shutdown` resolves.
    pub async fn serve<F>(self, relay: Arc<ProtocolRelay>, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()> + Send,
    {
        let incoming = UnixListenerStream::new(self.listener);
        let result = Server::builder()
            .add_service(RelayService::<RuntimeApi>::new(relay.clone()))
            .add_service(RelayService::<ImageApi>::new(relay.clone()))
            .serve_with_incoming_shutdown(incoming, shutdown)
            .await;

        relay.stop().await;
        if let Err(e) = std::fs::remove_file(&self.socket) {
            warn!(socket = %self.socket.display(), error = %e, "Failed to remove relay socket");
        }

        result.map_err(|e| RelayError::Socket {
            socket: self.socket.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        })
    }
}
