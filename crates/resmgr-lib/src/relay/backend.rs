//! Client side of the relay: the real container runtime

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tonic::client::Grpc;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::codegen::Bytes;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Request, Response, Status};
use tower::service_fn;
use tracing::debug;

use super::codec::RawCodec;
use super::events::EventSource;
use crate::error::RelayError;

/// Full path of the runtime's container event stream method.
pub const CONTAINER_EVENTS_METHOD: &str = "/runtime.v1.RuntimeService/GetContainerEvents";

/// Method prefix of the image service.
pub const IMAGE_SERVICE_PREFIX: &str = "/runtime.v1.ImageService/";

/// Method prefix of the runtime service.
pub const RUNTIME_SERVICE_PREFIX: &str = "/runtime.v1.RuntimeService/";

/// Forwarding target for relayed runtime calls.
#[async_trait]
pub trait RuntimeBackend: Send + Sync + 'static {
    /// Forward one unary call, `method` being the full gRPC path.
    async fn unary(&self, method: &str, request: Request<Bytes>) -> Result<Response<Bytes>, Status>;
}

/// Runtime and image services reached over unix sockets.
#[derive(Debug, Clone)]
pub struct GrpcRuntimeBackend {
    runtime: Grpc<Channel>,
    image: Grpc<Channel>,
}

fn unix_channel(socket: &Path) -> Result<Channel, RelayError> {
    let path = socket.to_path_buf();
    let endpoint = Endpoint::try_from("http://[::]:50051").map_err(|e| RelayError::Connect {
        socket: socket.display().to_string(),
        message: e.to_string(),
    })?;

    Ok(endpoint.connect_with_connector_lazy(service_fn(move |_: Uri| {
        UnixStream::connect(path.clone())
    })))
}

impl GrpcRuntimeBackend {
    /// Set up lazily connecting channels; the image service shares the runtime
    /// socket unless a separate one is given.
    pub fn connect(runtime_socket: &Path, image_socket: Option<&Path>) -> Result<Self, RelayError> {
        let runtime = unix_channel(runtime_socket)?;
        let image = match image_socket {
            Some(socket) if socket != runtime_socket => unix_channel(socket)?,
            _ => runtime.clone(),
        };

        debug!(
            runtime = %runtime_socket.display(),
            image = %image_socket.unwrap_or(runtime_socket).display(),
            "Created runtime clients"
        );

        Ok(Self {
            runtime: Grpc::new(runtime),
            image: Grpc::new(image),
        })
    }

    fn client_for(&self, method: &str) -> Grpc<Channel> {
        if method.starts_with(IMAGE_SERVICE_PREFIX) {
            self.image.clone()
        } else {
            self.runtime.clone()
        }
    }
}

fn method_path(method: &str) -> Result<PathAndQuery, Status> {
    PathAndQuery::try_from(method)
        .map_err(|e| Status::invalid_argument(format!("invalid method {}: {}", method, e)))
}

async fn ready(client: &mut Grpc<Channel>) -> Result<(), Status> {
    client
        .ready()
        .await
        .map_err(|e| Status::unavailable(format!("runtime service was not ready: {}", e)))
}

#[async_trait]
impl RuntimeBackend for GrpcRuntimeBackend {
    async fn unary(&self, method: &str, request: Request<Bytes>) -> Result<Response<Bytes>, Status> {
        let path = method_path(method)?;
        let mut client = self.client_for(method);
        ready(&mut client).await?;
        client.unary(request, path, RawCodec).await
    }
}

#[async_trait]
impl EventSource<Bytes> for GrpcRuntimeBackend {
    async fn open(&self) -> Result<BoxStream<'static, Result<Bytes, Status>>, Status> {
        let path = method_path(CONTAINER_EVENTS_METHOD)?;
        let mut client = self.runtime.clone();
        ready(&mut client).await?;

        // GetContainerEventsRequest has no fields
        let events = client
            .server_streaming(Request::new(Bytes::new()), path, RawCodec)
            .await?
            .into_inner();
        Ok(events.boxed())
    }
}

/// Whether some process accepts connections on the given unix socket.
pub async fn is_listening_socket(socket: impl AsRef<Path>) -> bool {
    UnixStream::connect(socket.as_ref()).await.is_ok()
}

/// Resolve a socket path, treating an empty one as absent.
pub fn socket_path(socket: &str) -> Option<PathBuf> {
    if socket.is_empty() {
        None
    } else {
        Some(PathBuf::from(socket))
    }
}
