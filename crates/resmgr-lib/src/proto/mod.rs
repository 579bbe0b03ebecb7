//! Cluster-agent protocol messages
//!
//! Hand-declared prost messages and a tonic client for the `v1.Agent`
//! service the node-local cluster agent exposes on its unix socket. Nodes
//! are carried as JSON documents so the client does not depend on a
//! particular protobuf rendition of the Kubernetes API.

pub mod agent {
    pub mod v1 {
        use prost::Message;
        use std::collections::HashMap;

        #[derive(Clone, PartialEq, Message)]
        pub struct GetNodeRequest {}

        #[derive(Clone, PartialEq, Message)]
        pub struct GetNodeReply {
            /// JSON encoded node object
            #[prost(string, tag = "1")]
            pub node: String,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct JsonPatch {
            #[prost(string, tag = "1")]
            pub op: String,
            #[prost(string, tag = "2")]
            pub path: String,
            /// Pre-marshaled JSON value, empty for removals
            #[prost(string, tag = "3")]
            pub value: String,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct PatchNodeRequest {
            #[prost(message, repeated, tag = "1")]
            pub patches: Vec<JsonPatch>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct PatchNodeReply {}

        #[derive(Clone, PartialEq, Message)]
        pub struct UpdateNodeCapacityRequest {
            #[prost(map = "string, string", tag = "1")]
            pub capacities: HashMap<String, String>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct UpdateNodeCapacityReply {}

        #[derive(Clone, PartialEq, Message)]
        pub struct GetConfigRequest {}

        #[derive(Clone, PartialEq, Message)]
        pub struct GetConfigReply {
            #[prost(string, tag = "1")]
            pub node_name: String,
            #[prost(map = "string, string", tag = "2")]
            pub config: HashMap<String, String>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct HealthCheckRequest {
            #[prost(string, tag = "1")]
            pub query: String,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct HealthCheckReply {
            /// Empty when the agent is healthy
            #[prost(string, tag = "1")]
            pub error: String,
        }

        pub mod agent_client {
            use super::*;
            use tonic::codegen::*;

            #[derive(Debug, Clone)]
            pub struct AgentClient<T> {
                inner: tonic::client::Grpc<T>,
            }

            impl AgentClient<tonic::transport::Channel> {
                pub fn new(channel: tonic::transport::Channel) -> Self {
                    let inner = tonic::client::Grpc::new(channel);
                    Self { inner }
                }
            }

            impl<T> AgentClient<T>
            where
                T: tonic::client::GrpcService<tonic::body::BoxBody>,
                T::Error: Into<StdError>,
                T::ResponseBody: Body<Data = Bytes> + Send + 'static,
                <T::ResponseBody as Body>::Error: Into<StdError> + Send,
            {
                async fn ready(&mut self) -> Result<(), tonic::Status> {
                    self.inner.ready().await.map_err(|e| {
                        tonic::Status::new(
                            tonic::Code::Unknown,
                            format!("Service was not ready: {}", e.into()),
                        )
                    })
                }

                pub async fn get_node(
                    &mut self,
                    request: impl tonic::IntoRequest<GetNodeRequest>,
                ) -> Result<tonic::Response<GetNodeReply>, tonic::Status> {
                    self.ready().await?;
                    let codec = tonic::codec::ProstCodec::default();
                    let path = http::uri::PathAndQuery::from_static("/v1.Agent/GetNode");
                    self.inner.unary(request.into_request(), path, codec).await
                }

                pub async fn patch_node(
                    &mut self,
                    request: impl tonic::IntoRequest<PatchNodeRequest>,
                ) -> Result<tonic::Response<PatchNodeReply>, tonic::Status> {
                    self.ready().await?;
                    let codec = tonic::codec::ProstCodec::default();
                    let path = http::uri::PathAndQuery::from_static("/v1.Agent/PatchNode");
                    self.inner.unary(request.into_request(), path, codec).await
                }

                pub async fn update_node_capacity(
                    &mut self,
                    request: impl tonic::IntoRequest<UpdateNodeCapacityRequest>,
                ) -> Result<tonic::Response<UpdateNodeCapacityReply>, tonic::Status> {
                    self.ready().await?;
                    let codec = tonic::codec::ProstCodec::default();
                    let path =
                        http::uri::PathAndQuery::from_static("/v1.Agent/UpdateNodeCapacity");
                    self.inner.unary(request.into_request(), path, codec).await
                }

                pub async fn get_config(
                    &mut self,
                    request: impl tonic::IntoRequest<GetConfigRequest>,
                ) -> Result<tonic::Response<GetConfigReply>, tonic::Status> {
                    self.ready().await?;
                    let codec = tonic::codec::ProstCodec::default();
                    let path = http::uri::PathAndQuery::from_static("/v1.Agent/GetConfig");
                    self.inner.unary(request.into_request(), path, codec).await
                }

                pub async fn health_check(
                    &mut self,
                    request: impl tonic::IntoRequest<HealthCheckRequest>,
                ) -> Result<tonic::Response<HealthCheckReply>, tonic::Status> {
                    self.ready().await?;
                    let codec = tonic::codec::ProstCodec::default();
                    let path = http::uri::PathAndQuery::from_static("/v1.Agent/HealthCheck");
                    self.inner.unary(request.into_request(), path, codec).await
                }
            }
        }
    }
}

pub use agent::v1::agent_client::AgentClient;
pub use agent::v1::*;
