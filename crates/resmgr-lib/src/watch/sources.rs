//! Kubernetes API server backed object sources

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{Api, WatchParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;

use super::{EventStream, ObjectSource, WatchEvent};
use crate::error::WatchError;

/// Watches objects of kind `K` through the API server, selecting by name.
#[derive(Clone)]
pub struct KubeObjectSource<K> {
    api: Api<K>,
    kind: String,
    namespace: String,
}

impl<K> KubeObjectSource<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Source for a cluster scoped kind, such as nodes.
    pub fn cluster(client: Client) -> Self {
        Self {
            api: Api::all(client),
            kind: K::kind(&()).to_string(),
            namespace: String::new(),
        }
    }

    /// Source for a namespaced kind, such as config maps.
    pub fn namespaced(client: Client, namespace: &str) -> Self
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    {
        Self {
            api: Api::namespaced(client, namespace),
            kind: K::kind(&()).to_string(),
            namespace: namespace.to_string(),
        }
    }

    fn target(&self, name: &str) -> String {
        if self.namespace.is_empty() {
            format!("{}:{}", self.kind, name)
        } else {
            format!("{}:{}/{}", self.kind, self.namespace, name)
        }
    }
}

#[async_trait]
impl<K> ObjectSource<K> for KubeObjectSource<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn kind(&self) -> &str {
        &self.kind
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn query(&self, name: &str) -> Result<Option<K>, WatchError> {
        self.api.get_opt(name).await.map_err(|e| WatchError::Query {
            target: self.target(name),
            message: e.to_string(),
        })
    }

    async fn open(&self, name: &str) -> Result<EventStream<K>, WatchError> {
        let params = WatchParams::default().fields(&format!("metadata.name={}", name));
        let target = self.target(name);

        let stream = self
            .api
            .watch(&params, "0")
            .await
            .map_err(|e| WatchError::Open {
                target: target.clone(),
                message: e.to_string(),
            })?;

        let events = stream.filter_map(move |event| {
            let target = target.clone();
            async move {
                match event {
                    Ok(kube::api::WatchEvent::Added(o)) => Some(Ok(WatchEvent::Added(o))),
                    Ok(kube::api::WatchEvent::Modified(o)) => Some(Ok(WatchEvent::Modified(o))),
                    Ok(kube::api::WatchEvent::Deleted(o)) => Some(Ok(WatchEvent::Deleted(o))),
                    Ok(kube::api::WatchEvent::Bookmark(_)) => None,
                    Ok(kube::api::WatchEvent::Error(e)) => Some(Err(WatchError::Open {
                        target,
                        message: e.message,
                    })),
                    Err(e) => Some(Err(WatchError::Open {
                        target,
                        message: e.to_string(),
                    })),
                }
            }
        });

        Ok(events.boxed())
    }
}
