//! Effective configuration tracking for a node
//!
//! Follows three objects through `WatchSession`s: the node itself (for its
//! configuration group label), the node specific config map and the group
//! (or default) config map. The effective configuration is published with
//! precedence node > group > default > empty.

use k8s_openapi::api::core::v1::{ConfigMap, Node};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::AgentError;
use crate::models::RawConfig;
use crate::watch::{ObjectSource, WatchEvent, WatchSession};

/// Namespace holding configuration maps.
pub const DEFAULT_CONFIG_NAMESPACE: &str = "kube-system";

/// Base name of configuration maps.
pub const DEFAULT_CONFIG_MAP_NAME: &str = "resmgr-config";

/// Node label selecting the configuration group.
pub const DEFAULT_GROUP_LABEL: &str = "resmgr.io/group";

#[derive(Debug, Clone)]
pub struct ConfigWatcherOptions {
    pub node_name: String,
    pub namespace: String,
    pub config_map_name: String,
    pub group_label: String,
}

impl ConfigWatcherOptions {
    pub fn for_node(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            namespace: DEFAULT_CONFIG_NAMESPACE.to_string(),
            config_map_name: DEFAULT_CONFIG_MAP_NAME.to_string(),
            group_label: DEFAULT_GROUP_LABEL.to_string(),
        }
    }

    pub fn node_map_name(&self) -> String {
        format!("{}.node.{}", self.config_map_name, self.node_name)
    }

    /// The group config map, or the default one without a group.
    pub fn group_map_name(&self, group: &str) -> String {
        if group.is_empty() {
            format!("{}.default", self.config_map_name)
        } else {
            format!("{}.group.{}", self.config_map_name, group)
        }
    }
}

/// Configuration data seen so far.
#[derive(Debug, Default, Clone)]
struct CachedConfig {
    node: Option<BTreeMap<String, String>>,
    group_data: Option<BTreeMap<String, String>>,
    group: String,
}

impl CachedConfig {
    /// Effective configuration and a description of where it came from.
    fn effective(&self) -> (BTreeMap<String, String>, String) {
        let (data, kind) = if self.node.is_some() {
            (self.node.as_ref(), "node".to_string())
        } else if !self.group.is_empty() {
            (self.group_data.as_ref(), format!("group {}", self.group))
        } else if self.group_data.is_some() {
            (self.group_data.as_ref(), "default".to_string())
        } else {
            (None, "fallback".to_string())
        };

        match data {
            Some(data) => (data.clone(), kind),
            None => (BTreeMap::new(), format!("empty {}", kind)),
        }
    }

    /// Record group data. Returns true if it is now the effective one.
    fn set_group(&mut self, group: &str, data: Option<BTreeMap<String, String>>) -> bool {
        self.group_data = data;
        self.group = group.to_string();
        self.node.is_none()
    }
}

fn group_of(node: &Node, label: &str) -> String {
    node.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(label))
        .cloned()
        .unwrap_or_default()
}

fn config_data(event: WatchEvent<ConfigMap>) -> Option<BTreeMap<String, String>> {
    match event {
        WatchEvent::Added(cm) | WatchEvent::Modified(cm) => Some(cm.data.unwrap_or_default()),
        WatchEvent::Deleted(_) | WatchEvent::SyntheticMissing => None,
    }
}

/// Publishes the effective configuration of a node.
#[derive(Debug)]
pub struct ConfigWatcher {
    updates: watch::Receiver<RawConfig>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ConfigWatcher {
    /// Start watching. Fails without a node name.
    pub fn start(
        options: ConfigWatcherOptions,
        nodes: Arc<dyn ObjectSource<Node>>,
        config_maps: Arc<dyn ObjectSource<ConfigMap>>,
    ) -> Result<Self, AgentError> {
        if options.node_name.is_empty() {
            return Err(AgentError::MissingNodeName);
        }

        let initial = RawConfig::new(options.node_name.clone(), BTreeMap::new());
        let (tx, rx) = watch::channel(initial);
        let (stop_tx, stop_rx) = oneshot::channel();

        let task = tokio::spawn(run_watcher(options, nodes, config_maps, tx, stop_rx));

        Ok(Self {
            updates: rx,
            stop: Some(stop_tx),
            task: Some(task),
        })
    }

    /// The effective configuration right now.
    pub fn current(&self) -> RawConfig {
        self.updates.borrow().clone()
    }

    /// Receiver notified on every published configuration.
    pub fn subscribe(&self) -> watch::Receiver<RawConfig> {
        self.updates.clone()
    }

    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn run_watcher(
    options: ConfigWatcherOptions,
    nodes: Arc<dyn ObjectSource<Node>>,
    config_maps: Arc<dyn ObjectSource<ConfigMap>>,
    tx: watch::Sender<RawConfig>,
    mut stop: oneshot::Receiver<()>,
) {
    let node_name = options.node_name.clone();
    let mut cached = CachedConfig::default();

    let publish = |cached: &CachedConfig| {
        let (data, kind) = cached.effective();
        info!(node = %node_name, source = %kind, "Publishing configuration");
        tx.send_replace(RawConfig::new(node_name.clone(), data));
    };

    let mut node_watch = WatchSession::new(nodes);
    node_watch.start(node_name.clone());

    let mut group = match node_watch.query().await {
        Ok(Some(node)) => group_of(&node, &options.group_label),
        Ok(None) => {
            warn!(node = %node_name, "Node not found, make sure the node name is correct");
            String::new()
        }
        Err(e) => {
            warn!(node = %node_name, error = %e, "Failed to query node");
            String::new()
        }
    };
    info!(group = %group, "Configuration group set");

    let mut node_config = WatchSession::new(config_maps.clone());
    node_config.start(options.node_map_name());
    let mut group_config = WatchSession::new(config_maps);
    group_config.start(options.group_map_name(&group));

    publish(&cached);

    loop {
        tokio::select! {
            _ = &mut stop => {
                info!("Stopping configuration watcher");
                break;
            }

            event = node_watch.recv() => match event {
                WatchEvent::Added(node) | WatchEvent::Modified(node) => {
                    let label = group_of(&node, &options.group_label);
                    if label != group {
                        group = label;
                        info!(group = %group, "Configuration group changed");
                        group_config.start(options.group_map_name(&group));
                    }
                }
                WatchEvent::Deleted(_) => warn!(node = %node_name, "Node object was removed"),
                WatchEvent::SyntheticMissing => {}
            },

            event = node_config.recv() => {
                cached.node = config_data(event);
                publish(&cached);
            }

            event = group_config.recv() => {
                if cached.set_group(&group, config_data(event)) {
                    publish(&cached);
                }
            }
        }
    }

    node_watch.stop();
    node_config.stop();
    group_config.stop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WatchError;
    use crate::watch::EventStream;
    use async_trait::async_trait;
    use futures::StreamExt;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
    use tokio_stream::wrappers::UnboundedReceiverStream;

    /// Source with one feed per object name, created on first open.
    struct FeedSource<K> {
        present: Mutex<HashMap<String, K>>,
        feeds: Mutex<HashMap<String, UnboundedSender<WatchEvent<K>>>>,
    }

    impl<K> FeedSource<K> {
        fn new() -> Self {
            Self {
                present: Mutex::new(HashMap::new()),
                feeds: Mutex::new(HashMap::new()),
            }
        }

        fn send(&self, name: &str, event: WatchEvent<K>) -> bool {
            match self.feeds.lock().unwrap().get(name) {
                Some(feed) => feed.send(event).is_ok(),
                None => false,
            }
        }
    }

    #[async_trait]
    impl<K: Clone + Send + Sync + 'static> ObjectSource<K> for FeedSource<K> {
        fn kind(&self) -> &str {
            "Feed"
        }

        async fn query(&self, name: &str) -> Result<Option<K>, WatchError> {
            Ok(self.present.lock().unwrap().get(name).cloned())
        }

        async fn open(&self, name: &str) -> Result<EventStream<K>, WatchError> {
            let (tx, rx) = unbounded_channel();
            self.feeds.lock().unwrap().insert(name.to_string(), tx);
            Ok(UnboundedReceiverStream::new(rx).map(Ok).boxed())
        }
    }

    fn node(labels: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("node-1".into()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn config_map(pairs: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            data: Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    async fn wait_for(
        rx: &mut watch::Receiver<RawConfig>,
        check: impl Fn(&RawConfig) -> bool,
    ) -> RawConfig {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if check(&rx.borrow_and_update()) {
                    return rx.borrow().clone();
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("configuration not published in time")
    }

    async fn wait_for_feed<K>(source: &FeedSource<K>, name: &str) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !source.feeds.lock().unwrap().contains_key(name) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("watch not opened in time");
    }

    #[test]
    fn test_map_names() {
        let options = ConfigWatcherOptions::for_node("n1");
        assert_eq!(options.node_map_name(), "resmgr-config.node.n1");
        assert_eq!(options.group_map_name(""), "resmgr-config.default");
        assert_eq!(options.group_map_name("gpu"), "resmgr-config.group.gpu");
    }

    #[test]
    fn test_effective_precedence() {
        let mut cached = CachedConfig::default();
        assert_eq!(cached.effective().1, "empty fallback");

        cached.set_group(
            "",
            Some(BTreeMap::from([("a".to_string(), "default".to_string())])),
        );
        assert_eq!(cached.effective().1, "default");

        cached.set_group("gpu", None);
        assert_eq!(cached.effective().1, "empty group gpu");

        cached.node = Some(BTreeMap::from([("a".to_string(), "node".to_string())]));
        assert!(!cached.set_group("gpu", Some(BTreeMap::new())));
        let (data, kind) = cached.effective();
        assert_eq!(kind, "node");
        assert_eq!(data.get("a").map(String::as_str), Some("node"));
    }

    #[tokio::test]
    async fn test_missing_node_name_fails() {
        let nodes = Arc::new(FeedSource::<Node>::new());
        let maps = Arc::new(FeedSource::<ConfigMap>::new());
        let err = ConfigWatcher::start(ConfigWatcherOptions::for_node(""), nodes, maps)
            .unwrap_err();
        assert!(matches!(err, AgentError::MissingNodeName));
    }

    #[tokio::test]
    async fn test_node_config_overrides_group() {
        let nodes = Arc::new(FeedSource::<Node>::new());
        nodes
            .present
            .lock()
            .unwrap()
            .insert("node-1".into(), node(&[(DEFAULT_GROUP_LABEL, "gpu")]));
        let maps = Arc::new(FeedSource::<ConfigMap>::new());

        let mut watcher = ConfigWatcher::start(
            ConfigWatcherOptions::for_node("node-1"),
            nodes.clone(),
            maps.clone(),
        )
        .unwrap();
        let mut rx = watcher.subscribe();

        wait_for_feed(&maps, "resmgr-config.group.gpu").await;
        maps.send(
            "resmgr-config.group.gpu",
            WatchEvent::Added(config_map(&[("policy", "group")])),
        );
        let cfg = wait_for(&mut rx, |c| c.data.get("policy").map(String::as_str) == Some("group")).await;
        assert_eq!(cfg.node_name, "node-1");

        wait_for_feed(&maps, "resmgr-config.node.node-1").await;
        maps.send(
            "resmgr-config.node.node-1",
            WatchEvent::Added(config_map(&[("policy", "node")])),
        );
        wait_for(&mut rx, |c| c.data.get("policy").map(String::as_str) == Some("node")).await;

        maps.send(
            "resmgr-config.node.node-1",
            WatchEvent::Deleted(config_map(&[])),
        );
        maps.send(
            "resmgr-config.group.gpu",
            WatchEvent::Modified(config_map(&[("policy", "group-2")])),
        );
        wait_for(&mut rx, |c| c.data.get("policy").map(String::as_str) == Some("group-2")).await;

        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_group_label_change_retargets() {
        let nodes = Arc::new(FeedSource::<Node>::new());
        nodes
            .present
            .lock()
            .unwrap()
            .insert("node-1".into(), node(&[]));
        let maps = Arc::new(FeedSource::<ConfigMap>::new());

        let mut watcher = ConfigWatcher::start(
            ConfigWatcherOptions::for_node("node-1"),
            nodes.clone(),
            maps.clone(),
        )
        .unwrap();
        let mut rx = watcher.subscribe();

        wait_for_feed(&maps, "resmgr-config.default").await;
        maps.send(
            "resmgr-config.default",
            WatchEvent::Added(config_map(&[("policy", "default")])),
        );
        wait_for(&mut rx, |c| c.data.get("policy").map(String::as_str) == Some("default")).await;

        wait_for_feed(&nodes, "node-1").await;
        nodes.send(
            "node-1",
            WatchEvent::Modified(node(&[(DEFAULT_GROUP_LABEL, "big")])),
        );
        wait_for_feed(&maps, "resmgr-config.group.big").await;
        maps.send(
            "resmgr-config.group.big",
            WatchEvent::Added(config_map(&[("policy", "big")])),
        );
        let cfg = wait_for(&mut rx, |c| c.data.get("policy").map(String::as_str) == Some("big")).await;
        assert_eq!(watcher.current(), cfg);

        watcher.stop().await;
    }
}
