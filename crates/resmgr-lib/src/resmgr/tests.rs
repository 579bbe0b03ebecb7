//! Configuration and adjustment protocol tests

use super::*;
use crate::agent::ClusterAgent;
use crate::error::{AgentError, PolicyError};
use crate::models::AdjustmentSpec;
use k8s_openapi::api::core::v1::{Node, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

struct MockAgent {
    config: Option<RawConfig>,
    config_calls: AtomicUsize,
}

impl MockAgent {
    fn serving(config: Option<RawConfig>) -> Arc<Self> {
        Arc::new(Self {
            config,
            config_calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.config_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterAgent for MockAgent {
    async fn get_node(&self) -> Result<Node, AgentError> {
        Ok(Node::default())
    }

    async fn patch_node(&self, _patches: &[crate::patch::PatchOp]) -> Result<(), AgentError> {
        Ok(())
    }

    async fn update_node_capacity(
        &self,
        _capacities: &BTreeMap<String, String>,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    async fn get_config(&self) -> Result<RawConfig, AgentError> {
        self.config_calls.fetch_add(1, Ordering::SeqCst);
        self.config
            .clone()
            .ok_or_else(|| AgentError::transport("get configuration", "agent is down"))
    }

    async fn health_check(&self) -> Result<(), AgentError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Counters {
    updates: AtomicUsize,
    adjustments: AtomicUsize,
}

/// Policy rejecting any configuration carrying a `reject` key.
struct TestPolicy {
    counters: Arc<Counters>,
}

#[async_trait]
impl Policy for TestPolicy {
    fn name(&self) -> &'static str {
        "test"
    }

    fn description(&self) -> &'static str {
        "test policy"
    }

    async fn update_config(&mut self, config: &RawConfig) -> Result<(), PolicyError> {
        self.counters.updates.fetch_add(1, Ordering::SeqCst);
        if config.data.contains_key("reject") {
            return Err(PolicyError::Rejected {
                policy: "test",
                message: "rejected on request".to_string(),
            });
        }
        Ok(())
    }

    async fn apply_adjustment(&mut self, adjustment: &Adjustment) -> BTreeMap<String, PolicyError> {
        self.counters.adjustments.fetch_add(1, Ordering::SeqCst);
        adjustment
            .specs
            .keys()
            .filter(|name| name.starts_with("unplaceable"))
            .map(|name| {
                (
                    name.clone(),
                    PolicyError::Rejected {
                        policy: "test",
                        message: "no room".to_string(),
                    },
                )
            })
            .collect()
    }

    async fn reset(&mut self) {}
}

fn config(pairs: &[(&str, &str)]) -> RawConfig {
    RawConfig::new(
        "node-1",
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

fn options(dir: &TempDir) -> ResmgrOptions {
    let mut options = ResmgrOptions::for_node(
        "node-1",
        dir.path().join("relay.sock"),
        dir.path().join("runtime.sock"),
    );
    options.cache_dir = dir.path().join("cache");
    options.policy = "test".to_string();
    options
}

fn seed_cache(dir: &TempDir, policy: &str, config: Option<&RawConfig>) {
    let mut cache = Cache::open(dir.path().join("cache")).unwrap();
    cache.set_active_policy(policy).unwrap();
    if let Some(config) = config {
        cache.set_config(config).unwrap();
    }
}

fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

async fn manager(
    options: ResmgrOptions,
    agent: AgentInterface,
) -> Result<(ResourceManager, Arc<Counters>), ResmgrError> {
    let counters = Arc::new(Counters::default());
    let policy = Box::new(TestPolicy {
        counters: counters.clone(),
    });
    let rm = ResourceManager::with_policy(options, agent, HealthRegistry::new(), policy).await?;
    Ok((rm, counters))
}

fn agent_with(mock: &Arc<MockAgent>) -> AgentInterface {
    AgentInterface::new(mock.clone() as Arc<dyn ClusterAgent>)
}

#[tokio::test]
async fn test_forced_and_fallback_are_exclusive() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = options(&dir);
    options.force_config = Some(write_file(&dir, "forced.yaml", "a: 1"));
    options.fallback_config = Some(write_file(&dir, "fallback.yaml", "a: 2"));

    let err = manager(options, AgentInterface::disabled()).await.unwrap_err();
    assert!(matches!(err, ResmgrError::ConflictingConfigSources { .. }));
}

#[tokio::test]
async fn test_invalid_reload_signal_fails_startup() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = options(&dir);
    options.force_config = Some(write_file(&dir, "forced.yaml", "a: 1"));
    options.force_config_signal = "SIGNOPE".to_string();

    let err = manager(options, AgentInterface::disabled()).await.unwrap_err();
    assert!(matches!(err, ResmgrError::InvalidSignal(_)));
}

#[tokio::test]
async fn test_forced_config_wins_without_consulting_others() {
    let dir = tempfile::tempdir().unwrap();
    seed_cache(&dir, "test", Some(&config(&[("source", "cache")])));
    let mut options = options(&dir);
    options.force_config = Some(write_file(&dir, "forced.yaml", "source: forced"));
    let agent = MockAgent::serving(Some(config(&[("source", "agent")])));

    let (rm, _) = manager(options, agent_with(&agent)).await.unwrap();

    assert_eq!(rm.config_source().await, ConfigSource::Forced);
    assert_eq!(rm.active_config().await.unwrap().data["source"], "forced");
    assert_eq!(agent.calls(), 0);
}

#[tokio::test]
async fn test_broken_forced_config_fails_startup() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = options(&dir);
    options.force_config = Some(dir.path().join("missing.yaml"));

    let err = manager(options, AgentInterface::disabled()).await.unwrap_err();
    assert!(matches!(err, ResmgrError::ForcedConfig { .. }));
}

#[tokio::test]
async fn test_agent_config_beats_cache_and_is_cached_on_start() {
    let dir = tempfile::tempdir().unwrap();
    seed_cache(&dir, "test", Some(&config(&[("source", "cache")])));
    let mut options = options(&dir);
    options.config_listen = "127.0.0.1:0".to_string();
    let agent = MockAgent::serving(Some(config(&[("source", "agent")])));

    let (rm, _) = manager(options, agent_with(&agent)).await.unwrap();
    assert_eq!(rm.config_source().await, ConfigSource::Agent);
    assert_eq!(rm.active_config().await.unwrap().data["source"], "agent");

    // not cached before a successful start
    let cached = Cache::open(dir.path().join("cache")).unwrap();
    assert_eq!(cached.config().unwrap().data["source"], "cache");

    rm.start().await.unwrap();
    assert!(rm.config_server_addr().await.is_some());
    let cached = Cache::open(dir.path().join("cache")).unwrap();
    assert_eq!(cached.config().unwrap().data["source"], "agent");

    rm.stop().await;
    rm.stop().await;
}

#[tokio::test]
async fn test_cache_used_when_agent_fails() {
    let dir = tempfile::tempdir().unwrap();
    seed_cache(&dir, "test", Some(&config(&[("source", "cache")])));
    let agent = MockAgent::serving(None);

    let (rm, _) = manager(options(&dir), agent_with(&agent)).await.unwrap();

    assert_eq!(agent.calls(), 1);
    assert_eq!(rm.config_source().await, ConfigSource::Cache);
}

#[tokio::test]
async fn test_rejected_agent_config_falls_through() {
    let dir = tempfile::tempdir().unwrap();
    seed_cache(&dir, "test", Some(&config(&[("source", "cache")])));
    let agent = MockAgent::serving(Some(config(&[("reject", "yes")])));

    let (rm, _) = manager(options(&dir), agent_with(&agent)).await.unwrap();

    assert_eq!(rm.config_source().await, ConfigSource::Cache);
    assert_eq!(rm.active_config().await.unwrap().data["source"], "cache");
}

#[tokio::test]
async fn test_fallback_and_builtin() {
    let dir = tempfile::tempdir().unwrap();
    let mut with_fallback = options(&dir);
    with_fallback.fallback_config = Some(write_file(&dir, "fallback.yaml", "source: fallback"));

    let (rm, _) = manager(with_fallback, AgentInterface::disabled())
        .await
        .unwrap();
    assert_eq!(rm.config_source().await, ConfigSource::Fallback);

    let dir = tempfile::tempdir().unwrap();
    let (rm, _) = manager(options(&dir), AgentInterface::disabled())
        .await
        .unwrap();
    assert_eq!(rm.config_source().await, ConfigSource::Builtin);
    assert!(rm.active_config().await.is_none());
}

#[tokio::test]
async fn test_unusable_fallback_starts_with_builtin() {
    let dir = tempfile::tempdir().unwrap();
    let mut rejected = options(&dir);
    rejected.fallback_config = Some(write_file(&dir, "fallback.yaml", "reject: yes"));

    let (rm, _) = manager(rejected, AgentInterface::disabled()).await.unwrap();
    assert_eq!(rm.config_source().await, ConfigSource::Builtin);
    assert!(rm.active_config().await.is_none());

    let dir = tempfile::tempdir().unwrap();
    let mut missing = options(&dir);
    missing.fallback_config = Some(dir.path().join("absent.yaml"));

    let (rm, _) = manager(missing, AgentInterface::disabled()).await.unwrap();
    assert_eq!(rm.config_source().await, ConfigSource::Builtin);
}

#[tokio::test]
async fn test_policy_switch_guard() {
    let dir = tempfile::tempdir().unwrap();
    seed_cache(&dir, "static", None);
    let mut guarded = options(&dir);
    guarded.disable_policy_switch = true;

    let err = manager(guarded, AgentInterface::disabled()).await.unwrap_err();
    assert!(matches!(
        err,
        ResmgrError::PolicySwitchDisabled { ref cached, ref active }
            if cached == "static" && active == "test"
    ));

    {
        let mut cache = Cache::open(dir.path().join("cache")).unwrap();
        cache
            .set_policy_data("static", serde_json::json!({"stale": true}))
            .unwrap();
    }
    let (rm, _) = manager(options(&dir), AgentInterface::disabled())
        .await
        .unwrap();
    assert!(rm.policy_switched().await);

    let cache = Cache::open(dir.path().join("cache")).unwrap();
    assert_eq!(cache.active_policy(), "test");
    assert!(cache.policy_data("static").is_none());
}

#[tokio::test]
async fn test_same_policy_is_no_switch() {
    let dir = tempfile::tempdir().unwrap();
    seed_cache(&dir, "test", None);
    let (rm, _) = manager(options(&dir), AgentInterface::disabled())
        .await
        .unwrap();
    assert!(!rm.policy_switched().await);
}

#[tokio::test]
async fn test_set_config_skip_revert_and_store() {
    let dir = tempfile::tempdir().unwrap();
    let agent = MockAgent::serving(Some(config(&[("v", "1")])));
    let (rm, counters) = manager(options(&dir), agent_with(&agent)).await.unwrap();
    let updates = || counters.updates.load(Ordering::SeqCst);
    assert_eq!(updates(), 1);

    // identical payload is not re-applied
    rm.set_config(config(&[("v", "1")])).await.unwrap();
    assert_eq!(updates(), 1);

    // failed update reverts to the previous configuration
    let err = rm.set_config(config(&[("reject", "yes")])).await.unwrap_err();
    assert!(matches!(err, ResmgrError::Activate { kind: "updated", .. }));
    assert_eq!(updates(), 3);
    assert_eq!(rm.active_config().await.unwrap().data["v"], "1");

    rm.set_config(config(&[("v", "2")])).await.unwrap();
    assert_eq!(rm.active_config().await.unwrap().data["v"], "2");
    let cache = Cache::open(dir.path().join("cache")).unwrap();
    assert_eq!(cache.config().unwrap().data["v"], "2");
}

#[tokio::test]
async fn test_invalid_adjustment_blocks_whole_batch() {
    let dir = tempfile::tempdir().unwrap();
    let (rm, counters) = manager(options(&dir), AgentInterface::disabled())
        .await
        .unwrap();

    let invalid = AdjustmentSpec {
        resources: Some(ResourceRequirements {
            requests: Some(BTreeMap::from([(
                "cpu".to_string(),
                Quantity("2".to_string()),
            )])),
            limits: Some(BTreeMap::from([(
                "cpu".to_string(),
                Quantity("1".to_string()),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    };
    let mut batch: Adjustment = (0..3)
        .map(|i| (format!("valid-{}", i), AdjustmentSpec::default()))
        .collect();
    batch.specs.insert("invalid".to_string(), invalid);

    let errors = rm.set_adjustment(batch).await;

    assert_eq!(errors.len(), 1);
    assert!(errors["invalid"].contains("limit"));
    assert_eq!(counters.adjustments.load(Ordering::SeqCst), 0);
    let cache = Cache::open(dir.path().join("cache")).unwrap();
    assert!(cache.adjustments().is_empty());
}

#[tokio::test]
async fn test_policy_errors_are_reported_by_name() {
    let dir = tempfile::tempdir().unwrap();
    let (rm, counters) = manager(options(&dir), AgentInterface::disabled())
        .await
        .unwrap();

    let batch: Adjustment = [
        ("fits".to_string(), AdjustmentSpec::default()),
        ("unplaceable".to_string(), AdjustmentSpec::default()),
    ]
    .into_iter()
    .collect();
    let errors = rm.set_adjustment(batch).await;
    assert_eq!(errors.keys().collect::<Vec<_>>(), vec!["unplaceable"]);
    assert_eq!(counters.adjustments.load(Ordering::SeqCst), 1);

    let batch: Adjustment = [("fits".to_string(), AdjustmentSpec::default())]
        .into_iter()
        .collect();
    assert!(rm.set_adjustment(batch).await.is_empty());
    let cache = Cache::open(dir.path().join("cache")).unwrap();
    assert_eq!(cache.adjustments().specs.len(), 1);
}

#[tokio::test]
async fn test_forced_reload_is_not_cached() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = options(&dir);
    let forced = write_file(&dir, "forced.yaml", "v: 1");
    options.force_config = Some(forced.clone());
    options.force_config_signal = "disabled".to_string();

    let (rm, _) = manager(options, AgentInterface::disabled()).await.unwrap();
    std::fs::write(&forced, "v: 2").unwrap();
    rm.reload_forced_config().await.unwrap();

    assert_eq!(rm.active_config().await.unwrap().data["v"], "2");
    let cache = Cache::open(dir.path().join("cache")).unwrap();
    assert!(cache.config().is_none());
}

#[tokio::test]
async fn test_reset_refuses_while_running() {
    let dir = tempfile::tempdir().unwrap();
    seed_cache(&dir, "test", Some(&config(&[("v", "1")])));
    let options = options(&dir);

    let (rm, _) = manager(options.clone(), AgentInterface::disabled())
        .await
        .unwrap();
    rm.start().await.unwrap();
    assert_eq!(reset_cached_config(&options).await, 1);
    assert_eq!(reset_cached_policy(&options).await, 1);
    rm.stop().await;

    assert_eq!(reset_cached_config(&options).await, 0);
    assert_eq!(reset_cached_policy(&options).await, 0);
    let cache = Cache::open(dir.path().join("cache")).unwrap();
    assert!(cache.config().is_none());
    assert_eq!(cache.active_policy(), "");
}

#[tokio::test]
async fn test_failed_start_releases_relay_socket() {
    let dir = tempfile::tempdir().unwrap();
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut options = options(&dir);
    options.config_listen = taken.local_addr().unwrap().to_string();

    let (rm, _) = manager(options.clone(), AgentInterface::disabled())
        .await
        .unwrap();
    assert!(rm.start().await.is_err());
    assert!(!is_listening_socket(&options.relay.relay_socket).await);
    assert!(rm.config_server_addr().await.is_none());

    rm.stop().await;
    assert_eq!(reset_cached_config(&options).await, 0);

    drop(taken);
    rm.start().await.unwrap();
    assert!(is_listening_socket(&options.relay.relay_socket).await);
    rm.stop().await;
    assert!(!is_listening_socket(&options.relay.relay_socket).await);
}

#[tokio::test]
async fn test_status_follows_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let (rm, _) = manager(options(&dir), AgentInterface::disabled())
        .await
        .unwrap();

    let status = rm.status().await;
    assert_eq!(status.policy, "test");
    assert_eq!(status.config_source, ConfigSource::Builtin);
    assert!(!status.running);
    assert_eq!(status.event_subscribers, 0);

    rm.start().await.unwrap();
    let status = rm.status().await;
    assert!(status.running);
    // nothing subscribed yet, so the upstream stays closed
    assert!(!status.events_connected);
    assert_eq!(
        serde_json::to_value(&status).unwrap()["configSource"],
        "builtin"
    );

    rm.stop().await;
    assert!(!rm.is_running().await);
}
