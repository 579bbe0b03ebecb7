//! The resource manager control plane
//!
//! [`ResourceManager`] owns the active policy, the cache and the active
//! configuration. Startup configuration is taken from the first source that
//! works, in order:
//! 1. the forced configuration file, reloadable through a signal
//! 2. the cluster agent
//! 3. the last agent configuration saved in the cache
//! 4. the fallback configuration file
//!
//! Configuration updates, adjustment updates, start and stop all serialize on
//! one lock.

mod signal;

#[cfg(test)]
mod tests;

pub use signal::parse_reload_signal;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::SignalKind;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentInterface, DEFAULT_TIMEOUT};
use crate::cache::Cache;
use crate::config::{load_config_file, ConfigHandler, ConfigServer};
use crate::error::{ConfigError, RelayError, ResmgrError};
use crate::health::{components, HealthRegistry};
use crate::models::{Adjustment, RawConfig};
use crate::observability::{ResmgrMetrics, StructuredLogger};
use crate::policy::{Policy, PolicyRegistry};
use crate::relay::{is_listening_socket, ProtocolRelay, RelayOptions, RelayServer};

/// Resource manager startup options.
#[derive(Debug, Clone)]
pub struct ResmgrOptions {
    pub node_name: String,
    pub relay: RelayOptions,
    pub config_listen: String,
    pub cache_dir: PathBuf,
    pub force_config: Option<PathBuf>,
    pub force_config_signal: String,
    pub fallback_config: Option<PathBuf>,
    pub disable_policy_switch: bool,
    pub policy: String,
    pub agent_timeout: Duration,
}

impl ResmgrOptions {
    /// Reject contradicting options, resolving the reload signal.
    pub fn check(&self) -> Result<Option<SignalKind>, ResmgrError> {
        if let (Some(forced), Some(fallback)) = (&self.force_config, &self.fallback_config) {
            return Err(ResmgrError::ConflictingConfigSources {
                forced: forced.display().to_string(),
                fallback: fallback.display().to_string(),
            });
        }
        if self.force_config.is_none() {
            return Ok(None);
        }
        parse_reload_signal(&self.force_config_signal)
    }
}

/// Point-in-time view of a resource manager, for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResmgrStatus {
    pub node_name: String,
    pub policy: &'static str,
    pub policy_switched: bool,
    pub config_source: ConfigSource,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_server: Option<String>,
    /// Whether the shared runtime event stream is open.
    pub events_connected: bool,
    pub event_subscribers: usize,
}

/// Where the startup configuration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Forced,
    Agent,
    Cache,
    Fallback,
    Builtin,
}

impl ConfigSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigSource::Forced => "forced",
            ConfigSource::Agent => "agent",
            ConfigSource::Cache => "cache",
            ConfigSource::Fallback => "fallback",
            ConfigSource::Builtin => "builtin",
        }
    }
}

struct Background<T> {
    stop: oneshot::Sender<()>,
    task: JoinHandle<T>,
}

struct State {
    policy: Box<dyn Policy>,
    cache: Cache,
    active: Option<RawConfig>,
    pending: Option<RawConfig>,
    source: ConfigSource,
    policy_switch: bool,
    started: bool,
    config_server: Option<ConfigServer>,
    relay: Option<(Arc<ProtocolRelay>, Background<Result<(), RelayError>>)>,
    reload: Option<Background<()>>,
}

struct Core {
    options: ResmgrOptions,
    agent: AgentInterface,
    reload_signal: Option<SignalKind>,
    health: HealthRegistry,
    metrics: ResmgrMetrics,
    logger: StructuredLogger,
    state: Mutex<State>,
}

/// The resource manager.
#[derive(Clone)]
pub struct ResourceManager {
    core: Arc<Core>,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("node_name", &self.core.options.node_name)
            .field("policy", &self.core.options.policy)
            .finish()
    }
}

impl ResourceManager {
    /// Set up the resource manager with the builtin policy named in `options`.
    pub async fn new(
        options: ResmgrOptions,
        agent: AgentInterface,
        health: HealthRegistry,
    ) -> Result<Self, ResmgrError> {
        let policy = PolicyRegistry::new(&options.policy)?.create();
        Self::with_policy(options, agent, health, policy).await
    }

    /// Set up the resource manager around the given policy.
    pub async fn with_policy(
        options: ResmgrOptions,
        agent: AgentInterface,
        health: HealthRegistry,
        policy: Box<dyn Policy>,
    ) -> Result<Self, ResmgrError> {
        let reload_signal = options.check()?;
        let logger = StructuredLogger::new(&options.node_name);

        let mut cache = Cache::open(&options.cache_dir)?;
        let policy_switch = check_policy_switch(
            &mut cache,
            policy.name(),
            options.disable_policy_switch,
            &logger,
        )?;

        let core = Core {
            options,
            agent,
            reload_signal,
            health,
            metrics: ResmgrMetrics::new(),
            logger,
            state: Mutex::new(State {
                policy,
                cache,
                active: None,
                pending: None,
                source: ConfigSource::Builtin,
                policy_switch,
                started: false,
                config_server: None,
                relay: None,
                reload: None,
            }),
        };

        {
            let mut state = core.state.lock().await;
            state.source = core.load_initial_config(&mut state).await?;
            core.restore_adjustments(&mut state).await;
        }

        core.health.register(components::CACHE).await;
        core.health.register(components::POLICY).await;
        if core.agent.is_disabled() {
            core.health
                .set_degraded(components::AGENT, "agent interface is disabled")
                .await;
        } else {
            core.health.register(components::AGENT).await;
        }

        Ok(Self {
            core: Arc::new(core),
        })
    }

    pub fn node_name(&self) -> &str {
        &self.core.options.node_name
    }

    /// Name of the running policy.
    pub async fn active_policy(&self) -> &'static str {
        self.core.state.lock().await.policy.name()
    }

    /// Whether startup switched away from the policy found in the cache.
    pub async fn policy_switched(&self) -> bool {
        self.core.state.lock().await.policy_switch
    }

    pub async fn config_source(&self) -> ConfigSource {
        self.core.state.lock().await.source
    }

    pub async fn active_config(&self) -> Option<RawConfig> {
        self.core.state.lock().await.active.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.core.state.lock().await.started
    }

    pub async fn status(&self) -> ResmgrStatus {
        let state = self.core.state.lock().await;
        let (events_connected, event_subscribers) = match &state.relay {
            Some((relay, _)) => (
                relay.events().is_connected().await,
                relay.events().subscriber_count().await,
            ),
            None => (false, 0),
        };

        ResmgrStatus {
            node_name: self.core.options.node_name.clone(),
            policy: state.policy.name(),
            policy_switched: state.policy_switch,
            config_source: state.source,
            running: state.started,
            config_server: state
                .config_server
                .as_ref()
                .and_then(|s| s.local_addr())
                .map(|addr| addr.to_string()),
            events_connected,
            event_subscribers,
        }
    }

    /// Address of the configuration server, if it is running.
    pub async fn config_server_addr(&self) -> Option<std::net::SocketAddr> {
        self.core
            .state
            .lock()
            .await
            .config_server
            .as_ref()
            .and_then(|s| s.local_addr())
    }

    /// Start relaying and accepting configuration.
    ///
    /// A failed start releases whatever it already brought up, leaving the
    /// relay socket free for a retry or an administrative reset.
    pub async fn start(&self) -> Result<(), ResmgrError> {
        let core = &self.core;
        let mut state = core.state.lock().await;
        if state.started {
            return Ok(());
        }
        info!(node = %core.options.node_name, "Starting resource manager");

        if let Err(e) = self.bring_up(&mut state).await {
            error!(error = %e, "Failed to start resource manager");
            core.release(&mut state).await;
            return Err(e);
        }

        state.started = true;
        core.health.set_ready(true).await;
        core.logger
            .log_startup(env!("CARGO_PKG_VERSION"), state.policy.name());
        Ok(())
    }

    async fn bring_up(&self, state: &mut State) -> Result<(), ResmgrError> {
        let core = &self.core;

        let relay = Arc::new(ProtocolRelay::connect(&core.options.relay)?);
        let server = RelayServer::bind(&core.options.relay.relay_socket).await?;
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server.serve(relay.clone(), async {
            let _ = stopped.await;
        }));
        state.relay = Some((relay, Background { stop, task }));
        core.health.register(components::RELAY).await;
        core.health.register(components::EVENT_RELAY).await;

        if core.options.force_config.is_none() {
            let mut server = ConfigServer::new(self.core.clone());
            server.start(&core.options.config_listen).await?;
            state.config_server = Some(server);
            core.health.register(components::CONFIG_SERVER).await;

            // agent configuration is cached only once we managed to start
            if let Some(pending) = state.pending.take() {
                state.cache.set_config(&pending)?;
            }
        } else if let Some(kind) = core.reload_signal {
            state.reload = Some(self.spawn_reload(kind)?);
        }

        let policy_name = state.policy.name();
        let policy_state = state.policy.export_state();
        state.cache.set_policy_data(policy_name, policy_state)?;
        Ok(())
    }

    /// Stop everything started by [`start`](Self::start). Safe to call repeatedly.
    pub async fn stop(&self) {
        let core = &self.core;
        let mut state = core.state.lock().await;
        if !state.started {
            return;
        }

        core.release(&mut state).await;

        let policy_name = state.policy.name();
        let policy_state = state.policy.export_state();
        if let Err(e) = state.cache.set_policy_data(policy_name, policy_state) {
            warn!(error = %e, "Failed to save policy state");
        }

        state.started = false;
        core.health.set_ready(false).await;
        core.logger.log_shutdown("stopped");
    }

    /// Apply a pushed configuration.
    pub async fn set_config(&self, config: RawConfig) -> Result<(), ResmgrError> {
        self.core.set_config(config).await
    }

    /// Apply pushed adjustments, returning errors by adjustment name.
    pub async fn set_adjustment(&self, adjustment: Adjustment) -> BTreeMap<String, String> {
        self.core.set_adjustment(adjustment).await
    }

    /// Re-read and apply the forced configuration file.
    pub async fn reload_forced_config(&self) -> Result<(), ResmgrError> {
        self.core.reload_forced_config().await
    }

    fn spawn_reload(&self, kind: SignalKind) -> Result<Background<()>, ResmgrError> {
        let mut signals = tokio::signal::unix::signal(kind).map_err(ResmgrError::Signal)?;
        let (stop, mut stopped) = oneshot::channel::<()>();
        let core = self.core.clone();

        info!(signal = ?kind, "Forced configuration reload armed");
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    received = signals.recv() => {
                        if received.is_none() {
                            break;
                        }
                    }
                }
                if let Err(e) = core.reload_forced_config().await {
                    error!(error = %e, "Failed to reload forced configuration");
                }
            }
            debug!("Forced configuration reload disarmed");
        });

        Ok(Background { stop, task })
    }
}

/// Compare the policy about to run with the one owning the cached state.
fn check_policy_switch(
    cache: &mut Cache,
    active: &str,
    disable_policy_switch: bool,
    logger: &StructuredLogger,
) -> Result<bool, ResmgrError> {
    let cached = cache.active_policy().to_string();
    if cached == active {
        return Ok(false);
    }

    if !cached.is_empty() {
        if disable_policy_switch {
            error!(cached = %cached, active, "Policy switching is disabled");
            return Err(ResmgrError::PolicySwitchDisabled {
                cached,
                active: active.to_string(),
            });
        }
        logger.log_policy_switch(&cached, active);
        cache.reset_active_policy()?;
    }
    cache.set_active_policy(active)?;
    Ok(true)
}

impl Core {
    /// Tear down the reload loop, config server and relay, if running.
    async fn release(&self, state: &mut State) {
        if let Some(reload) = state.reload.take() {
            let _ = reload.stop.send(());
            let _ = reload.task.await;
        }
        if let Some(mut server) = state.config_server.take() {
            server.stop().await;
            self.health.deregister(components::CONFIG_SERVER).await;
        }
        if let Some((_relay, relay)) = state.relay.take() {
            let _ = relay.stop.send(());
            match relay.task.await {
                Ok(Err(e)) => warn!(error = %e, "Relay stopped with error"),
                Err(e) => warn!(error = %e, "Relay task failed"),
                Ok(Ok(())) => {}
            }
            self.health.deregister(components::RELAY).await;
            self.health.deregister(components::EVENT_RELAY).await;
        }
    }

    async fn load_initial_config(&self, state: &mut State) -> Result<ConfigSource, ResmgrError> {
        let node = &self.options.node_name;

        if let Some(path) = &self.options.force_config {
            info!(path = %path.display(), "Using forced configuration");
            let forced_err = |source: ConfigError| ResmgrError::ForcedConfig {
                path: path.display().to_string(),
                source,
            };
            let config = load_config_file(path, node).map_err(forced_err)?;
            self.activate(state, &config, "forced")
                .await
                .map_err(|e| forced_err(ConfigError::Rejected(e.to_string())))?;
            return Ok(ConfigSource::Forced);
        }

        if !self.agent.is_disabled() {
            info!("Trying configuration from agent");
            match self.agent.get_config(Some(self.options.agent_timeout)).await {
                Ok(config) => match self.activate(state, &config, "agent").await {
                    Ok(()) => {
                        state.pending = Some(config);
                        return Ok(ConfigSource::Agent);
                    }
                    Err(e) => error!(error = %e, "Configuration from agent failed to apply"),
                },
                Err(e) => warn!(error = %e, "Failed to get configuration from agent"),
            }
        }

        if let Some(config) = state.cache.config().cloned() {
            info!("Trying last cached configuration");
            match self.activate(state, &config, "cached").await {
                Ok(()) => return Ok(ConfigSource::Cache),
                Err(e) => error!(error = %e, "Failed to activate cached configuration"),
            }
        }

        if let Some(path) = &self.options.fallback_config {
            info!(path = %path.display(), "Using fallback configuration");
            let fallback_err = |source: ConfigError| ResmgrError::FallbackConfig {
                path: path.display().to_string(),
                source,
            };
            let loaded = match load_config_file(path, node) {
                Ok(config) => self
                    .activate(state, &config, "fallback")
                    .await
                    .map_err(|e| fallback_err(ConfigError::Rejected(e.to_string()))),
                Err(e) => Err(fallback_err(e)),
            };
            match loaded {
                Ok(()) => return Ok(ConfigSource::Fallback),
                Err(e) => warn!(error = %e, "Failed to use fallback configuration"),
            }
        }

        warn!("No initial configuration found");
        Ok(ConfigSource::Builtin)
    }

    /// Re-apply cached adjustments to a freshly configured policy.
    async fn restore_adjustments(&self, state: &mut State) {
        let adjustments = state.cache.adjustments().for_node(&self.options.node_name);
        if adjustments.is_empty() {
            return;
        }

        let errors = state.policy.apply_adjustment(&adjustments).await;
        for (name, e) in &errors {
            warn!(adjustment = %name, error = %e, "Failed to restore cached adjustment");
        }
    }

    async fn activate(
        &self,
        state: &mut State,
        config: &RawConfig,
        kind: &'static str,
    ) -> Result<(), ResmgrError> {
        state
            .policy
            .update_config(config)
            .await
            .map_err(|e| ResmgrError::Activate {
                kind,
                message: e.to_string(),
            })?;
        state.active = Some(config.clone());
        Ok(())
    }

    /// Switch to a new configuration, falling back to the previous one if the
    /// new one does not activate.
    async fn update_config(
        &self,
        state: &mut State,
        config: RawConfig,
        source: &str,
        save: bool,
    ) -> Result<(), ResmgrError> {
        let previous = state.active.clone();

        if let Err(e) = self.activate(state, &config, "updated").await {
            let message = e.to_string();
            self.logger.log_config_update(source, false, Some(&message));
            self.metrics.record_config_apply(source, false);

            if let Some(previous) = previous {
                if let Err(revert) = self.activate(state, &previous, "reverted").await {
                    error!(error = %revert, "Failed to revert to previous configuration");
                }
            }
            return Err(e);
        }

        if save {
            state.cache.set_config(&config)?;
        }
        self.logger.log_config_update(source, true, None);
        self.metrics.record_config_apply(source, true);
        Ok(())
    }

    async fn set_config(&self, config: RawConfig) -> Result<(), ResmgrError> {
        info!(node = %config.node_name, "Applying new configuration from agent");
        let mut state = self.state.lock().await;

        if let Some(active) = &state.active {
            if active.has_identical_data(&config) {
                info!("Configuration unchanged, nothing to apply");
                return Ok(());
            }
        }

        self.update_config(&mut state, config, "agent", true).await
    }

    async fn reload_forced_config(&self) -> Result<(), ResmgrError> {
        let Some(path) = &self.options.force_config else {
            return Ok(());
        };
        info!(path = %path.display(), "Reloading forced configuration");

        let mut state = self.state.lock().await;
        let config = load_config_file(path, &self.options.node_name)?;
        // forced configuration never goes to the cache
        self.update_config(&mut state, config, "forced", false).await
    }

    async fn set_adjustment(&self, adjustment: Adjustment) -> BTreeMap<String, String> {
        info!(specs = adjustment.specs.len(), "Applying new adjustments from agent");
        let mut state = self.state.lock().await;

        let invalid = adjustment.verify();
        if !invalid.is_empty() {
            self.metrics.inc_adjustment_validation_errors(invalid.len());
            self.logger
                .log_adjustment(adjustment.specs.len(), invalid.len());
            return invalid
                .into_iter()
                .map(|(name, e)| (name, e.to_string()))
                .collect();
        }

        let local = adjustment.for_node(&self.options.node_name);
        let errors: BTreeMap<String, String> = state
            .policy
            .apply_adjustment(&local)
            .await
            .into_iter()
            .map(|(name, e)| (name, e.to_string()))
            .collect();

        if errors.is_empty() {
            if let Err(e) = state.cache.set_adjustments(&adjustment) {
                warn!(error = %e, "Failed to save adjustments");
            }
        }
        self.logger
            .log_adjustment(adjustment.specs.len(), errors.len());
        errors
    }
}

#[async_trait]
impl ConfigHandler for Core {
    async fn set_config(&self, config: RawConfig) -> Result<(), ResmgrError> {
        Core::set_config(self, config).await
    }

    async fn set_adjustment(&self, adjustment: Adjustment) -> BTreeMap<String, String> {
        Core::set_adjustment(self, adjustment).await
    }
}

/// Exit code of an administrative cache reset.
async fn reset_cache(
    options: &ResmgrOptions,
    what: &str,
    reset: impl FnOnce(&mut Cache) -> Result<(), crate::error::CacheError>,
) -> i32 {
    info!(what, "Resetting cached state");
    let socket: &Path = &options.relay.relay_socket;

    if is_listening_socket(socket).await {
        error!(
            socket = %socket.display(),
            "Refusing to reset, an instance is active at the relay socket"
        );
        return 1;
    }

    let result = Cache::open(&options.cache_dir).and_then(|mut cache| reset(&mut cache));
    match result {
        Ok(()) => 0,
        Err(e) => {
            error!(what, error = %e, "Failed to reset cached state");
            1
        }
    }
}

/// Drop the cached active policy and its data.
pub async fn reset_cached_policy(options: &ResmgrOptions) -> i32 {
    reset_cache(options, "active policy", Cache::reset_active_policy).await
}

/// Drop the cached configuration.
pub async fn reset_cached_config(options: &ResmgrOptions) -> i32 {
    reset_cache(options, "configuration", Cache::reset_config).await
}

impl ResmgrOptions {
    /// Options with defaults for everything but the node and the sockets.
    pub fn for_node(node_name: &str, relay_socket: PathBuf, runtime_socket: PathBuf) -> Self {
        Self {
            node_name: node_name.to_string(),
            relay: RelayOptions {
                relay_socket,
                runtime_socket,
                image_socket: None,
                dump_requests: false,
                node_name: node_name.to_string(),
            },
            config_listen: crate::config::DISABLED_LISTEN.to_string(),
            cache_dir: PathBuf::from("/var/lib/resmgr"),
            force_config: None,
            force_config_signal: "SIGHUP".to_string(),
            fallback_config: None,
            disable_policy_switch: false,
            policy: crate::policy::NONE_POLICY.to_string(),
            agent_timeout: DEFAULT_TIMEOUT,
        }
    }
}
