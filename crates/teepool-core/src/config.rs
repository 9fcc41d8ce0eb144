//! teepool.toml configuration parser.
//!
//! The file carries the pool policy, the backend selection, and one
//! launch template per capability. A handful of `TEEPOOL_*` environment
//! variables override the file so container deployments can tune the
//! pool without rewriting it.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::{PoolPolicy, WorkerTemplate};

/// Prefix of variables injected into every worker's environment.
const WORKER_ENV_PREFIX: &str = "TEEPOOL_WORKER_ENV_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TeepoolConfig {
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub templates: Vec<WorkerTemplate>,
    /// Endpoint handed out when no worker can be provided in time.
    pub fallback_endpoint: Option<String>,
}

/// Pool policy as written in the file (all durations in milliseconds).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    pub min_warm_nodes: usize,
    pub max_nodes: usize,
    pub cold_start_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub scale_up_queue_threshold: usize,
    pub scale_down_idle_threshold_ms: u64,
    pub max_queue_depth: usize,
    pub tick_interval_ms: u64,
    /// Defaults to `cold_start_timeout_ms` when absent.
    pub request_deadline_ms: Option<u64>,
    pub error_eviction_threshold: Option<u64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            min_warm_nodes: 1,
            max_nodes: 3,
            cold_start_timeout_ms: 120_000,
            idle_timeout_ms: 300_000,
            scale_up_queue_threshold: 1,
            scale_down_idle_threshold_ms: 600_000,
            max_queue_depth: 256,
            tick_interval_ms: 10_000,
            request_deadline_ms: None,
            error_eviction_threshold: None,
        }
    }
}

impl PolicyConfig {
    pub fn to_policy(&self) -> PoolPolicy {
        PoolPolicy {
            min_warm_nodes: self.min_warm_nodes,
            max_nodes: self.max_nodes,
            cold_start_timeout: Duration::from_millis(self.cold_start_timeout_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            scale_up_queue_threshold: self.scale_up_queue_threshold,
            scale_down_idle_threshold: Duration::from_millis(self.scale_down_idle_threshold_ms),
            max_queue_depth: self.max_queue_depth,
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            request_deadline: Duration::from_millis(
                self.request_deadline_ms.unwrap_or(self.cold_start_timeout_ms),
            ),
            error_eviction_threshold: self.error_eviction_threshold,
        }
    }
}

/// Which provisioning backend to construct.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Local(LocalBackendConfig),
    Remote(RemoteBackendConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local(LocalBackendConfig::default())
    }
}

impl BackendConfig {
    pub fn name(&self) -> &'static str {
        match self {
            BackendConfig::Local(_) => "local",
            BackendConfig::Remote(_) => "remote",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LocalBackendConfig {
    pub launcher: LocalLauncher,
    /// Address workers bind to and are probed on.
    pub host: String,
    pub startup_timeout_ms: u64,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for LocalBackendConfig {
    fn default() -> Self {
        Self {
            launcher: LocalLauncher::default(),
            host: "127.0.0.1".to_string(),
            startup_timeout_ms: 60_000,
            probe_interval_ms: 1_000,
            probe_timeout_ms: 2_000,
        }
    }
}

/// How the local backend materializes a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LocalLauncher {
    /// `<runtime> run -d -p host:port:container_port ... image`.
    Container { runtime: String },
    /// A plain child process told its port through `PORT`.
    Process {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl Default for LocalLauncher {
    fn default() -> Self {
        LocalLauncher::Container {
            runtime: "docker".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteBackendConfig {
    /// Base URL of the fleet-management API.
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for RemoteBackendConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key_env: "TEEPOOL_FLEET_API_KEY".to_string(),
            poll_interval_ms: 3_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl TeepoolConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `TEEPOOL_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(std::env::vars())
    }

    /// Apply `TEEPOOL_*` overrides from an explicit variable list.
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .filter(|(k, _)| k.starts_with("TEEPOOL_"))
            .collect();

        let policy = &mut self.policy;
        override_num(&vars, "TEEPOOL_MIN_WARM_NODES", &mut policy.min_warm_nodes)?;
        override_num(&vars, "TEEPOOL_MAX_NODES", &mut policy.max_nodes)?;
        override_num(&vars, "TEEPOOL_COLD_START_TIMEOUT_MS", &mut policy.cold_start_timeout_ms)?;
        override_num(&vars, "TEEPOOL_IDLE_TIMEOUT_MS", &mut policy.idle_timeout_ms)?;
        override_num(
            &vars,
            "TEEPOOL_SCALE_UP_QUEUE_THRESHOLD",
            &mut policy.scale_up_queue_threshold,
        )?;
        override_num(
            &vars,
            "TEEPOOL_SCALE_DOWN_IDLE_THRESHOLD_MS",
            &mut policy.scale_down_idle_threshold_ms,
        )?;

        if let Some(kind) = vars.get("TEEPOOL_BACKEND") {
            let current = self.backend.name();
            match kind.as_str() {
                requested if requested == current => {}
                "local" => self.backend = BackendConfig::Local(LocalBackendConfig::default()),
                "remote" => self.backend = BackendConfig::Remote(RemoteBackendConfig::default()),
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "TEEPOOL_BACKEND must be `local` or `remote`, got `{other}`"
                    )));
                }
            }
        }

        if let (Some(url), BackendConfig::Remote(remote)) =
            (vars.get("TEEPOOL_FLEET_URL"), &mut self.backend)
        {
            remote.base_url = url.clone();
        }

        if let Some(image) = vars.get("TEEPOOL_IMAGE") {
            match self.templates.first_mut() {
                Some(tpl) => tpl.image = image.clone(),
                None => self.templates.push(WorkerTemplate::new("default", image.clone())),
            }
        }

        let worker_env: Vec<(String, String)> = vars
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(WORKER_ENV_PREFIX)
                    .filter(|name| !name.is_empty())
                    .map(|name| (name.to_string(), v.clone()))
            })
            .collect();
        for tpl in &mut self.templates {
            for (name, value) in &worker_env {
                tpl.env.insert(name.clone(), value.clone());
            }
        }

        debug!(overrides = vars.len(), "environment overrides applied");
        Ok(())
    }

    /// Reject configurations the orchestrator cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.policy;
        if p.max_nodes == 0 {
            return Err(ConfigError::Invalid("policy.max_nodes must be at least 1".into()));
        }
        for (name, value) in [
            ("cold_start_timeout_ms", p.cold_start_timeout_ms),
            ("idle_timeout_ms", p.idle_timeout_ms),
            ("tick_interval_ms", p.tick_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("policy.{name} must be positive")));
            }
        }
        if p.error_eviction_threshold == Some(0) {
            return Err(ConfigError::Invalid(
                "policy.error_eviction_threshold must be at least 1 (omit it to never evict)"
                    .into(),
            ));
        }
        if self.templates.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one [[templates]] entry is required".into(),
            ));
        }

        let mut seen = HashSet::new();
        for tpl in &self.templates {
            if tpl.image.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "template `{}` has an empty image",
                    tpl.capability
                )));
            }
            if !seen.insert(tpl.capability.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate template for capability `{}`",
                    tpl.capability
                )));
            }
        }

        if let BackendConfig::Remote(remote) = &self.backend
            && remote.base_url.trim().is_empty()
        {
            return Err(ConfigError::Invalid("backend.base_url is required for remote".into()));
        }
        Ok(())
    }
}

fn override_num<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Some(raw) = vars.get(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("{key}: not a number: {raw}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = include_str!("../../../tests/fixtures/teepool.toml");

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parse_fixture() {
        let config = TeepoolConfig::from_toml_str(FIXTURE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.policy.min_warm_nodes, 1);
        assert_eq!(config.policy.max_nodes, 4);
        assert_eq!(config.templates.len(), 2);
        assert_eq!(config.templates[0].capability, "inference");
        assert_eq!(config.fallback_endpoint.as_deref(), Some("http://shared-gateway:8000"));
        assert!(matches!(
            config.backend,
            BackendConfig::Local(LocalBackendConfig {
                launcher: LocalLauncher::Container { .. },
                ..
            })
        ));
    }

    #[test]
    fn parse_minimal_uses_defaults() {
        let config = TeepoolConfig::from_toml_str(
            r#"
[[templates]]
capability = "default"
image = "worker:latest"
"#,
        )
        .unwrap();
        config.validate().unwrap();

        let policy = config.policy.to_policy();
        assert_eq!(policy.tick_interval, Duration::from_secs(10));
        assert_eq!(policy.request_deadline, policy.cold_start_timeout);
        assert_eq!(config.backend.name(), "local");
    }

    #[test]
    fn parse_remote_backend() {
        let config = TeepoolConfig::from_toml_str(
            r#"
[backend]
kind = "remote"
base_url = "https://fleet.example.com/api/v1"
poll_interval_ms = 500

[[templates]]
capability = "default"
image = "worker:latest"
"#,
        )
        .unwrap();
        match &config.backend {
            BackendConfig::Remote(remote) => {
                assert_eq!(remote.poll_interval_ms, 500);
                assert_eq!(remote.api_key_env, "TEEPOOL_FLEET_API_KEY");
            }
            other => panic!("expected remote backend, got {other:?}"),
        }
    }

    #[test]
    fn env_overrides_policy_and_templates() {
        let mut config = TeepoolConfig::from_toml_str(FIXTURE).unwrap();
        config
            .apply_overrides(vars(&[
                ("TEEPOOL_MIN_WARM_NODES", "2"),
                ("TEEPOOL_MAX_NODES", "8"),
                ("TEEPOOL_IMAGE", "registry/worker:2"),
                ("TEEPOOL_WORKER_ENV_MODEL", "llama"),
                ("HOME", "/root"),
            ]))
            .unwrap();

        assert_eq!(config.policy.min_warm_nodes, 2);
        assert_eq!(config.policy.max_nodes, 8);
        assert_eq!(config.templates[0].image, "registry/worker:2");
        for tpl in &config.templates {
            assert_eq!(tpl.env.get("MODEL").map(String::as_str), Some("llama"));
        }
    }

    #[test]
    fn env_switches_backend_to_remote() {
        let mut config = TeepoolConfig::from_toml_str(FIXTURE).unwrap();
        config
            .apply_overrides(vars(&[
                ("TEEPOOL_BACKEND", "remote"),
                ("TEEPOOL_FLEET_URL", "https://fleet.internal"),
            ]))
            .unwrap();
        assert!(matches!(
            &config.backend,
            BackendConfig::Remote(r) if r.base_url == "https://fleet.internal"
        ));
        config.validate().unwrap();
    }

    #[test]
    fn env_rejects_bad_values() {
        let mut config = TeepoolConfig::default();
        assert!(
            config
                .apply_overrides(vars(&[("TEEPOOL_MAX_NODES", "many")]))
                .is_err()
        );
        assert!(
            config
                .apply_overrides(vars(&[("TEEPOOL_BACKEND", "k8s")]))
                .is_err()
        );
    }

    #[test]
    fn image_override_creates_default_template() {
        let mut config = TeepoolConfig::default();
        config
            .apply_overrides(vars(&[("TEEPOOL_IMAGE", "worker:1")]))
            .unwrap();
        assert_eq!(config.templates.len(), 1);
        assert_eq!(config.templates[0].capability, "default");
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_zero_max_nodes() {
        let mut config = TeepoolConfig::from_toml_str(FIXTURE).unwrap();
        config.policy.max_nodes = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validate_rejects_zero_eviction_threshold() {
        let mut config = TeepoolConfig::from_toml_str(FIXTURE).unwrap();
        config.policy.error_eviction_threshold = Some(0);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.policy.error_eviction_threshold = Some(1);
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_duplicate_capabilities() {
        let mut config = TeepoolConfig::from_toml_str(FIXTURE).unwrap();
        let dup = config.templates[0].clone();
        config.templates.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_min_warm_above_max() {
        let mut config = TeepoolConfig::from_toml_str(FIXTURE).unwrap();
        config.policy.min_warm_nodes = 10;
        config.policy.max_nodes = 2;
        config.validate().unwrap();
        assert_eq!(config.policy.to_policy().warm_floor(), 2);
    }

    #[test]
    fn validate_requires_remote_base_url() {
        let mut config = TeepoolConfig::from_toml_str(FIXTURE).unwrap();
        config.backend = BackendConfig::Remote(RemoteBackendConfig::default());
        assert!(config.validate().is_err());
    }
}
