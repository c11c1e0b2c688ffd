//! Service configuration.
//!
//! Read from a YAML file (see `config/protoscribe.yaml`). Every field has a
//! default, so an empty file or a missing section is valid. Connection
//! strings never live in the file: each backend names the environment
//! variable that holds its secret.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use protoscribe_core::broker::RetryPolicy;
use protoscribe_core::{OrchestratorConfig, StageFailurePolicy};

/// Deployment environment. Selects log format and verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Local,
    Dev,
    Prod,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Dev => "dev",
            Self::Prod => "prod",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub env: Environment,
    pub http: HttpConfig,
    pub broker: BrokerConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind_addr: SocketAddr,
    /// Upper bound on captured audio, one-shot body or streamed session.
    pub max_upload_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_upload_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub backend: Backend,
    /// Environment variable holding the queue database URL.
    pub connection_string_env: String,
    pub max_attempts: u32,
    pub backoff_step_ms: u64,
    pub supervisor_interval_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            connection_string_env: "BROKER_DATABASE_URL".to_string(),
            max_attempts: 5,
            backoff_step_ms: 1000,
            supervisor_interval_ms: 5000,
        }
    }
}

impl BrokerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.backoff_step_ms))
    }

    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_millis(self.supervisor_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: Backend,
    /// Environment variable holding the task database URL.
    pub connection_string_env: String,
    /// Directory for uploaded audio.
    pub blob_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            connection_string_env: "DATABASE_URL".to_string(),
            blob_dir: PathBuf::from("./data/blobs"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub transcribe_queue: String,
    pub protocol_queue: String,
    pub call_timeout_ms: u64,
    pub stage_failure_policy: StageFailurePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            transcribe_queue: defaults.transcribe_queue,
            protocol_queue: defaults.protocol_queue,
            call_timeout_ms: defaults.call_timeout.as_millis() as u64,
            stage_failure_policy: defaults.stage_failure_policy,
        }
    }
}

impl PipelineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            transcribe_queue: self.transcribe_queue.clone(),
            protocol_queue: self.protocol_queue.clone(),
            call_timeout: self.call_timeout(),
            stage_failure_policy: self.stage_failure_policy,
        }
    }
}

impl ServiceConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("Invalid service config YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&yaml).with_context(|| format!("Failed to load {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        if self.pipeline.transcribe_queue.is_empty() || self.pipeline.protocol_queue.is_empty() {
            anyhow::bail!("pipeline queue names must not be empty");
        }
        if self.pipeline.transcribe_queue == self.pipeline.protocol_queue {
            anyhow::bail!(
                "transcribe and protocol queues must differ (both '{}')",
                self.pipeline.transcribe_queue
            );
        }
        if self.pipeline.call_timeout_ms == 0 {
            anyhow::bail!("pipeline.call_timeout_ms must be positive");
        }
        Ok(())
    }
}

/// Load `.env.<env>` if present, falling back to `.env`.
pub fn load_env_file(env: Environment) {
    let name = format!(".env.{}", env.as_str());
    match dotenvy::from_filename(&name) {
        Ok(path) => tracing::debug!(path = %path.display(), "Loaded environment file"),
        Err(_) => {
            let _ = dotenvy::dotenv();
        }
    }
}

/// Read the secret named by a `connection_string_env` field.
pub fn secret_from_env(var: &str) -> Result<String> {
    std::env::var(var).with_context(|| format!("Environment variable {} is not set", var))
}
