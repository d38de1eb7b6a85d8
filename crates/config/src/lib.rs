// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use protocol::{BackendDescriptor, ResourceKey};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Root configuration, read once at startup from a TOML file.
///
/// Every section and field has a default so a minimal file only needs to
/// list `[[models]]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NeuronConfig {
    pub server: ServerConfig,
    pub backend: BackendSettings,
    pub gpu: GpuConfig,
    pub registry: RegistryConfig,
    pub models: Vec<BackendDescriptor>,
}

/// Listener for the management and compatibility http surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Unload every backend when the controller stops. Backends are left
    /// running otherwise and re-adopted from the registry on next start.
    pub unload_on_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            unload_on_shutdown: false,
        }
    }
}

/// How backend processes are launched, probed and stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub executable_path: PathBuf,
    pub host: String,
    /// Keys without an explicit entry in `ports` listen on
    /// `default_port + 1 + lowest device index`.
    pub default_port: u16,
    /// Resource key -> port.
    pub ports: BTreeMap<String, u16>,
    pub startup_timeout_secs: u64,
    pub readiness_interval_ms: u64,
    pub stop_timeout_secs: u64,
    pub switch_settle_ms: u64,
    pub health_path: String,
    pub health_timeout_secs: u64,
    pub restart_on_crash: bool,
    /// 0 disables the periodic reconciliation task.
    pub reconcile_interval_secs: u64,
    pub log_buffer_lines: usize,
    pub check_port_available: bool,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            executable_path: PathBuf::from("llama-server"),
            host: "127.0.0.1".to_string(),
            default_port: 8080,
            ports: BTreeMap::new(),
            startup_timeout_secs: 60,
            readiness_interval_ms: 1000,
            stop_timeout_secs: 30,
            switch_settle_ms: 1000,
            health_path: "/health".to_string(),
            health_timeout_secs: 5,
            restart_on_crash: false,
            reconcile_interval_secs: 0,
            log_buffer_lines: 300,
            check_port_available: true,
        }
    }
}

impl BackendSettings {
    /// Port the backend bound to `key` listens on.
    pub fn port_for(&self, key: &ResourceKey) -> u16 {
        if let Some(port) = self.ports.get(&key.to_string()) {
            return *port;
        }
        let offset = u16::try_from(key.lowest()).unwrap_or(u16::MAX);
        self.default_port.saturating_add(1).saturating_add(offset)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms.max(10))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn switch_settle(&self) -> Duration {
        Duration::from_millis(self.switch_settle_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs.max(1))
    }

    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.reconcile_interval_secs > 0).then(|| Duration::from_secs(self.reconcile_interval_secs))
    }

    /// File name of the backend executable, used to recognise backend
    /// processes in the os process table.
    pub fn executable_name(&self) -> String {
        self.executable_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "llama-server".to_string())
    }
}

/// Vendor inventory tool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    pub smi_path: PathBuf,
    /// Used memory above this many MiB means the device holds a workload.
    pub memory_threshold_mb: u64,
    pub timeout_secs: u64,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            smi_path: PathBuf::from("nvidia-smi"),
            memory_threshold_mb: 30,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub path: PathBuf,
    /// Executable name used for orphan detection. Defaults to the file name
    /// of `backend.executable_path` when empty.
    pub executable_name: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let path = cache::state_dir()
            .map(|dir| dir.join("processes.json"))
            .unwrap_or_else(|_| PathBuf::from("data/processes.json"));
        Self {
            path,
            executable_name: String::new(),
        }
    }
}

impl NeuronConfig {
    /// Parse configuration from TOML text and validate it.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let mut config: NeuronConfig =
            toml::from_str(text).context("failed to parse configuration TOML")?;
        config.normalize()?;
        Ok(config)
    }

    /// Executable name orphan detection looks for.
    pub fn orphan_executable_name(&self) -> String {
        if self.registry.executable_name.trim().is_empty() {
            self.backend.executable_name()
        } else {
            self.registry.executable_name.clone()
        }
    }

    /// Validate hard constraints and rewrite port keys into canonical form.
    fn normalize(&mut self) -> Result<()> {
        let mut seen = HashSet::new();
        for model in &self.models {
            if model.id.trim().is_empty() {
                bail!("model with empty id in configuration");
            }
            if !seen.insert(model.id.as_str()) {
                bail!("duplicate model id {:?} in configuration", model.id);
            }
        }

        if self.backend.log_buffer_lines == 0 {
            bail!("backend.log_buffer_lines must be greater than zero");
        }

        let mut ports = BTreeMap::new();
        for (raw, port) in &self.backend.ports {
            let key = ResourceKey::parse(raw)
                .with_context(|| format!("invalid key {raw:?} in backend.ports"))?;
            if ports.insert(key.to_string(), *port).is_some() {
                bail!("backend.ports lists resource key {key} more than once");
            }
        }
        self.backend.ports = ports;

        Ok(())
    }

    /// Non-fatal findings worth surfacing to the operator.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.models.is_empty() {
            warnings.push("no models configured".to_string());
        }
        for model in &self.models {
            if !model.path.exists() {
                warnings.push(format!(
                    "model {:?} points at missing weights file {}",
                    model.id,
                    model.path.display()
                ));
            }
        }
        warnings
    }
}

/// Load configuration from a TOML file on disk.
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<NeuronConfig> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file {}", path.display()))?;
    let config = NeuronConfig::from_toml_str(&text)
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    info!("config: loaded {} model(s) from {}", config.models.len(), path.display());
    Ok(config)
}
