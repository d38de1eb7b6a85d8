// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod resource_key;

pub use resource_key::{InvalidResourceKey, ResourceKey, ResourceKeyInput, DEFAULT_DEVICE_PAIR};

/// Static definition of a backend (a model plus the parameters used to serve it).
///
/// Descriptors come from configuration and are read-only to the core: the
/// lifecycle manager clones them into active slots but never mutates them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    /// Stable identifier used by every api surface.
    pub id: String,
    /// Human-readable display name for operators.
    pub name: String,
    /// Filesystem path to the model weights; never created or deleted by us.
    pub path: PathBuf,
    #[serde(default)]
    pub parameters: LaunchParameters,
    #[serde(default)]
    pub metadata: BackendMetadata,
}

impl BackendDescriptor {
    /// True when `name` refers to this backend, ignoring an ollama-style
    /// `:tag` suffix (`phi-4:latest` matches `phi-4`).
    pub fn matches_name(&self, name: &str) -> bool {
        if self.id == name {
            return true;
        }
        match name.rsplit_once(':') {
            Some((base, _tag)) => self.id == base,
            None => false,
        }
    }
}

/// Launch parameters for a backend process.
///
/// Every field is optional; unset fields are simply not passed to the
/// backend executable so its own defaults apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_ctx: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_threads: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_gpu_layers: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_batch: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f32>,
    /// Extra arguments appended verbatim after the generated ones.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

impl LaunchParameters {
    /// `(name, value)` pairs for every parameter that is set, in a stable
    /// order. Used for operator-facing listings.
    pub fn listing(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        if let Some(v) = self.n_ctx {
            out.push(("n_ctx", v.to_string()));
        }
        if let Some(v) = self.n_threads {
            out.push(("n_threads", v.to_string()));
        }
        if let Some(v) = self.n_gpu_layers {
            out.push(("n_gpu_layers", v.to_string()));
        }
        if let Some(v) = self.n_batch {
            out.push(("n_batch", v.to_string()));
        }
        if let Some(v) = self.temperature {
            out.push(("temperature", v.to_string()));
        }
        if let Some(v) = self.top_p {
            out.push(("top_p", v.to_string()));
        }
        if let Some(v) = self.top_k {
            out.push(("top_k", v.to_string()));
        }
        if let Some(v) = self.repeat_penalty {
            out.push(("repeat_penalty", v.to_string()));
        }
        if !self.extra_args.is_empty() {
            out.push(("extra_args", self.extra_args.join(" ")));
        }
        out
    }
}

/// Descriptive metadata; free text, may be empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendMetadata {
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub parameter_count: String,
    #[serde(default)]
    pub quantization: String,
    #[serde(default)]
    pub description: String,
}

/// Lifecycle state of the backend bound to one resource key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// The process exited without being asked to.
    Crashed,
    /// The process state could not be determined.
    Error,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Starting => "starting",
            ProcessStatus::Running => "running",
            ProcessStatus::Stopping => "stopping",
            ProcessStatus::Crashed => "crashed",
            ProcessStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time snapshot of one resource key. Does not involve a network probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotStatus {
    pub resource_key: ResourceKey,
    pub status: ProcessStatus,
    pub backend_id: Option<String>,
    pub backend_name: Option<String>,
    pub pid: Option<u32>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub uptime_seconds: Option<u64>,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// True when the backend was started by a previous controller instance
    /// and re-attached from the process registry.
    #[serde(default)]
    pub adopted: bool,
}

impl SlotStatus {
    /// Snapshot for a key with nothing bound.
    pub fn stopped(resource_key: ResourceKey) -> Self {
        Self {
            resource_key,
            status: ProcessStatus::Stopped,
            backend_id: None,
            backend_name: None,
            pid: None,
            loaded_at: None,
            uptime_seconds: None,
            host: None,
            port: None,
            adopted: false,
        }
    }
}

/// Result of a live health probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub resource_key: ResourceKey,
    pub healthy: bool,
    pub status: ProcessStatus,
    pub message: String,
    pub uptime_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadResponse {
    pub success: bool,
    pub resource_key: ResourceKey,
    pub backend_id: String,
    pub message: String,
    pub status: SlotStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnloadResponse {
    pub success: bool,
    pub resource_key: ResourceKey,
    pub message: String,
}

/// Outcome of a switch. Switching is not atomic: the old backend is fully
/// unloaded before the new one starts, and a failed load leaves the key empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchResponse {
    pub success: bool,
    pub resource_key: ResourceKey,
    pub old_backend_id: Option<String>,
    pub new_backend_id: String,
    pub message: String,
    pub status: SlotStatus,
}

/// Catalog entry enriched with live binding information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub loaded: bool,
    pub resource_keys: Vec<ResourceKey>,
    pub family: String,
    pub parameter_count: String,
    pub quantization: String,
    pub description: String,
}

/// Request body for load and switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadRequest {
    pub model_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsResponse {
    pub resource_key: ResourceKey,
    /// Newest first.
    pub logs: Vec<String>,
    pub total_lines: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupRequest {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub terminated: usize,
    pub orphans: Vec<u32>,
}
