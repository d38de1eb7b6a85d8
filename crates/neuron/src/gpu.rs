// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use config::GpuConfig;
use protocol::ResourceKey;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Index reported when no accelerator could be detected.
pub const NO_ACCELERATOR: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuState {
    Idle,
    /// Memory in use and the controller has a backend bound here.
    ModelLoaded,
    /// Memory in use by something the controller did not start.
    OccupiedByOther,
}

/// One row of the vendor tool's process table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuProcess {
    pub gpu_index: u32,
    pub pid: u32,
    pub name: String,
    pub used_memory_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuDeviceStatus {
    /// Device index, or [`NO_ACCELERATOR`].
    pub index: i64,
    pub state: GpuState,
    pub model_name: Option<String>,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub processes: Vec<GpuProcess>,
    pub select_enabled: bool,
}

impl GpuDeviceStatus {
    pub fn no_accelerator() -> Self {
        Self {
            index: NO_ACCELERATOR,
            state: GpuState::Idle,
            model_name: None,
            memory_used_mb: 0,
            memory_total_mb: 0,
            processes: Vec::new(),
            select_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMemory {
    pub index: u32,
    pub used_mb: u64,
    pub total_mb: u64,
}

/// Source of the raw inventory report.
#[async_trait]
pub trait InventoryTool: Send + Sync {
    async fn query(&self) -> Result<String>;
}

/// Runs `nvidia-smi` with no arguments and returns its table output.
pub struct NvidiaSmi {
    path: PathBuf,
    timeout: Duration,
}

impl NvidiaSmi {
    pub fn new(path: PathBuf, timeout: Duration) -> Self {
        Self { path, timeout }
    }
}

#[async_trait]
impl InventoryTool for NvidiaSmi {
    async fn query(&self) -> Result<String> {
        let mut command = Command::new(&self.path);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .with_context(|| format!("{} timed out after {:?}", self.path.display(), self.timeout))?
            .with_context(|| format!("failed to run {}", self.path.display()))?;

        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.path.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Table cells of a `| a | b |` line, trimmed, without the outer borders.
fn cells(line: &str) -> Option<Vec<&str>> {
    let inner = line.trim().strip_prefix('|')?;
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    Some(inner.split('|').map(str::trim).collect())
}

/// `"20123MiB /  46068MiB"` -> (20123, 46068).
fn mib_pair(cell: &str) -> Option<(u64, u64)> {
    let (used, total) = cell.split_once('/')?;
    Some((mib(used)?, mib(total)?))
}

fn mib(text: &str) -> Option<u64> {
    text.trim().strip_suffix("MiB")?.trim().parse().ok()
}

fn is_processes_marker(line: &str) -> bool {
    line.contains("Processes:")
}

/// Parse per-device memory from the default `nvidia-smi` table.
///
/// A device row is a bordered line whose first cell starts with an integer
/// (the index); the following bordered line holding a `xMiB / yMiB` cell
/// carries its memory. Parsing stops at the process table.
pub fn parse_devices(text: &str) -> Vec<DeviceMemory> {
    let mut devices = Vec::new();
    let mut current: Option<u32> = None;

    for line in text.lines() {
        if is_processes_marker(line) {
            break;
        }
        let Some(cells) = cells(line) else {
            continue;
        };

        if let Some(index) = cells
            .first()
            .and_then(|c| c.split_whitespace().next())
            .and_then(|t| t.parse::<u32>().ok())
        {
            current = Some(index);
        }

        let Some(index) = current else {
            continue;
        };
        if let Some((used_mb, total_mb)) = cells.iter().find_map(|c| mib_pair(c)) {
            devices.push(DeviceMemory {
                index,
                used_mb,
                total_mb,
            });
            current = None;
        }
    }
    devices
}

fn is_id_column(token: &str) -> bool {
    token == "N/A" || token == "-" || token.parse::<u32>().is_ok()
}

/// Parse the process attribution table that follows `Processes:`.
///
/// Handles both the current layout (`GPU GI CI PID Type Name Memory`) and
/// the older one without GI/CI columns.
pub fn parse_processes(text: &str) -> Vec<GpuProcess> {
    let mut processes = Vec::new();
    let mut in_section = false;

    for line in text.lines() {
        if is_processes_marker(line) {
            in_section = true;
            continue;
        }
        if !in_section {
            continue;
        }
        let Some(cells) = cells(line) else {
            continue;
        };
        let joined = cells.join(" ");
        let tokens: Vec<&str> = joined.split_whitespace().collect();
        if tokens.len() < 5 {
            continue;
        }
        let Ok(gpu_index) = tokens[0].parse::<u32>() else {
            continue;
        };
        let Some(used_memory_mb) = tokens.last().and_then(|t| mib(t)) else {
            continue;
        };

        let with_instances = tokens.len() >= 7
            && is_id_column(tokens[1])
            && is_id_column(tokens[2])
            && tokens[3].parse::<u32>().is_ok();
        let (pid_at, name_from) = if with_instances { (3, 5) } else { (1, 3) };
        let Ok(pid) = tokens[pid_at].parse::<u32>() else {
            continue;
        };
        let name = tokens[name_from..tokens.len() - 1].join(" ");

        processes.push(GpuProcess {
            gpu_index,
            pid,
            name,
            used_memory_mb,
        });
    }
    processes
}

/// Classify parsed devices. Memory is ground truth; annotations are advisory.
pub fn classify(
    devices: &[DeviceMemory],
    processes: &[GpuProcess],
    threshold_mb: u64,
    annotation_for: impl Fn(u32) -> Option<String>,
) -> Vec<GpuDeviceStatus> {
    devices
        .iter()
        .map(|device| {
            let model_name = annotation_for(device.index);
            let busy = device.used_mb > threshold_mb;
            let (state, select_enabled) = match (busy, &model_name) {
                (true, Some(_)) => (GpuState::ModelLoaded, true),
                (true, None) => (GpuState::OccupiedByOther, false),
                (false, _) => (GpuState::Idle, true),
            };
            GpuDeviceStatus {
                index: i64::from(device.index),
                state,
                model_name,
                memory_used_mb: device.used_mb,
                memory_total_mb: device.total_mb,
                processes: processes
                    .iter()
                    .filter(|p| p.gpu_index == device.index)
                    .cloned()
                    .collect(),
                select_enabled,
            }
        })
        .collect()
}

/// Accelerator inventory plus the controller's device -> backend overlay.
pub struct GpuDetector {
    tool: Arc<dyn InventoryTool>,
    threshold_mb: u64,
    annotations: Mutex<BTreeMap<ResourceKey, String>>,
}

impl GpuDetector {
    pub fn new(tool: Arc<dyn InventoryTool>, threshold_mb: u64) -> Self {
        info!("detector initialised threshold_mb={}", threshold_mb);
        Self {
            tool,
            threshold_mb,
            annotations: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn from_config(config: &GpuConfig) -> Self {
        let tool = NvidiaSmi::new(config.smi_path.clone(), Duration::from_secs(config.timeout_secs.max(1)));
        Self::new(Arc::new(tool), config.memory_threshold_mb)
    }

    fn annotations(&self) -> MutexGuard<'_, BTreeMap<ResourceKey, String>> {
        match self.annotations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("annotation lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn set_model_mapping(&self, key: &ResourceKey, name: &str) {
        debug!("mapping {} -> {}", key, name);
        self.annotations().insert(key.clone(), name.to_string());
    }

    pub fn clear_model_mapping(&self, key: &ResourceKey) {
        if self.annotations().remove(key).is_some() {
            debug!("cleared mapping for {}", key);
        }
    }

    pub fn get_model_for(&self, key: &ResourceKey) -> Option<String> {
        self.annotations().get(key).cloned()
    }

    /// Annotation covering one device: its own key first, then the first
    /// composite key (in canonical order) that contains it.
    pub fn model_for_device(&self, index: u32) -> Option<String> {
        self.get_model_for(&ResourceKey::from_index(index)).or_else(|| {
            self.annotations()
                .iter()
                .find(|(key, _)| key.contains(index))
                .map(|(_, name)| name.clone())
        })
    }

    /// Query the inventory tool and classify every device.
    ///
    /// Never fails: a missing or failing tool, or output with no parseable
    /// device, yields a single [`GpuDeviceStatus::no_accelerator`] entry.
    pub async fn detect(&self) -> Vec<GpuDeviceStatus> {
        let text = match self.tool.query().await {
            Ok(text) => text,
            Err(e) => {
                warn!("inventory query failed, reporting no accelerator: {e:#}");
                return vec![GpuDeviceStatus::no_accelerator()];
            }
        };

        let devices = parse_devices(&text);
        if devices.is_empty() {
            warn!("no devices in inventory output, reporting no accelerator");
            return vec![GpuDeviceStatus::no_accelerator()];
        }
        let processes = parse_processes(&text);
        debug!("parsed {} device(s) and {} process(es)", devices.len(), processes.len());

        classify(&devices, &processes, self.threshold_mb, |index| {
            self.model_for_device(index)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMI: &str = r#"Fri May  3 10:12:44 2024
+-----------------------------------------------------------------------------------------+
| NVIDIA-SMI 550.54.14              Driver Version: 550.54.14      CUDA Version: 12.4     |
|-----------------------------------------+------------------------+----------------------+
| GPU  Name                 Persistence-M | Bus-Id          Disp.A | Volatile Uncorr. ECC |
| Fan  Temp   Perf          Pwr:Usage/Cap |           Memory-Usage | GPU-Util  Compute M. |
|                                         |                        |               MIG M. |
|=========================================+========================+======================|
|   0  NVIDIA A40                     Off |   00000000:3B:00.0 Off |                    0 |
|  0%   30C    P8             22W /  300W |       4MiB /  46068MiB |      0%      Default |
|                                         |                        |                  N/A |
+-----------------------------------------+------------------------+----------------------+
|   1  NVIDIA A40                     Off |   00000000:AF:00.0 Off |                    0 |
|  0%   45C    P0             75W /  300W |   20123MiB /  46068MiB |      0%      Default |
|                                         |                        |                  N/A |
+-----------------------------------------+------------------------+----------------------+
|   2  NVIDIA A40                     Off |   00000000:D8:00.0 Off |                    0 |
| 30%   52C    P2            110W /  300W |   9000MiB /  46068MiB |     12%      Default |
|                                         |                        |                  N/A |
+-----------------------------------------+------------------------+----------------------+

+-----------------------------------------------------------------------------------------+
| Processes:                                                                              |
|  GPU   GI   CI        PID   Type   Process name                              GPU Memory |
|        ID   ID                                                               Usage      |
|=========================================================================================|
|    1   N/A  N/A     12345      C   /usr/bin/python3                            20110MiB |
|    2   N/A  N/A     23456      C   /opt/llama/llama-server                      8990MiB |
+-----------------------------------------------------------------------------------------+
"#;

    const OLD_PROCESSES: &str = r#"
| Processes:                                                       GPU Memory |
|  GPU       PID   Type   Process name                             Usage      |
|=============================================================================|
|    0      4242      C   python train.py                             812MiB |
|  No running processes found                                                 |
"#;

    struct FixedOutput(Result<&'static str, &'static str>);

    #[async_trait]
    impl InventoryTool for FixedOutput {
        async fn query(&self) -> Result<String> {
            match self.0 {
                Ok(text) => Ok(text.to_string()),
                Err(e) => bail!("{e}"),
            }
        }
    }

    fn detector(output: Result<&'static str, &'static str>) -> GpuDetector {
        GpuDetector::new(Arc::new(FixedOutput(output)), 30)
    }

    #[test]
    fn parses_device_memory() {
        let devices = parse_devices(SMI);
        assert_eq!(
            devices,
            vec![
                DeviceMemory { index: 0, used_mb: 4, total_mb: 46068 },
                DeviceMemory { index: 1, used_mb: 20123, total_mb: 46068 },
                DeviceMemory { index: 2, used_mb: 9000, total_mb: 46068 },
            ]
        );
    }

    #[test]
    fn parses_both_process_table_layouts() {
        let procs = parse_processes(SMI);
        assert_eq!(procs.len(), 2);
        assert_eq!(procs[0].gpu_index, 1);
        assert_eq!(procs[0].pid, 12345);
        assert_eq!(procs[0].name, "/usr/bin/python3");
        assert_eq!(procs[1].used_memory_mb, 8990);

        let old = parse_processes(OLD_PROCESSES);
        assert_eq!(
            old,
            vec![GpuProcess {
                gpu_index: 0,
                pid: 4242,
                name: "python train.py".into(),
                used_memory_mb: 812,
            }]
        );
    }

    #[tokio::test]
    async fn classification_uses_memory_and_annotations() {
        let d = detector(Ok(SMI));
        d.set_model_mapping(&ResourceKey::from_index(0), "stale");
        d.set_model_mapping(&ResourceKey::from_index(2), "phi-4");

        let statuses = d.detect().await;
        assert_eq!(statuses.len(), 3);

        // under threshold: idle and selectable even with a stale annotation
        assert_eq!(statuses[0].state, GpuState::Idle);
        assert!(statuses[0].select_enabled);
        assert_eq!(statuses[0].model_name.as_deref(), Some("stale"));

        assert_eq!(statuses[1].state, GpuState::OccupiedByOther);
        assert!(!statuses[1].select_enabled);
        assert_eq!(statuses[1].processes[0].pid, 12345);

        assert_eq!(statuses[2].state, GpuState::ModelLoaded);
        assert!(statuses[2].select_enabled);
        assert_eq!(statuses[2].model_name.as_deref(), Some("phi-4"));
    }

    #[tokio::test]
    async fn composite_annotation_covers_member_devices() {
        let d = detector(Ok(SMI));
        let pair = ResourceKey::parse("1,2").unwrap();
        d.set_model_mapping(&pair, "big-model");
        assert_eq!(d.get_model_for(&pair).as_deref(), Some("big-model"));
        assert_eq!(d.get_model_for(&ResourceKey::from_index(1)), None);

        let statuses = d.detect().await;
        assert_eq!(statuses[1].state, GpuState::ModelLoaded);
        assert_eq!(statuses[2].model_name.as_deref(), Some("big-model"));

        d.clear_model_mapping(&pair);
        assert_eq!(d.model_for_device(1), None);
    }

    #[tokio::test]
    async fn absent_tool_degrades_to_single_sentinel() {
        let statuses = detector(Err("nvidia-smi: not found")).detect().await;
        assert_eq!(statuses, vec![GpuDeviceStatus::no_accelerator()]);
        assert_eq!(statuses[0].index, NO_ACCELERATOR);
        assert_eq!(statuses[0].state, GpuState::Idle);
    }

    #[tokio::test]
    async fn unparseable_output_is_treated_like_absent_tool() {
        let statuses = detector(Ok("something unexpected\n")).detect().await;
        assert_eq!(statuses, vec![GpuDeviceStatus::no_accelerator()]);
    }

    #[tokio::test]
    async fn missing_binary_fails_query() {
        let tool = NvidiaSmi::new("/nonexistent/nvidia-smi".into(), Duration::from_secs(1));
        assert!(tool.query().await.is_err());
    }
}
