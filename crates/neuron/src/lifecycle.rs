// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use config::BackendSettings;
use protocol::{
    BackendDescriptor, BackendInfo, HealthReport, LoadResponse, LogsResponse, ProcessStatus,
    ResourceKey, SlotStatus, SwitchResponse, UnloadResponse,
};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::error::LifecycleError;
use crate::gpu::{GpuDetector, GpuDeviceStatus};
use crate::os::ProcessTable;
use crate::process::{AdapterError, AdapterSettings, ProcessAdapter, Readiness};
use crate::registry::{EntryStatus, ProcessRegistry, RegistryEntry};

/// How long a failed start waits for its SIGKILLed backend to be reaped.
///
/// The key is released either way; the wait only keeps a dying process from
/// still holding the port when the next load on the same key begins.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// A backend bound to a resource key.
pub struct ActiveBackend {
    pub descriptor: BackendDescriptor,
    pub adapter: ProcessAdapter,
    pub loaded_at: DateTime<Utc>,
    /// Re-attached from the registry rather than started by this instance.
    pub adopted: bool,
}

impl ActiveBackend {
    pub fn base_url(&self) -> String {
        self.adapter.base_url()
    }
}

#[derive(Default)]
struct Slot {
    /// A load, unload or switch is in progress. Other transitions on the
    /// key fail with [`LifecycleError::Busy`] until it ends.
    busy: bool,
    active: Option<Arc<ActiveBackend>>,
}

/// Clears the busy flag of a slot when the transition ends, however it ends.
struct Transition<'a> {
    manager: &'a LifecycleManager,
    key: ResourceKey,
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        let mut slots = self.manager.slots();
        let empty = match slots.get_mut(&self.key) {
            Some(slot) => {
                slot.busy = false;
                slot.active.is_none()
            }
            None => false,
        };
        if empty {
            slots.remove(&self.key);
        }
    }
}

/// Kills the backend and releases its key if a start or a teardown is
/// abandoned before it completes.
///
/// Both transitions await process i/o, so the caller dropping the future
/// (a client timeout, a `tokio::time::timeout`) would otherwise leave the
/// key bound to a half-started or half-stopped process. The guard runs from
/// `Drop`, which is synchronous: it sends SIGKILL without waiting and
/// clears the slot, the registry entry and the GPU annotation.
struct AbandonGuard<'a> {
    manager: &'a LifecycleManager,
    key: ResourceKey,
    active: Arc<ActiveBackend>,
    operation: &'static str,
    armed: bool,
}

impl<'a> AbandonGuard<'a> {
    fn arm(
        manager: &'a LifecycleManager,
        key: &ResourceKey,
        active: &Arc<ActiveBackend>,
        operation: &'static str,
    ) -> Self {
        Self {
            manager,
            key: key.clone(),
            active: active.clone(),
            operation,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(
                "{} of {} on {} abandoned; killing backend",
                self.operation, self.active.descriptor.id, self.key
            );
            self.active.adapter.abort();
            self.manager.release(&self.key);
        }
    }
}

/// Loads, unloads and switches backends per resource key.
///
/// Each key holds at most one backend. Transitions on one key are mutually
/// exclusive (a concurrent one fails with [`LifecycleError::Busy`]) while
/// different keys proceed independently: the slot map lock only guards
/// bookkeeping and is never held across process i/o or network probes.
pub struct LifecycleManager {
    catalog: Vec<BackendDescriptor>,
    settings: BackendSettings,
    registry: Arc<ProcessRegistry>,
    gpu: Arc<GpuDetector>,
    table: Arc<dyn ProcessTable>,
    http: reqwest::Client,
    slots: Mutex<BTreeMap<ResourceKey, Slot>>,
}

impl LifecycleManager {
    pub fn new(
        catalog: Vec<BackendDescriptor>,
        settings: BackendSettings,
        registry: Arc<ProcessRegistry>,
        gpu: Arc<GpuDetector>,
        table: Arc<dyn ProcessTable>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            catalog,
            settings,
            registry,
            gpu,
            table,
            http,
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, BTreeMap<ResourceKey, Slot>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("slots lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn settings(&self) -> &BackendSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &[BackendDescriptor] {
        &self.catalog
    }

    /// Normalise a textual gpu identifier.
    pub fn parse_key(raw: &str) -> Result<ResourceKey, LifecycleError> {
        Ok(ResourceKey::parse(raw)?)
    }

    pub fn descriptor(&self, backend_id: &str) -> Result<&BackendDescriptor, LifecycleError> {
        self.catalog
            .iter()
            .find(|d| d.id == backend_id)
            .ok_or_else(|| LifecycleError::NotFound(backend_id.to_string()))
    }

    fn begin(&self, key: &ResourceKey) -> Result<Transition<'_>, LifecycleError> {
        let mut slots = self.slots();
        let slot = slots.entry(key.clone()).or_default();
        if slot.busy {
            return Err(LifecycleError::Busy(key.clone()));
        }
        slot.busy = true;
        Ok(Transition {
            manager: self,
            key: key.clone(),
        })
    }

    fn active(&self, key: &ResourceKey) -> Option<Arc<ActiveBackend>> {
        self.slots().get(key).and_then(|s| s.active.clone())
    }

    fn install(&self, key: &ResourceKey, active: Arc<ActiveBackend>) {
        self.slots().entry(key.clone()).or_default().active = Some(active);
    }

    fn uninstall(&self, key: &ResourceKey) {
        let mut slots = self.slots();
        let remove = match slots.get_mut(key) {
            Some(slot) => {
                slot.active = None;
                !slot.busy
            }
            None => false,
        };
        if remove {
            slots.remove(key);
        }
    }

    /// Drop the slot, the registry entry and the GPU annotation for `key`.
    fn release(&self, key: &ResourceKey) {
        self.uninstall(key);
        if let Err(e) = self.registry.unregister(key) {
            warn!("failed to unregister {}: {e:#}", key);
        }
        self.gpu.clear_model_mapping(key);
    }

    /// Start `backend_id` on `key`.
    ///
    /// Fails with [`LifecycleError::AlreadyBound`] when the key already has a
    /// backend (crashed ones included): there is no implicit preemption.
    pub async fn load(
        &self,
        backend_id: &str,
        key: &ResourceKey,
    ) -> Result<LoadResponse, LifecycleError> {
        let descriptor = self.descriptor(backend_id)?.clone();
        let _transition = self.begin(key)?;
        if let Some(active) = self.active(key) {
            return Err(LifecycleError::AlreadyBound {
                key: key.clone(),
                backend_id: active.descriptor.id.clone(),
            });
        }

        info!("load backend_id={} key={}", backend_id, key);
        let active = self.start_backend(descriptor, key).await?;
        Ok(LoadResponse {
            success: true,
            resource_key: key.clone(),
            backend_id: backend_id.to_string(),
            message: format!("{} loaded on {}", active.descriptor.name, key),
            status: self.snapshot(key, &active),
        })
    }

    /// Spawn, wait for readiness, record. On any failure nothing stays bound.
    async fn start_backend(
        &self,
        descriptor: BackendDescriptor,
        key: &ResourceKey,
    ) -> Result<Arc<ActiveBackend>, LifecycleError> {
        let adapter = ProcessAdapter::new(
            AdapterSettings::for_key(&self.settings, key),
            self.table.clone(),
            self.http.clone(),
        );
        adapter
            .start(&descriptor.path, &descriptor.parameters)
            .map_err(|source| LifecycleError::Adapter {
                key: key.clone(),
                source,
            })?;

        let active = Arc::new(ActiveBackend {
            descriptor,
            adapter,
            loaded_at: Utc::now(),
            adopted: false,
        });
        self.install(key, active.clone());
        let guard = AbandonGuard::arm(self, key, &active, "start");

        let timeout = self.settings.startup_timeout();
        let failure = match active
            .adapter
            .wait_until_ready(timeout, self.settings.readiness_interval())
            .await
        {
            Readiness::Ready => None,
            Readiness::Exited { code } => Some(LifecycleError::Adapter {
                key: key.clone(),
                source: AdapterError::ExitedDuringStartup { code },
            }),
            Readiness::TimedOut => Some(LifecycleError::StartupTimeout {
                key: key.clone(),
                backend_id: active.descriptor.id.clone(),
                timeout,
            }),
        };

        let failure = match failure {
            Some(err) => Some(err),
            None => self.record(key, &active).err(),
        };

        if let Some(err) = failure {
            error!("load on {} failed: {}", key, err);
            active.adapter.stop(false, KILL_WAIT).await;
            self.uninstall(key);
            guard.disarm();
            return Err(err);
        }

        self.gpu.set_model_mapping(key, &active.descriptor.name);
        guard.disarm();
        info!("{} running on {} pid={:?}", active.descriptor.id, key, active.adapter.get_pid());
        Ok(active)
    }

    fn record(&self, key: &ResourceKey, active: &ActiveBackend) -> Result<(), LifecycleError> {
        // The process can die between the last readiness probe and here.
        let Some(pid) = active.adapter.get_pid() else {
            return Err(LifecycleError::Adapter {
                key: key.clone(),
                source: AdapterError::ExitedDuringStartup {
                    code: active.adapter.exit_code(),
                },
            });
        };
        let entry = RegistryEntry {
            resource_key: key.clone(),
            pid,
            backend_id: active.descriptor.id.clone(),
            backend_name: active.descriptor.name.clone(),
            weights_path: active.descriptor.path.clone(),
            port: active.adapter.settings().port,
            started_at: active.loaded_at,
            command_line: active.adapter.command_line(),
            status: EntryStatus::Running,
        };
        self.registry
            .register(entry)
            .map_err(|source| LifecycleError::Registry {
                key: key.clone(),
                source,
            })
    }

    /// Stop the backend and release the key whatever the stop outcome.
    ///
    /// The release also happens if this future is dropped while the stop is
    /// still waiting on the process: the backend is then killed outright.
    async fn teardown(&self, key: &ResourceKey, active: &Arc<ActiveBackend>) -> bool {
        let guard = AbandonGuard::arm(self, key, active, "stop");
        let stopped = active
            .adapter
            .stop(true, self.settings.stop_timeout())
            .await;
        guard.disarm();
        if !stopped {
            error!("backend on {} did not stop cleanly; releasing key anyway", key);
        }
        self.release(key);
        stopped
    }

    /// Stop whatever is bound on `key`. Succeeds as a no-op when nothing is.
    pub async fn unload(&self, key: &ResourceKey) -> Result<UnloadResponse, LifecycleError> {
        let _transition = self.begin(key)?;
        let Some(active) = self.active(key) else {
            return Ok(UnloadResponse {
                success: true,
                resource_key: key.clone(),
                message: format!("nothing loaded on {key}"),
            });
        };

        info!("unload backend_id={} key={}", active.descriptor.id, key);
        let stopped = self.teardown(key, &active).await;
        Ok(UnloadResponse {
            success: stopped,
            resource_key: key.clone(),
            message: if stopped {
                format!("{} unloaded from {}", active.descriptor.name, key)
            } else {
                format!(
                    "{} did not stop cleanly; {} released anyway",
                    active.descriptor.name, key
                )
            },
        })
    }

    /// Replace the backend on `key` with `backend_id`.
    ///
    /// Not atomic: the old backend is fully unloaded, then the new one is
    /// loaded after a settle delay. If that load fails the key is left empty;
    /// the old backend is not restored.
    pub async fn switch(
        &self,
        backend_id: &str,
        key: &ResourceKey,
    ) -> Result<SwitchResponse, LifecycleError> {
        let descriptor = self.descriptor(backend_id)?.clone();
        let _transition = self.begin(key)?;
        let current = self.active(key);
        let old_backend_id = current.as_ref().map(|c| c.descriptor.id.clone());

        if let Some(current) = &current {
            if current.descriptor.id == backend_id
                && current.adapter.get_status() == ProcessStatus::Running
            {
                return Ok(SwitchResponse {
                    success: true,
                    resource_key: key.clone(),
                    old_backend_id,
                    new_backend_id: backend_id.to_string(),
                    message: format!("{} already running on {}", current.descriptor.name, key),
                    status: self.snapshot(key, current),
                });
            }

            info!("switch {} -> {} on {}", current.descriptor.id, backend_id, key);
            self.teardown(key, current).await;
            sleep(self.settings.switch_settle()).await;
        } else {
            info!("switch to {} on empty {}", backend_id, key);
        }

        let active = self.start_backend(descriptor, key).await?;
        Ok(SwitchResponse {
            success: true,
            resource_key: key.clone(),
            old_backend_id,
            new_backend_id: backend_id.to_string(),
            message: format!("{} now serving {}", active.descriptor.name, key),
            status: self.snapshot(key, &active),
        })
    }

    /// Snapshot without a network probe. A crash noticed here is written
    /// back to the registry.
    fn snapshot(&self, key: &ResourceKey, active: &ActiveBackend) -> SlotStatus {
        let status = active.adapter.get_status();
        if status == ProcessStatus::Crashed {
            if let Err(e) = self.registry.set_status(key, EntryStatus::Stopped) {
                warn!("failed to mark {} stopped: {e:#}", key);
            }
        }
        SlotStatus {
            resource_key: key.clone(),
            status,
            backend_id: Some(active.descriptor.id.clone()),
            backend_name: Some(active.descriptor.name.clone()),
            pid: active.adapter.get_pid(),
            loaded_at: Some(active.loaded_at),
            uptime_seconds: active.adapter.get_uptime_seconds(),
            host: Some(self.settings.host.clone()),
            port: Some(active.adapter.settings().port),
            adopted: active.adopted,
        }
    }

    pub fn status(&self, key: &ResourceKey) -> SlotStatus {
        match self.active(key) {
            Some(active) => self.snapshot(key, &active),
            None => SlotStatus::stopped(key.clone()),
        }
    }

    /// Every configured or bound key, in canonical order.
    pub fn all_statuses(&self) -> Vec<SlotStatus> {
        let mut keys: BTreeSet<ResourceKey> = self
            .settings
            .ports
            .keys()
            .filter_map(|raw| ResourceKey::parse(raw).ok())
            .collect();
        keys.extend(self.slots().keys().cloned());
        keys.iter().map(|key| self.status(key)).collect()
    }

    /// Running backends in canonical key order.
    pub fn running(&self) -> Vec<(ResourceKey, Arc<ActiveBackend>)> {
        let active: Vec<(ResourceKey, Arc<ActiveBackend>)> = self
            .slots()
            .iter()
            .filter_map(|(k, s)| s.active.clone().map(|a| (k.clone(), a)))
            .collect();
        active
            .into_iter()
            .filter(|(_, a)| a.adapter.get_status() == ProcessStatus::Running)
            .collect()
    }

    /// Live probe of the backend's health endpoint.
    pub async fn healthcheck(&self, key: &ResourceKey) -> HealthReport {
        let Some(active) = self.active(key) else {
            return HealthReport {
                resource_key: key.clone(),
                healthy: false,
                status: ProcessStatus::Stopped,
                message: format!("no backend loaded on {key}"),
                uptime_seconds: None,
            };
        };

        let snapshot = self.snapshot(key, &active);
        if snapshot.status != ProcessStatus::Running {
            return HealthReport {
                resource_key: key.clone(),
                healthy: false,
                status: snapshot.status,
                message: format!("backend process is {}", snapshot.status),
                uptime_seconds: snapshot.uptime_seconds,
            };
        }

        let healthy = active.adapter.is_healthy().await;
        HealthReport {
            resource_key: key.clone(),
            healthy,
            status: snapshot.status,
            message: if healthy {
                "backend is responding".to_string()
            } else {
                "process is running but the health endpoint is not responding".to_string()
            },
            uptime_seconds: active.adapter.get_uptime_seconds(),
        }
    }

    /// Newest-first log lines, capped at the buffer capacity.
    pub fn logs(&self, key: &ResourceKey, max_lines: usize) -> Result<LogsResponse, LifecycleError> {
        let active = self
            .active(key)
            .ok_or_else(|| LifecycleError::NotBound(key.clone()))?;
        let logs = active.adapter.get_logs(max_lines);
        Ok(LogsResponse {
            resource_key: key.clone(),
            total_lines: logs.len(),
            logs,
        })
    }

    pub fn clear_logs(&self, key: &ResourceKey) -> Result<(), LifecycleError> {
        let active = self
            .active(key)
            .ok_or_else(|| LifecycleError::NotBound(key.clone()))?;
        active.adapter.clear_logs();
        Ok(())
    }

    /// Catalog joined with the keys currently serving each backend.
    pub fn list_backends(&self) -> Vec<BackendInfo> {
        let bound: Vec<(ResourceKey, String)> = self
            .slots()
            .iter()
            .filter_map(|(k, s)| s.active.as_ref().map(|a| (k.clone(), a.descriptor.id.clone())))
            .collect();

        self.catalog
            .iter()
            .map(|d| {
                let resource_keys: Vec<ResourceKey> = bound
                    .iter()
                    .filter(|(_, id)| *id == d.id)
                    .map(|(k, _)| k.clone())
                    .collect();
                BackendInfo {
                    id: d.id.clone(),
                    name: d.name.clone(),
                    path: d.path.clone(),
                    loaded: !resource_keys.is_empty(),
                    resource_keys,
                    family: d.metadata.family.clone(),
                    parameter_count: d.metadata.parameter_count.clone(),
                    quantization: d.metadata.quantization.clone(),
                    description: d.metadata.description.clone(),
                }
            })
            .collect()
    }

    pub async fn gpu_statuses(&self) -> Vec<GpuDeviceStatus> {
        self.gpu.detect().await
    }

    /// Re-attach backends recorded by a previous controller instance.
    ///
    /// Every entry is verified first; entries whose process is gone or is no
    /// longer a backend are dropped from the registry. Returns the adopted
    /// keys.
    pub fn adopt_from_registry(&self) -> Vec<ResourceKey> {
        let mut adopted = Vec::new();
        for (key, alive) in self.registry.verify_all() {
            if !alive {
                info!("dropping stale registry entry for {}", key);
                if let Err(e) = self.registry.unregister(&key) {
                    warn!("failed to unregister {}: {e:#}", key);
                }
                continue;
            }
            let Some(entry) = self.registry.get(&key) else {
                continue;
            };
            if self.active(&key).is_some() {
                continue;
            }

            let descriptor = match self.descriptor(&entry.backend_id) {
                Ok(d) => d.clone(),
                Err(_) => {
                    warn!("adopted backend {} on {} is not in the catalog", entry.backend_id, key);
                    BackendDescriptor {
                        id: entry.backend_id.clone(),
                        name: entry.backend_name.clone(),
                        path: entry.weights_path.clone(),
                        parameters: Default::default(),
                        metadata: Default::default(),
                    }
                }
            };

            let mut settings = AdapterSettings::for_key(&self.settings, &key);
            settings.port = entry.port;
            let running_for = (Utc::now() - entry.started_at).to_std().unwrap_or_default();
            let adapter = ProcessAdapter::attach(
                settings,
                self.table.clone(),
                self.http.clone(),
                entry.pid,
                running_for,
                entry.command_line.clone(),
            );
            self.gpu.set_model_mapping(&key, &descriptor.name);
            self.install(
                &key,
                Arc::new(ActiveBackend {
                    descriptor,
                    adapter,
                    loaded_at: entry.started_at,
                    adopted: true,
                }),
            );
            info!("adopted {} on {} pid={}", entry.backend_id, key, entry.pid);
            adopted.push(key);
        }
        adopted
    }

    /// One reconciliation pass: crashed keys are marked in the registry and,
    /// when `restart_on_crash` is set, switched back to the same backend.
    /// Returns the keys that were restarted.
    pub async fn reconcile(&self) -> Vec<ResourceKey> {
        let bound: Vec<(ResourceKey, Arc<ActiveBackend>)> = self
            .slots()
            .iter()
            .filter(|(_, s)| !s.busy)
            .filter_map(|(k, s)| s.active.clone().map(|a| (k.clone(), a)))
            .collect();

        let mut restarted = Vec::new();
        for (key, active) in bound {
            if self.snapshot(&key, &active).status != ProcessStatus::Crashed {
                continue;
            }
            if !self.settings.restart_on_crash {
                warn!(
                    "backend {} on {} has crashed; restart_on_crash is off",
                    active.descriptor.id, key
                );
                continue;
            }
            warn!("restarting crashed backend {} on {}", active.descriptor.id, key);
            match self.switch(&active.descriptor.id, &key).await {
                Ok(_) => restarted.push(key),
                Err(e) => error!("restart on {} failed: {}", key, e),
            }
        }
        restarted
    }

    /// Called once when the controller stops.
    pub async fn shutdown(&self, unload_all: bool) {
        let keys: Vec<ResourceKey> = self
            .slots()
            .iter()
            .filter(|(_, s)| s.active.is_some())
            .map(|(k, _)| k.clone())
            .collect();

        if !unload_all {
            info!("leaving {} backend(s) running for the next instance", keys.len());
            return;
        }
        for key in keys {
            if let Err(e) = self.unload(&key).await {
                warn!("unload of {} during shutdown failed: {}", key, e);
            }
        }
    }
}
