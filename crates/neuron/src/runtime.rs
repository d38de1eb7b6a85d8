// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use cache::JsonStore;
use config::NeuronConfig;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::gpu::GpuDetector;
use crate::lifecycle::LifecycleManager;
use crate::os::{ProcessTable, SystemProcessTable};
use crate::proxy::CompatibilityProxy;
use crate::registry::ProcessRegistry;
use crate::{api, shutdown};

/// Everything a handler needs, built once at startup and shared by
/// reference. There is no global state.
pub struct Context {
    pub config: NeuronConfig,
    pub lifecycle: Arc<LifecycleManager>,
    pub registry: Arc<ProcessRegistry>,
    pub gpu: Arc<GpuDetector>,
    pub proxy: CompatibilityProxy,
}

pub type SharedContext = Arc<Context>;

impl Context {
    /// Context over the real OS process table and `nvidia-smi`.
    pub fn build(config: NeuronConfig) -> Result<Self> {
        let store = JsonStore::at(&config.registry.path)?;
        let gpu = GpuDetector::from_config(&config.gpu);
        Ok(Self::from_parts(
            config,
            store,
            Arc::new(SystemProcessTable::new()),
            Arc::new(gpu),
        ))
    }

    /// Context over explicit collaborators.
    pub fn from_parts(
        config: NeuronConfig,
        store: JsonStore,
        table: Arc<dyn ProcessTable>,
        gpu: Arc<GpuDetector>,
    ) -> Self {
        let http = reqwest::Client::new();
        let registry = Arc::new(ProcessRegistry::open(
            store,
            table.clone(),
            config.orphan_executable_name(),
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            config.models.clone(),
            config.backend.clone(),
            registry.clone(),
            gpu.clone(),
            table,
            http.clone(),
        ));
        let proxy = CompatibilityProxy::new(lifecycle.clone(), http);
        Self {
            config,
            lifecycle,
            registry,
            gpu,
            proxy,
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let raw = format!("{}:{}", self.config.server.host, self.config.server.port);
        raw.parse()
            .with_context(|| format!("invalid listen address {raw}"))
    }
}

/// Periodically check for crashed backends, restarting them when
/// `restart_on_crash` is set. None when the interval is disabled.
pub fn spawn_reconciler(ctx: SharedContext) -> Option<JoinHandle<()>> {
    let interval = ctx.config.backend.reconcile_interval()?;
    info!("reconciling every {:?}", interval);
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let restarted = ctx.lifecycle.reconcile().await;
            if !restarted.is_empty() {
                info!("restarted {} backend(s)", restarted.len());
            }
        }
    }))
}

/// Bind the http surface and serve until ctrl-c.
pub async fn spawn_api_server(ctx: SharedContext) -> Result<()> {
    let addr = ctx.listen_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("api listening on {}", addr);
    axum::serve(listener, api::router(ctx))
        .with_graceful_shutdown(shutdown::wait_for_signal())
        .await
        .context("http server failed")?;
    Ok(())
}

/// Run the controller: adopt surviving backends, serve, then shut down.
pub async fn serve(config: NeuronConfig) -> Result<()> {
    for warning in config.validate() {
        warn!("{}", warning);
    }

    let ctx: SharedContext = Arc::new(Context::build(config)?);
    let adopted = ctx.lifecycle.adopt_from_registry();
    info!("adopted {} backend(s) from {}", adopted.len(), ctx.registry.path().display());

    let reconciler = spawn_reconciler(ctx.clone());
    let result = spawn_api_server(ctx.clone()).await;

    if let Some(handle) = reconciler {
        handle.abort();
    }
    info!("shutting down");
    ctx.lifecycle
        .shutdown(ctx.config.server.unload_on_shutdown)
        .await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::fake::FakeProcessTable;
    use crate::testkit::NoInventory;

    #[test]
    fn context_wires_catalog_and_registry() {
        let dir = tempfile::tempdir().unwrap();
        let config = NeuronConfig::from_toml_str(
            r#"
[server]
host = "0.0.0.0"
port = 3900

[backend]
executable_path = "/opt/llama/llama-server"

[[models]]
id = "phi-4"
name = "Phi-4"
path = "/models/phi-4.gguf"
"#,
        )
        .unwrap();
        let store = JsonStore::at(dir.path().join("processes.json")).unwrap();
        let ctx = Context::from_parts(
            config,
            store,
            Arc::new(FakeProcessTable::default()),
            Arc::new(GpuDetector::new(Arc::new(NoInventory), 30)),
        );

        assert_eq!(ctx.listen_addr().unwrap().port(), 3900);
        assert_eq!(ctx.registry.executable_name(), "llama-server");
        assert_eq!(ctx.lifecycle.list_backends().len(), 1);
        assert!(ctx.lifecycle.adopt_from_registry().is_empty());
    }

    #[tokio::test]
    async fn reconciler_is_off_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::at(dir.path().join("processes.json")).unwrap();
        let ctx = Arc::new(Context::from_parts(
            NeuronConfig::default(),
            store,
            Arc::new(FakeProcessTable::default()),
            Arc::new(GpuDetector::new(Arc::new(NoInventory), 30)),
        ));
        assert!(spawn_reconciler(ctx).is_none());
    }
}
