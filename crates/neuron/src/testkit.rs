// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Shared fixtures for proxy and http surface tests: a lifecycle manager
//! over a fake process table, and a canned-response backend.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use cache::JsonStore;
use chrono::Utc;
use config::BackendSettings;
use protocol::{BackendDescriptor, BackendMetadata, LaunchParameters, ResourceKey};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::gpu::{GpuDetector, InventoryTool};
use crate::lifecycle::LifecycleManager;
use crate::os::fake::FakeProcessTable;
use crate::registry::{EntryStatus, ProcessRegistry, RegistryEntry};

pub struct NoInventory;

#[async_trait]
impl InventoryTool for NoInventory {
    async fn query(&self) -> anyhow::Result<String> {
        anyhow::bail!("nvidia-smi not installed")
    }
}

pub struct Kit {
    pub manager: Arc<LifecycleManager>,
    pub registry: Arc<ProcessRegistry>,
    pub table: Arc<FakeProcessTable>,
    pub gpu: Arc<GpuDetector>,
    dir: tempfile::TempDir,
}

impl Kit {
    /// Catalog of `phi-4` (with metadata) and `qwen` (bare), nothing running.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("models");
        std::fs::create_dir_all(&weights).unwrap();

        let catalog = vec![
            BackendDescriptor {
                id: "phi-4".into(),
                name: "Phi-4".into(),
                path: weights.join("phi-4.gguf"),
                parameters: LaunchParameters {
                    n_ctx: Some(4096),
                    n_gpu_layers: Some(-1),
                    ..Default::default()
                },
                metadata: BackendMetadata {
                    family: "phi".into(),
                    parameter_count: "14B".into(),
                    quantization: "Q4_K_M".into(),
                    description: "Microsoft Phi-4".into(),
                },
            },
            BackendDescriptor {
                id: "qwen".into(),
                name: "Qwen 2.5".into(),
                path: weights.join("qwen.gguf"),
                parameters: Default::default(),
                metadata: Default::default(),
            },
        ];

        let table = Arc::new(FakeProcessTable::default());
        let store = JsonStore::at(dir.path().join("processes.json")).unwrap();
        let registry = Arc::new(ProcessRegistry::open(store, table.clone(), "llama-server"));
        let gpu = Arc::new(GpuDetector::new(Arc::new(NoInventory), 1000));
        let settings = BackendSettings {
            executable_path: PathBuf::from("/nonexistent/llama-server"),
            stop_timeout_secs: 1,
            switch_settle_ms: 0,
            health_timeout_secs: 1,
            ..Default::default()
        };
        let manager = Arc::new(LifecycleManager::new(
            catalog,
            settings,
            registry.clone(),
            gpu.clone(),
            table.clone(),
            reqwest::Client::new(),
        ));
        Self {
            manager,
            registry,
            table,
            gpu,
            dir,
        }
    }

    pub fn weights_dir(&self) -> PathBuf {
        self.dir.path().join("models")
    }

    /// Pretend a previous instance left `phi-4` (key "0") or `qwen`
    /// (other keys) running as `pid` on `port`, then adopt it.
    pub fn adopt(&self, key: &str, pid: u32, port: u16) {
        let key = ResourceKey::parse(key).unwrap();
        let (id, name) = if key.to_string() == "0" {
            ("phi-4", "Phi-4")
        } else {
            ("qwen", "Qwen 2.5")
        };
        self.table
            .procs
            .lock()
            .unwrap()
            .insert(pid, "llama-server".to_string());
        self.registry
            .register(RegistryEntry {
                resource_key: key.clone(),
                pid,
                backend_id: id.into(),
                backend_name: name.into(),
                weights_path: self.weights_dir().join(format!("{id}.gguf")),
                port,
                started_at: Utc::now(),
                command_line: format!("llama-server -m {id}.gguf"),
                status: EntryStatus::Running,
            })
            .unwrap();
        assert!(self.manager.adopt_from_registry().contains(&key));
    }
}

/// Canned answer for one request path.
pub struct Route {
    path: &'static str,
    status: u16,
    content_type: &'static str,
    body: String,
}

impl Route {
    pub fn json(path: &'static str, status: u16, body: &str) -> Self {
        Self {
            path,
            status,
            content_type: "application/json",
            body: body.to_string(),
        }
    }

    pub fn sse(path: &'static str, body: &str) -> Self {
        Self {
            path,
            status: 200,
            content_type: "text/event-stream",
            body: body.to_string(),
        }
    }
}

/// Read a whole request (headers plus content-length body), returning the
/// request path.
async fn read_request(sock: &mut tokio::net::TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        match sock.read(&mut chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let length = head
        .lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + length {
        match sock.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    head.split_whitespace().nth(1).map(str::to_string)
}

/// Backend stand-in answering each route with its canned response and
/// everything else with 404. Returns the port.
pub async fn backend_stub(routes: Vec<Route>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let routes = Arc::new(routes);
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            let routes = routes.clone();
            tokio::spawn(async move {
                let Some(path) = read_request(&mut sock).await else {
                    return;
                };
                let reply = match routes.iter().find(|r| r.path == path) {
                    Some(r) => format!(
                        "HTTP/1.1 {} X\r\ncontent-type: {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        r.status,
                        r.content_type,
                        r.body.len(),
                        r.body
                    ),
                    None => "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                        .to_string(),
                };
                let _ = sock.write_all(reply.as_bytes()).await;
                let _ = sock.shutdown().await;
            });
        }
    });
    port
}
