// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Ollama-compatible front for running backends.
//!
//! Stateless: every request resolves its backend from the lifecycle
//! manager's running keys, translates the request into the backend's native
//! shape, forwards it, and translates the answer back.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use model_runtime::ollama::{
    ChatRequest, ChatResponse, GenerateRequest, GenerateResponse, ModelDetails, ModelInfo,
    ProcessResponse, RunningModel, ShowRequest, ShowResponse, TagsResponse, VersionResponse,
};
use model_runtime::stream::{reframe, ChatReframer, GenerateReframer};
use model_runtime::{translate, HttpBackend, NativeBackend, RuntimeError};
use protocol::{BackendDescriptor, BackendMetadata, ResourceKey};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::lifecycle::LifecycleManager;
use crate::registry::EntryStatus;

/// Version reported on `/api/version`.
pub const COMPAT_VERSION: &str = concat!("0.1.0-neuron-", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no running backend serves model {0:?}")]
    NoBackendBound(String),

    #[error("model {0:?} not found")]
    NotFound(String),

    #[error("{0}")]
    NotSupported(&'static str),

    /// The backend answered with a failure status; relayed as-is.
    #[error("backend returned status {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("backend request failed: {0}")]
    Transport(String),
}

impl From<RuntimeError> for ProxyError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Upstream { status, body } => ProxyError::Upstream { status, body },
            other => ProxyError::Transport(other.to_string()),
        }
    }
}

/// A translated answer: one object, or an NDJSON body relayed as it arrives.
pub enum Reply<T> {
    Full(T),
    Stream(BoxStream<'static, Bytes>),
}

pub struct CompatibilityProxy {
    lifecycle: Arc<LifecycleManager>,
    http: reqwest::Client,
}

impl CompatibilityProxy {
    pub fn new(lifecycle: Arc<LifecycleManager>, http: reqwest::Client) -> Self {
        Self { lifecycle, http }
    }

    /// First running key, in canonical order, whose backend matches `model`
    /// (an ollama `:tag` suffix is ignored).
    fn resolve(&self, model: &str) -> Result<(ResourceKey, HttpBackend), ProxyError> {
        self.lifecycle
            .running()
            .into_iter()
            .find(|(_, active)| active.descriptor.matches_name(model))
            .map(|(key, active)| {
                debug!("{} -> {} ({})", model, key, active.base_url());
                (key, HttpBackend::with_client(self.http.clone(), active.base_url()))
            })
            .ok_or_else(|| ProxyError::NoBackendBound(model.to_string()))
    }

    pub async fn generate(
        &self,
        request: GenerateRequest,
    ) -> Result<Reply<GenerateResponse>, ProxyError> {
        let (key, backend) = self.resolve(&request.model)?;
        let native = translate::generate_to_native(&request);
        info!("generate model={} key={} stream={}", request.model, key, native.stream);

        if native.stream {
            let upstream = backend.completion_stream(&native).await?;
            return Ok(Reply::Stream(reframe(
                upstream,
                GenerateReframer::new(request.model),
            )));
        }
        let response = backend.completion(&native).await?;
        Ok(Reply::Full(translate::completion_to_generate(
            &request.model,
            &response,
        )))
    }

    pub async fn chat(&self, request: ChatRequest) -> Result<Reply<ChatResponse>, ProxyError> {
        let (key, backend) = self.resolve(&request.model)?;
        let native = translate::chat_to_native(&request);
        info!(
            "chat model={} key={} messages={} stream={}",
            request.model,
            key,
            native.messages.len(),
            native.stream
        );

        if native.stream {
            let upstream = backend.chat_stream(&native).await?;
            return Ok(Reply::Stream(reframe(upstream, ChatReframer::new(request.model))));
        }
        let response = backend.chat(&native).await?;
        Ok(Reply::Full(translate::chat_completion_to_chat(
            &request.model,
            &response,
        )))
    }

    /// The configured catalog, whether loaded or not.
    pub fn tags(&self) -> TagsResponse {
        let models = self
            .lifecycle
            .catalog()
            .iter()
            .map(|d| {
                let (size, modified) = weights_file(&d.path);
                ModelInfo {
                    name: d.id.clone(),
                    model: d.id.clone(),
                    modified_at: modified.unwrap_or_else(translate::created_at),
                    size,
                    digest: digest(&d.id),
                    details: details(&d.metadata),
                }
            })
            .collect();
        TagsResponse { models }
    }

    pub fn show(&self, request: &ShowRequest) -> Result<ShowResponse, ProxyError> {
        let descriptor = self
            .find_descriptor(&request.name)
            .ok_or_else(|| ProxyError::NotFound(request.name.clone()))?;

        let parameters = descriptor
            .parameters
            .listing()
            .into_iter()
            .map(|(name, value)| format!("{name} {value}"))
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ShowResponse {
            modelfile: format!("FROM {}\n", descriptor.path.display()),
            parameters,
            template: String::new(),
            details: details(&descriptor.metadata),
            model_info: None,
        })
    }

    /// Registry entries that are running, joined with the catalog.
    pub fn ps(&self) -> ProcessResponse {
        let models = self
            .lifecycle
            .registry()
            .entries()
            .into_iter()
            .filter(|e| e.status == EntryStatus::Running)
            .map(|entry| {
                let metadata = self
                    .lifecycle
                    .descriptor(&entry.backend_id)
                    .map(|d| d.metadata.clone())
                    .unwrap_or_default();
                let (size, _) = weights_file(&entry.weights_path);
                RunningModel {
                    name: entry.backend_id.clone(),
                    model: entry.backend_id.clone(),
                    size,
                    digest: digest(&entry.backend_id),
                    details: details(&metadata),
                    expires_at: translate::created_at(),
                    size_vram: 0,
                }
            })
            .collect();
        ProcessResponse { models }
    }

    /// Weights are never managed here, so deletion always fails.
    pub fn delete(&self, model: &str) -> Result<(), ProxyError> {
        warn!("refusing to delete model {}", model);
        Err(ProxyError::NotSupported(
            "model deletion is not supported; weights files are managed outside this service",
        ))
    }

    pub fn version(&self) -> VersionResponse {
        VersionResponse {
            version: COMPAT_VERSION.to_string(),
        }
    }

    fn find_descriptor(&self, name: &str) -> Option<&BackendDescriptor> {
        self.lifecycle.catalog().iter().find(|d| d.matches_name(name))
    }
}

fn digest(id: &str) -> String {
    format!("sha256:{id}")
}

fn or_unknown(value: &str) -> String {
    if value.is_empty() {
        "unknown".to_string()
    } else {
        value.to_string()
    }
}

fn details(metadata: &BackendMetadata) -> ModelDetails {
    ModelDetails {
        format: "gguf".to_string(),
        family: or_unknown(&metadata.family),
        families: None,
        parameter_size: or_unknown(&metadata.parameter_count),
        quantization_level: or_unknown(&metadata.quantization),
    }
}

/// Size and mtime of a weights file; zero and none when it is missing.
fn weights_file(path: &Path) -> (u64, Option<String>) {
    match std::fs::metadata(path) {
        Ok(meta) => {
            let modified = meta
                .modified()
                .ok()
                .map(|t| DateTime::<Utc>::from(t).to_rfc3339_opts(chrono::SecondsFormat::Millis, true));
            (meta.len(), modified)
        }
        Err(_) => (0, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{self, Route};
    use futures::StreamExt;
    use model_runtime::ollama::ChatMessage;
    use serde_json::Value;

    #[tokio::test]
    async fn unbound_model_is_rejected() {
        let kit = testkit::Kit::new();
        let proxy = CompatibilityProxy::new(kit.manager.clone(), reqwest::Client::new());
        let err = proxy
            .generate(GenerateRequest {
                model: "phi-4".into(),
                prompt: "hi".into(),
                ..Default::default()
            })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProxyError::NoBackendBound(m) if m == "phi-4"));
    }

    #[tokio::test]
    async fn buffered_generate_translates_timings() {
        let port = testkit::backend_stub(vec![Route::json(
            "/completion",
            200,
            r#"{"content":"Hello!","stop":true,"stop_type":"limit","timings":{"prompt_n":4,"prompt_ms":1.5,"predicted_n":2,"predicted_ms":2.0}}"#,
        )])
        .await;
        let kit = testkit::Kit::new();
        kit.adopt("0", 4242, port);
        let proxy = CompatibilityProxy::new(kit.manager.clone(), reqwest::Client::new());

        let reply = proxy
            .generate(GenerateRequest {
                model: "phi-4:latest".into(),
                prompt: "hi".into(),
                stream: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        let Reply::Full(resp) = reply else {
            panic!("expected a buffered reply");
        };
        assert_eq!(resp.model, "phi-4:latest");
        assert_eq!(resp.response, "Hello!");
        assert!(resp.done);
        assert_eq!(resp.done_reason.as_deref(), Some("length"));
        assert_eq!(resp.metrics.prompt_eval_count, Some(4));
        assert_eq!(resp.metrics.eval_count, Some(2));
        assert_eq!(resp.metrics.prompt_eval_duration, Some(1_500_000));
        assert_eq!(resp.metrics.total_duration, Some(3_500_000));
    }

    #[tokio::test]
    async fn streamed_chat_ends_with_single_terminal_line() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2}}\n\n",
            "data: [DONE]\n\n",
        );
        let port = testkit::backend_stub(vec![Route::sse("/v1/chat/completions", body)]).await;
        let kit = testkit::Kit::new();
        kit.adopt("1", 4343, port);
        let proxy = CompatibilityProxy::new(kit.manager.clone(), reqwest::Client::new());

        let reply = proxy
            .chat(ChatRequest {
                model: "qwen".into(),
                messages: vec![ChatMessage {
                    role: "user".into(),
                    content: "hi".into(),
                    images: None,
                }],
                ..Default::default()
            })
            .await
            .unwrap();
        let Reply::Stream(stream) = reply else {
            panic!("expected a stream");
        };
        let lines: Vec<Value> = stream
            .map(|b| serde_json::from_slice::<Value>(&b).unwrap())
            .collect()
            .await;

        let done: Vec<&Value> = lines.iter().filter(|l| l["done"] == true).collect();
        assert_eq!(done.len(), 1);
        assert_eq!(lines.last().unwrap()["done"], true);
        assert_eq!(lines.last().unwrap()["eval_count"], 2);
        let text: String = lines
            .iter()
            .filter_map(|l| l["message"]["content"].as_str())
            .collect();
        assert_eq!(text, "Hello");
    }

    #[tokio::test]
    async fn upstream_failure_status_is_relayed() {
        let port = testkit::backend_stub(vec![Route::json(
            "/completion",
            503,
            r#"{"error":{"message":"Loading model"}}"#,
        )])
        .await;
        let kit = testkit::Kit::new();
        kit.adopt("0", 4242, port);
        let proxy = CompatibilityProxy::new(kit.manager.clone(), reqwest::Client::new());

        let err = proxy
            .generate(GenerateRequest {
                model: "phi-4".into(),
                stream: Some(false),
                ..Default::default()
            })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProxyError::Upstream { status: 503, .. }));
    }

    #[test]
    fn catalog_endpoints_describe_configured_models() {
        let kit = testkit::Kit::new();
        std::fs::write(kit.weights_dir().join("phi-4.gguf"), b"0123456789").unwrap();
        let proxy = CompatibilityProxy::new(kit.manager.clone(), reqwest::Client::new());

        let tags = proxy.tags();
        assert_eq!(tags.models.len(), 2);
        assert_eq!(tags.models[0].name, "phi-4");
        assert_eq!(tags.models[0].size, 10);
        assert_eq!(tags.models[0].digest, "sha256:phi-4");
        assert_eq!(tags.models[0].details.family, "phi");
        assert_eq!(tags.models[1].size, 0);
        assert_eq!(tags.models[1].details.family, "unknown");

        let show = proxy
            .show(&ShowRequest {
                name: "phi-4:latest".into(),
            })
            .unwrap();
        assert!(show.modelfile.starts_with("FROM "));
        assert!(show.parameters.contains("n_ctx 4096"));

        let missing = proxy.show(&ShowRequest { name: "nope".into() });
        assert!(matches!(missing, Err(ProxyError::NotFound(_))));
        assert!(matches!(proxy.delete("phi-4"), Err(ProxyError::NotSupported(_))));
        assert!(proxy.version().version.starts_with("0.1.0"));
    }

    #[test]
    fn ps_lists_running_registry_entries() {
        let kit = testkit::Kit::new();
        let proxy = CompatibilityProxy::new(kit.manager.clone(), reqwest::Client::new());
        assert!(proxy.ps().models.is_empty());

        kit.adopt("0", 4242, 1);
        let ps = proxy.ps();
        assert_eq!(ps.models.len(), 1);
        assert_eq!(ps.models[0].name, "phi-4");
        assert_eq!(ps.models[0].details.parameter_size, "14B");
    }
}
