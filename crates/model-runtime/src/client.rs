// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::native::{
    ChatCompletionRequest, ChatCompletionResponse, CompletionRequest, CompletionResponse,
};
use crate::RuntimeError;

/// Raw response body of a streaming backend call.
pub type ByteStream = BoxStream<'static, Result<Bytes, RuntimeError>>;

/// Operations the proxy needs from a running backend.
#[async_trait]
pub trait NativeBackend: Send + Sync {
    async fn completion(&self, request: &CompletionRequest)
        -> Result<CompletionResponse, RuntimeError>;

    async fn completion_stream(&self, request: &CompletionRequest)
        -> Result<ByteStream, RuntimeError>;

    async fn chat(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, RuntimeError>;

    async fn chat_stream(&self, request: &ChatCompletionRequest)
        -> Result<ByteStream, RuntimeError>;

    /// Bounded probe of the health endpoint. Never errors: any failure is
    /// reported as unhealthy.
    async fn health(&self, path: &str, timeout: Duration) -> bool;
}

/// [`NativeBackend`] over http, for one backend base url
/// (e.g. `http://127.0.0.1:8081`).
///
/// Cheap to construct per request: the underlying `reqwest::Client` is a
/// shared connection pool.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn with_client<S: Into<String>>(client: reqwest::Client, base_url: S) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, RuntimeError> {
        let url = self.url(path);
        debug!("POST {}", url);
        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RuntimeError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, RuntimeError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.post(path, body).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn post_stream<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ByteStream, RuntimeError> {
        let response = self.post(path, body).await?;
        Ok(response.bytes_stream().map_err(RuntimeError::from).boxed())
    }
}

#[async_trait]
impl NativeBackend for HttpBackend {
    async fn completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, RuntimeError> {
        self.post_json("/completion", request).await
    }

    async fn completion_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<ByteStream, RuntimeError> {
        self.post_stream("/completion", request).await
    }

    async fn chat(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, RuntimeError> {
        self.post_json("/v1/chat/completions", request).await
    }

    async fn chat_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ByteStream, RuntimeError> {
        self.post_stream("/v1/chat/completions", request).await
    }

    async fn health(&self, path: &str, timeout: Duration) -> bool {
        let url = self.url(path);
        match self.client.get(&url).timeout(timeout).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("health probe {} failed: {}", url, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Consume headers and a content-length body so closing the socket does
    /// not reset the connection under the client.
    async fn read_request(sock: &mut tokio::net::TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let Ok(n) = sock.read(&mut chunk).await else {
                return;
            };
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let len = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + len {
                return;
            }
        }
    }

    /// Serves `response` verbatim to every connection.
    async fn stub(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    read_request(&mut sock).await;
                    let _ = sock.write_all(response.as_bytes()).await;
                    let _ = sock.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    #[test]
    fn urls_join_without_double_slashes() {
        let backend = HttpBackend::with_client(reqwest::Client::new(), "http://127.0.0.1:8081/");
        assert_eq!(backend.base_url(), "http://127.0.0.1:8081");
        assert_eq!(backend.url("/health"), "http://127.0.0.1:8081/health");
        assert_eq!(backend.url("health"), "http://127.0.0.1:8081/health");
    }

    #[tokio::test]
    async fn health_is_false_when_nothing_listens() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let backend = HttpBackend::with_client(reqwest::Client::new(), format!("http://127.0.0.1:{port}"));
        assert!(!backend.health("/health", Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn health_is_true_on_200() {
        let url = stub("HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok").await;
        assert!(HttpBackend::with_client(reqwest::Client::new(), url).health("/health", Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn non_success_status_is_upstream_error() {
        let url = stub(
            "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 7\r\nconnection: close\r\n\r\nloading",
        )
        .await;
        let err = HttpBackend::with_client(reqwest::Client::new(), url)
            .completion(&CompletionRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Upstream { status: 503, .. }));
        assert!(err.to_string().contains("loading"));
    }

    #[tokio::test]
    async fn buffered_completion_decodes_body() {
        let url = stub(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 31\r\nconnection: close\r\n\r\n{\"content\":\"hello\",\"stop\":true}",
        )
        .await;
        let resp = HttpBackend::with_client(reqwest::Client::new(), url)
            .completion(&CompletionRequest::default())
            .await
            .unwrap();
        assert_eq!(resp.content, "hello");
        assert!(resp.stop);
    }
}
