//! REST client for the Kubernetes API endpoints the controller uses.
//!
//! [`KubernetesClient`] is the seam the backend and monitor are written
//! against; [`KubernetesApi`] implements it over HTTPS with
//! [`reqwest`], authenticating with the pod's service-account token.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use jobctl_core::config::KubernetesConfig;

use crate::manifest::{JobManifest, JOB_NAME_LABEL};
use crate::pod::{PodList, WatchEvent};

/// Server-side timeout of one watch request. The monitor re-watches
/// from the last resource version when the stream ends.
const WATCH_TIMEOUT_SECS: u32 = 300;

/// A stream of decoded watch events.
pub type WatchStream = BoxStream<'static, Result<WatchEvent, KubeApiError>>;

/// Result of deleting a Job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Errors from the Kubernetes REST layer.
#[derive(Debug, thiserror::Error)]
pub enum KubeApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The API server returned a non-2xx status code.
    #[error("Kubernetes API error ({status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The requested resource version is too old (HTTP 410).
    #[error("Resource version expired")]
    Gone,

    /// A response body could not be decoded.
    #[error("Failed to decode Kubernetes response: {0}")]
    Decode(String),

    /// The client could not be set up from configuration.
    #[error("Kubernetes client configuration error: {0}")]
    Config(String),
}

impl KubeApiError {
    /// 4xx answers: the server understood and refused the request.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Api { status, .. } if (400..500).contains(status))
    }
}

/// The Kubernetes operations the backend and monitor need.
#[async_trait]
pub trait KubernetesClient: Send + Sync {
    /// Create a namespaced Job.
    async fn create_job(&self, manifest: &JobManifest) -> Result<(), KubeApiError>;

    /// Delete a Job and, in the background, its pods.
    async fn delete_job(&self, name: &str) -> Result<DeleteOutcome, KubeApiError>;

    /// List every pod that belongs to a Job.
    async fn list_job_pods(&self) -> Result<PodList, KubeApiError>;

    /// Watch Job pods starting after `resource_version`.
    async fn watch_job_pods(&self, resource_version: &str) -> Result<WatchStream, KubeApiError>;

    /// Full log of one container.
    async fn read_pod_log(&self, pod_name: &str, container: &str) -> Result<String, KubeApiError>;
}

/// HTTP client for one namespace of one cluster.
pub struct KubernetesApi {
    client: reqwest::Client,
    api_url: String,
    namespace: String,
    token: Option<String>,
}

impl KubernetesApi {
    /// Create a client reusing an existing [`reqwest::Client`].
    pub fn new(
        client: reqwest::Client,
        api_url: String,
        namespace: String,
        token: Option<String>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            namespace,
            token,
        }
    }

    /// Build a client from configuration: reads the bearer token and
    /// trusts the cluster CA when the files exist.
    pub async fn from_config(config: &KubernetesConfig) -> Result<Self, KubeApiError> {
        let token = match tokio::fs::read_to_string(&config.token_path).await {
            Ok(token) => Some(token.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    path = %config.token_path.display(),
                    "No service-account token found, calling the API anonymously",
                );
                None
            }
            Err(e) => {
                return Err(KubeApiError::Config(format!(
                    "Failed to read token {}: {e}",
                    config.token_path.display()
                )))
            }
        };

        let mut builder = reqwest::Client::builder();
        if let Some(ca_path) = &config.ca_path {
            match tokio::fs::read(ca_path).await {
                Ok(pem) => {
                    let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                        KubeApiError::Config(format!("Invalid CA bundle {}: {e}", ca_path.display()))
                    })?;
                    builder = builder.add_root_certificate(cert);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(KubeApiError::Config(format!(
                        "Failed to read CA bundle {}: {e}",
                        ca_path.display()
                    )))
                }
            }
        }
        let client = builder.build()?;

        Ok(Self::new(
            client,
            config.api_url.clone(),
            config.namespace.clone(),
            token,
        ))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    // ---- private helpers ----

    fn jobs_url(&self) -> String {
        format!(
            "{}/apis/batch/v1/namespaces/{}/jobs",
            self.api_url, self.namespace
        )
    }

    fn pods_url(&self) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.api_url, self.namespace)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Ensure the response has a success status code. 410 becomes
    /// [`KubeApiError::Gone`].
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, KubeApiError> {
        let status = response.status();
        if status == reqwest::StatusCode::GONE {
            return Err(KubeApiError::Gone);
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(KubeApiError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl KubernetesClient for KubernetesApi {
    async fn create_job(&self, manifest: &JobManifest) -> Result<(), KubeApiError> {
        let response = self
            .authorized(self.client.post(self.jobs_url()))
            .json(manifest)
            .send()
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    async fn delete_job(&self, name: &str) -> Result<DeleteOutcome, KubeApiError> {
        let body = serde_json::json!({
            "kind": "DeleteOptions",
            "apiVersion": "v1",
            "propagationPolicy": "Background",
        });
        let response = self
            .authorized(self.client.delete(format!("{}/{name}", self.jobs_url())))
            .json(&body)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(DeleteOutcome::NotFound);
        }
        Self::ensure_success(response).await?;
        Ok(DeleteOutcome::Deleted)
    }

    async fn list_job_pods(&self) -> Result<PodList, KubeApiError> {
        let response = self
            .authorized(self.client.get(self.pods_url()))
            .query(&[("labelSelector", JOB_NAME_LABEL)])
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| KubeApiError::Decode(e.to_string()))
    }

    async fn watch_job_pods(&self, resource_version: &str) -> Result<WatchStream, KubeApiError> {
        let timeout = WATCH_TIMEOUT_SECS.to_string();
        let response = self
            .authorized(self.client.get(self.pods_url()))
            .query(&[
                ("labelSelector", JOB_NAME_LABEL),
                ("watch", "true"),
                ("allowWatchBookmarks", "true"),
                ("resourceVersion", resource_version),
                ("timeoutSeconds", timeout.as_str()),
            ])
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;
        Ok(decode_watch_lines(response.bytes_stream()))
    }

    async fn read_pod_log(&self, pod_name: &str, container: &str) -> Result<String, KubeApiError> {
        let response = self
            .authorized(self.client.get(format!("{}/{pod_name}/log", self.pods_url())))
            .query(&[("container", container)])
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;
        Ok(response.text().await?)
    }
}

/// Split a chunked body into newline-delimited JSON watch events.
///
/// Chunks may end anywhere, including mid-line. A transport error ends
/// the stream after being yielded once.
pub fn decode_watch_lines<S, B, E>(chunks: S) -> WatchStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<KubeApiError> + Send + 'static,
{
    let state = (Box::pin(chunks), Vec::<u8>::new(), false);
    stream::unfold(state, |(mut chunks, mut buf, mut done)| async move {
        loop {
            if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Some((decode_line(&line), (chunks, buf, done)));
            }
            if done {
                if buf.iter().all(u8::is_ascii_whitespace) {
                    return None;
                }
                let line = std::mem::take(&mut buf);
                return Some((decode_line(&line), (chunks, buf, done)));
            }
            match chunks.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    buf.clear();
                    return Some((Err(e.into()), (chunks, buf, true)));
                }
                None => done = true,
            }
        }
    })
    .boxed()
}

fn decode_line(line: &[u8]) -> Result<WatchEvent, KubeApiError> {
    serde_json::from_slice(line).map_err(|e| KubeApiError::Decode(e.to_string()))
}
