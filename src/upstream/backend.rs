use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::HeaderMap;
use std::time::Duration;

use crate::error::GatewayError;

/// Outbound request handed to the backend, already carrying the injected
/// trace headers.
#[derive(Debug)]
pub struct BackendRequest {
    pub method: String,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug)]
pub struct BackendResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The backend fleet as the core sees it: one call, one deadline.
///
/// Connection pooling, TLS, and retries live behind this seam; the core
/// only requires that a call either resolves or fails within the
/// configured deadline.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn call(&self, req: BackendRequest) -> Result<BackendResponse, GatewayError>;

    /// Target description for stats endpoints.
    fn describe(&self) -> String;
}

/// reqwest-based backend client with a per-call deadline.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Config(format!("backend client build failed: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn call(&self, req: BackendRequest) -> Result<BackendResponse, GatewayError> {
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|_| GatewayError::Backend(format!("invalid method {}", req.method)))?;
        let url = format!("{}{}", self.base_url, req.path_and_query);

        let mut headers = req.headers;
        // Hop-by-hop and recomputed headers never cross the proxy boundary.
        for name in [HOST, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING] {
            headers.remove(name);
        }

        let response = self
            .client
            .request(method, url)
            .headers(headers)
            .body(req.body.to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Backend("backend timeout".to_string())
                } else if e.is_connect() {
                    GatewayError::Backend(format!("backend connect error: {e}"))
                } else {
                    GatewayError::Backend(format!("backend request error: {e}"))
                }
            })?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Backend(format!("backend body error: {e}")))?;

        Ok(BackendResponse {
            status,
            headers,
            body,
        })
    }

    fn describe(&self) -> String {
        self.base_url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let backend = HttpBackend::new("http://127.0.0.1:9000/", Duration::from_secs(1)).unwrap();
        assert_eq!(backend.describe(), "http://127.0.0.1:9000");
    }

    #[tokio::test]
    async fn test_unreachable_backend_surfaces_backend_error() {
        let backend = HttpBackend::new("http://127.0.0.1:1", Duration::from_millis(300)).unwrap();
        let err = backend
            .call(BackendRequest {
                method: "GET".into(),
                path_and_query: "/v1".into(),
                headers: HeaderMap::new(),
                body: Bytes::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Backend(_)));
    }
}
