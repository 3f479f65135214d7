//! The HTTP transport capability.
//!
//! The evaluator never talks to `reqwest` directly: it hands a
//! [`TransportRequest`] to whatever [`HttpTransport`] it was given.
//! Production use injects [`ReqwestTransport`]; tests inject scripted
//! stubs. A fired [`CancelToken`] makes the in-flight dispatch return a
//! transport error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use tokio::sync::watch;

/// Opaque transport failure, rendered into `E_RUNTIME_TRANSPORT`.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: Vec<(String, Vec<String>)>,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn dispatch(
        &self,
        req: TransportRequest,
        cancel: &CancelToken,
    ) -> Result<TransportResponse, TransportError>;
}

/// Cooperative cancellation handle built on a watch channel. Clones
/// share the same underlying flag; firing it is idempotent.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        CancelToken { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token fires. Never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // the sender lives inside this token, so this is unreachable in
        // practice; park forever rather than spuriously resolving
        std::future::pending::<()>().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Production transport backed by a shared `reqwest::Client`.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        ReqwestTransport { client: reqwest::Client::new() }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        ReqwestTransport { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn dispatch(
        &self,
        req: TransportRequest,
        cancel: &CancelToken,
    ) -> Result<TransportResponse, TransportError> {
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|err| TransportError(format!("invalid method {}: {err}", req.method)))?;
        let mut builder = self.client.request(method, &req.url);
        if let Some(timeout) = req.timeout {
            builder = builder.timeout(timeout);
        }

        let mut headers = HeaderMap::new();
        for (key, value) in &req.headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                return Err(TransportError(format!("invalid header {key}")));
            };
            headers.insert(name, value);
        }
        builder = builder.headers(headers);
        if let Some(body) = req.body {
            builder = builder.body(body);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(TransportError("request cancelled".to_string()));
            }
            result = builder.send() => {
                result.map_err(|err| TransportError(err.to_string()))?
            }
        };

        let status = response.status().as_u16();
        let mut header_list: Vec<(String, Vec<String>)> = Vec::new();
        for key in response.headers().keys() {
            let values: Vec<String> = response
                .headers()
                .get_all(key)
                .iter()
                .map(|v| v.to_str().unwrap_or_default().to_string())
                .collect();
            header_list.push((key.as_str().to_string(), values));
        }

        let body = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(TransportError("request cancelled".to_string()));
            }
            result = response.bytes() => {
                result.map_err(|err| TransportError(format!("failed to read response: {err}")))?
            }
        };

        Ok(TransportResponse { status, headers: header_list, body: body.to_vec() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_token_fires_once_and_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
        // already-fired token resolves immediately
        clone.cancelled().await;
    }

    #[tokio::test]
    async fn pending_token_resolves_on_cancel() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        token.cancel();
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn dispatch_against_unreachable_host_is_a_transport_error() {
        let transport = ReqwestTransport::new();
        let req = TransportRequest {
            method: "GET".to_string(),
            // reserved TEST-NET-1 address, nothing listens there
            url: "http://192.0.2.1:9/".to_string(),
            headers: Vec::new(),
            body: None,
            timeout: Some(Duration::from_millis(200)),
        };
        let err = transport.dispatch(req, &CancelToken::new()).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn cancelled_token_aborts_dispatch() {
        let transport = ReqwestTransport::new();
        let token = CancelToken::new();
        token.cancel();
        let req = TransportRequest {
            method: "GET".to_string(),
            url: "http://192.0.2.1:9/".to_string(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        };
        let err = transport.dispatch(req, &token).await.unwrap_err();
        assert!(err.0.contains("cancelled"));
    }
}
