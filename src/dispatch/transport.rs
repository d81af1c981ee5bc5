//! Transport Boundary
//!
//! The router never touches sockets itself; it hands a `Request` to a `Transport` together
//! with a deadline and gets back a `ResponseEnvelope` or a connection-level failure.
//! `HttpTransport` is the production implementation, posting JSON over HTTP with `reqwest`.

use async_trait::async_trait;
use std::time::Duration;

use super::protocol::{ENDPOINT_REQUEST, Request, ResponseEnvelope};
use crate::topology::types::Address;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("deadline exceeded")]
    Timeout,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_request(
        &self,
        address: &Address,
        request: &Request,
        deadline: Duration,
    ) -> Result<ResponseEnvelope, TransportError>;
}

pub struct HttpTransport {
    http_client: reqwest::Client,
    base_path: String,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::new_with_base("")
    }

    pub fn new_with_base(base_path: &str) -> Self {
        let cleaned = base_path.trim_end_matches('/');
        let base_path = if cleaned.is_empty() {
            String::new()
        } else if cleaned.starts_with('/') {
            cleaned.to_string()
        } else {
            format!("/{}", cleaned)
        };

        Self {
            http_client: reqwest::Client::new(),
            base_path,
        }
    }

    fn url(&self, address: &Address) -> String {
        format!("http://{}{}{}", address, self.base_path, ENDPOINT_REQUEST)
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_request(
        &self,
        address: &Address,
        request: &Request,
        deadline: Duration,
    ) -> Result<ResponseEnvelope, TransportError> {
        let response = self
            .http_client
            .post(self.url(address))
            .json(request)
            .timeout(deadline)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if !response.status().is_success() {
            return Err(TransportError::Unreachable(format!(
                "server answered {}",
                response.status()
            )));
        }

        response.json().await.map_err(map_reqwest_error)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Unreachable(e.to_string())
    }
}
