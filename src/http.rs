//! HTTP transport for neighbor messages, backed by `reqwest`.

use crate::error::TransportError;
use crate::transport::RemoteRegionTransport;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RemoteRegionTransport for HttpTransport {
    async fn post_json(
        &self,
        url: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        let resp = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let body: Bytes = resp.bytes().await.map_err(classify)?;
        if body.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(&body).map_err(|e| TransportError::MalformedResponse(e.to_string()))
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(e.to_string())
    }
}
