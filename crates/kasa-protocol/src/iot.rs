//! The legacy IOT protocol: the caller's tree-shaped query goes out as-is.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use kasa_transport::Transport;
use kasa_types::KasaError;

const BACKOFF_SECONDS_AFTER_TIMEOUT: u64 = 1;

/// Protocol for devices speaking the original tree-shaped JSON, over the
/// XOR or KLAP transports.
pub struct IotProtocol<T: Transport> {
    host: String,
    transport: Mutex<T>,
}

impl<T: Transport> IotProtocol<T> {
    pub fn new(host: impl Into<String>, transport: T) -> Self {
        Self {
            host: host.into(),
            transport: Mutex::new(transport),
        }
    }

    pub async fn credentials_hash(&self) -> Option<String> {
        self.transport.lock().await.credentials_hash()
    }

    /// Query the device, retrying per the error-class policy.
    pub async fn query(&self, request: &Value, retry_count: usize) -> Result<Value, KasaError> {
        let request = match request {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };

        let mut transport = self.transport.lock().await;
        for retry in 0..=retry_count {
            let err = match transport.send(&request).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if err.is_authentication() {
                debug!(host = %self.host, "unable to authenticate, not retrying");
                return Err(err);
            }
            if !err.is_retryable() {
                transport.close().await;
                debug!(host = %self.host, "unable to query the device, not retrying: {}", err);
                return Err(err);
            }
            if retry >= retry_count {
                transport.close().await;
                debug!(host = %self.host, "giving up after {} retries", retry);
                return Err(err);
            }
            if matches!(
                err,
                KasaError::Timeout { .. } | KasaError::DeviceTimeout { .. }
            ) {
                tokio::time::sleep(Duration::from_secs(BACKOFF_SECONDS_AFTER_TIMEOUT)).await;
            }
        }
        unreachable!("retry loop always returns")
    }

    pub async fn close(&self) {
        self.transport.lock().await.close().await;
    }
}
