//! Legacy TCP transport with XOR framing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use kasa_crypto::xor;
use kasa_types::{DeviceConfig, KasaError};

use crate::base::Transport;

const BLOCK_SIZE: usize = 4;

/// Transport for the original port-9999 protocol. No handshake, no login,
/// one TCP connection reused across sends.
pub struct XorTransport {
    host: String,
    port: u16,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl XorTransport {
    pub const DEFAULT_PORT: u16 = 9999;

    pub fn new(config: Arc<DeviceConfig>) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port_override.unwrap_or(Self::DEFAULT_PORT),
            timeout: config.timeout,
            stream: None,
        }
    }

    async fn connect(&mut self) -> Result<(), KasaError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let address = format!("{}:{}", self.host, self.port);
        let connect = TcpStream::connect(&address);
        let stream = match tokio::time::timeout(self.timeout, connect).await {
            Err(_) => {
                return Err(KasaError::Timeout {
                    host: self.host.clone(),
                    message: format!("connect to port {} timed out", self.port),
                })
            }
            Ok(Err(e)) => {
                // Refused or unreachable hosts are not worth hammering;
                // repeated connect attempts block the whole event loop.
                let fatal = matches!(
                    e.kind(),
                    std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::HostUnreachable
                        | std::io::ErrorKind::NetworkUnreachable
                );
                return Err(KasaError::Connection {
                    host: self.host.clone(),
                    message: e.to_string(),
                    fatal,
                });
            }
            Ok(Ok(stream)) => stream,
        };
        // All writes go out in a single call; buffering would only delay
        // the request or overload the device.
        stream
            .set_nodelay(true)
            .map_err(|e| KasaError::protocol(format!("set_nodelay failed: {e}")))?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn execute_send(&mut self, request: &str) -> Result<Value, KasaError> {
        let stream = self.stream.as_mut().expect("connected stream");
        debug!(host = %self.host, ">> {}", request);

        stream
            .write_all(&xor::encrypt(request))
            .await
            .map_err(|e| KasaError::protocol(e.to_string()))?;

        let mut length_buf = [0u8; BLOCK_SIZE];
        stream
            .read_exact(&mut length_buf)
            .await
            .map_err(|e| KasaError::protocol(e.to_string()))?;
        let length = u32::from_be_bytes(length_buf) as usize;

        let mut buffer = vec![0u8; length];
        stream
            .read_exact(&mut buffer)
            .await
            .map_err(|e| KasaError::protocol(e.to_string()))?;

        let response = xor::decrypt(&buffer)
            .map_err(|_| KasaError::protocol("device sent non-utf8 response"))?;
        debug!(host = %self.host, "<< {}", response);
        serde_json::from_str(&response)
            .map_err(|e| KasaError::protocol(format!("invalid json response: {e}")))
    }

    fn close_without_wait(&mut self) {
        // Dropping the stream closes the socket; nothing is left half-armed
        // for a cancelled task to trip over.
        self.stream = None;
    }
}

#[async_trait]
impl Transport for XorTransport {
    fn default_port(&self) -> u16 {
        Self::DEFAULT_PORT
    }

    fn credentials_hash(&self) -> Option<String> {
        Some(String::new())
    }

    async fn send(&mut self, request: &str) -> Result<Value, KasaError> {
        if let Err(e) = self.connect().await {
            self.close_without_wait();
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, self.execute_send(request)).await {
            Err(_) => {
                self.close_without_wait();
                Err(KasaError::Timeout {
                    host: self.host.clone(),
                    message: "query timed out".into(),
                })
            }
            Ok(Err(e)) => {
                self.close_without_wait();
                // Socket errors mid-exchange are worth one reconnect cycle.
                Err(KasaError::Retryable {
                    message: format!(
                        "unable to query the device {}:{}: {e}",
                        self.host, self.port
                    ),
                    error_code: None,
                })
            }
            Ok(Ok(value)) => Ok(value),
        }
    }

    async fn close(&mut self) {
        self.close_without_wait();
    }

    async fn reset(&mut self) {
        // The connection is the only state there is.
        self.close_without_wait();
    }
}
