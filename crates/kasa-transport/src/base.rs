//! The common transport interface and shared session plumbing.

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use kasa_types::KasaError;

pub const ONE_DAY_SECONDS: u64 = 86_400;
/// Device clocks drift; sessions are renewed this many seconds early.
pub const SESSION_EXPIRE_BUFFER_SECONDS: u64 = 60 * 20;

/// Per-transport authentication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Initial state, and where any auth error or session expiry lands.
    HandshakeRequired,
    /// AES only: key exchange done, device login outstanding.
    LoginRequired,
    /// Ready to send.
    Established,
}

/// Session lifetime tracking from the device's `TIMEOUT` cookie.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionExpiry {
    expires_at: Option<Instant>,
}

impl SessionExpiry {
    /// Arm the expiry from a device timeout in seconds.
    pub fn arm(&mut self, device_timeout_secs: u64) {
        let lifetime = device_timeout_secs.saturating_sub(SESSION_EXPIRE_BUFFER_SECONDS);
        self.expires_at = Some(Instant::now() + std::time::Duration::from_secs(lifetime));
    }

    pub fn clear(&mut self) {
        self.expires_at = None;
    }

    /// Expired also covers "never armed" so the first send handshakes.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => at <= Instant::now(),
            None => true,
        }
    }
}

/// Common interface over the five wire protocols.
///
/// `send` drives the handshake (and login, where the protocol has one)
/// whenever the transport is not established, then frames, encrypts and
/// posts the request and returns the decrypted, deserialized response.
#[async_trait]
pub trait Transport: Send {
    /// Default port for the transport's scheme.
    fn default_port(&self) -> u16;

    /// Base64 credential material callers may persist instead of plaintext
    /// secrets. `None` where the transport has nothing worth storing.
    fn credentials_hash(&self) -> Option<String>;

    async fn send(&mut self, request: &str) -> Result<Value, KasaError>;

    /// Close the underlying connection and reset internal state.
    async fn close(&mut self);

    /// Reset handshake state without closing the HTTP client.
    async fn reset(&mut self);
}

/// Tagged union over the concrete transports, picked from the device's
/// `ConnectionType`.
pub enum DeviceTransport {
    Xor(crate::xor::XorTransport),
    Klap(crate::klap::KlapTransport),
    Aes(crate::aes::AesTransport),
    Ssl(crate::ssl::SslTransport),
    SslAes(crate::sslaes::SslAesTransport),
    Tpap(crate::tpap::TpapTransport),
}

impl DeviceTransport {
    /// Build the transport matching the config's encryption type.
    pub fn from_config(
        config: std::sync::Arc<kasa_types::DeviceConfig>,
    ) -> Result<Self, KasaError> {
        use kasa_types::EncryptionType;
        let transport = match config.connection_type.encryption_type {
            EncryptionType::Xor => DeviceTransport::Xor(crate::xor::XorTransport::new(config)),
            EncryptionType::Klap => {
                DeviceTransport::Klap(crate::klap::KlapTransport::new(config)?)
            }
            EncryptionType::Aes => DeviceTransport::Aes(crate::aes::AesTransport::new(config)?),
            EncryptionType::Ssl => DeviceTransport::Ssl(crate::ssl::SslTransport::new(config)?),
            EncryptionType::SslAes => {
                DeviceTransport::SslAes(crate::sslaes::SslAesTransport::new(config)?)
            }
            EncryptionType::Tpap => {
                DeviceTransport::Tpap(crate::tpap::TpapTransport::new(config)?)
            }
        };
        Ok(transport)
    }
}

#[async_trait]
impl Transport for DeviceTransport {
    fn default_port(&self) -> u16 {
        match self {
            DeviceTransport::Xor(t) => t.default_port(),
            DeviceTransport::Klap(t) => t.default_port(),
            DeviceTransport::Aes(t) => t.default_port(),
            DeviceTransport::Ssl(t) => t.default_port(),
            DeviceTransport::SslAes(t) => t.default_port(),
            DeviceTransport::Tpap(t) => t.default_port(),
        }
    }

    fn credentials_hash(&self) -> Option<String> {
        match self {
            DeviceTransport::Xor(t) => t.credentials_hash(),
            DeviceTransport::Klap(t) => t.credentials_hash(),
            DeviceTransport::Aes(t) => t.credentials_hash(),
            DeviceTransport::Ssl(t) => t.credentials_hash(),
            DeviceTransport::SslAes(t) => t.credentials_hash(),
            DeviceTransport::Tpap(t) => t.credentials_hash(),
        }
    }

    async fn send(&mut self, request: &str) -> Result<Value, KasaError> {
        match self {
            DeviceTransport::Xor(t) => t.send(request).await,
            DeviceTransport::Klap(t) => t.send(request).await,
            DeviceTransport::Aes(t) => t.send(request).await,
            DeviceTransport::Ssl(t) => t.send(request).await,
            DeviceTransport::SslAes(t) => t.send(request).await,
            DeviceTransport::Tpap(t) => t.send(request).await,
        }
    }

    async fn close(&mut self) {
        match self {
            DeviceTransport::Xor(t) => t.close().await,
            DeviceTransport::Klap(t) => t.close().await,
            DeviceTransport::Aes(t) => t.close().await,
            DeviceTransport::Ssl(t) => t.close().await,
            DeviceTransport::SslAes(t) => t.close().await,
            DeviceTransport::Tpap(t) => t.close().await,
        }
    }

    async fn reset(&mut self) {
        match self {
            DeviceTransport::Xor(t) => t.reset().await,
            DeviceTransport::Klap(t) => t.reset().await,
            DeviceTransport::Aes(t) => t.reset().await,
            DeviceTransport::Ssl(t) => t.reset().await,
            DeviceTransport::SslAes(t) => t.reset().await,
            DeviceTransport::Tpap(t) => t.reset().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_defaults_to_expired() {
        let expiry = SessionExpiry::default();
        assert!(expiry.is_expired());
    }

    #[test]
    fn test_armed_expiry_outlives_buffer() {
        let mut expiry = SessionExpiry::default();
        expiry.arm(ONE_DAY_SECONDS);
        assert!(!expiry.is_expired());
        expiry.clear();
        assert!(expiry.is_expired());
    }

    #[test]
    fn test_short_device_timeout_expires_immediately() {
        // A timeout inside the renewal buffer means handshake every send.
        let mut expiry = SessionExpiry::default();
        expiry.arm(60);
        assert!(expiry.is_expired());
    }
}
