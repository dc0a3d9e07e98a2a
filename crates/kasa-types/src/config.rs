//! Immutable device configuration shared across transports.

use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::credentials::Credentials;

/// Device family as reported by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceFamily {
    #[serde(rename = "IOT.SMARTPLUGSWITCH")]
    IotSmartPlugSwitch,
    #[serde(rename = "IOT.SMARTBULB")]
    IotSmartBulb,
    #[serde(rename = "SMART.KASAPLUG")]
    SmartKasaPlug,
    #[serde(rename = "SMART.KASASWITCH")]
    SmartKasaSwitch,
    #[serde(rename = "SMART.KASAHUB")]
    SmartKasaHub,
    #[serde(rename = "SMART.TAPOPLUG")]
    SmartTapoPlug,
    #[serde(rename = "SMART.TAPOBULB")]
    SmartTapoBulb,
    #[serde(rename = "SMART.TAPOSWITCH")]
    SmartTapoSwitch,
    #[serde(rename = "SMART.TAPOHUB")]
    SmartTapoHub,
    #[serde(rename = "SMART.IPCAMERA")]
    SmartIpCamera,
    #[serde(rename = "SMART.TAPOROBOVAC")]
    SmartTapoRobovac,
}

impl DeviceFamily {
    /// The default-credentials table key for this family.
    pub fn default_credentials_key(self) -> &'static str {
        match self {
            DeviceFamily::IotSmartPlugSwitch
            | DeviceFamily::IotSmartBulb
            | DeviceFamily::SmartKasaPlug
            | DeviceFamily::SmartKasaSwitch
            | DeviceFamily::SmartKasaHub => "KASA",
            DeviceFamily::SmartTapoPlug
            | DeviceFamily::SmartTapoBulb
            | DeviceFamily::SmartTapoSwitch
            | DeviceFamily::SmartTapoHub => "TAPO",
            DeviceFamily::SmartIpCamera | DeviceFamily::SmartTapoRobovac => "TAPOCAMERA",
        }
    }
}

/// Encryption scheme spoken by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EncryptionType {
    Xor,
    Klap,
    Aes,
    Ssl,
    SslAes,
    Tpap,
}

/// How to reach and authenticate with a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionType {
    pub device_family: DeviceFamily,
    pub encryption_type: EncryptionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_version: Option<u8>,
    #[serde(default)]
    pub https: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
}

impl ConnectionType {
    pub fn new(device_family: DeviceFamily, encryption_type: EncryptionType) -> Self {
        Self {
            device_family,
            encryption_type,
            login_version: None,
            https: false,
            http_port: None,
        }
    }

    pub fn with_login_version(mut self, version: u8) -> Self {
        self.login_version = Some(version);
        self
    }
}

/// Cached RSA key material, DER bytes base64-wrapped for persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPairData {
    pub private: String,
    pub public: String,
}

/// Immutable configuration for one device.
///
/// Shared as `Arc<DeviceConfig>` between the protocol and its transport;
/// transports keep only derived state. The RSA key pair cache is the one
/// mutable slot, single-initialized on first handshake so later handshakes
/// (and persisted configs) can reuse the pair.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_override: Option<u16>,
    #[serde(default = "DeviceConfig::default_timeout", with = "serde_secs")]
    pub timeout: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_hash: Option<String>,
    pub connection_type: ConnectionType,
    #[serde(skip)]
    aes_keys: OnceLock<KeyPairData>,
}

mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(de)?))
    }
}

impl DeviceConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    fn default_timeout() -> Duration {
        Self::DEFAULT_TIMEOUT
    }

    pub fn new(host: impl Into<String>, connection_type: ConnectionType) -> Self {
        Self {
            host: host.into(),
            port_override: None,
            timeout: Self::DEFAULT_TIMEOUT,
            credentials: None,
            credentials_hash: None,
            connection_type,
            aes_keys: OnceLock::new(),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_credentials_hash(mut self, hash: impl Into<String>) -> Self {
        self.credentials_hash = Some(hash.into());
        self
    }

    pub fn with_port_override(mut self, port: u16) -> Self {
        self.port_override = Some(port);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_aes_keys(self, keys: KeyPairData) -> Self {
        let _ = self.aes_keys.set(keys);
        self
    }

    /// Cached RSA key pair, if one was generated or persisted.
    pub fn aes_keys(&self) -> Option<&KeyPairData> {
        self.aes_keys.get()
    }

    /// Store a freshly generated key pair. First writer wins; the stored
    /// pair is returned so concurrent handshakes converge on one key.
    pub fn set_aes_keys(&self, keys: KeyPairData) -> &KeyPairData {
        self.aes_keys.get_or_init(|| keys)
    }
}

impl Clone for DeviceConfig {
    fn clone(&self) -> Self {
        let aes_keys = OnceLock::new();
        if let Some(keys) = self.aes_keys.get() {
            let _ = aes_keys.set(keys.clone());
        }
        Self {
            host: self.host.clone(),
            port_override: self.port_override,
            timeout: self.timeout,
            credentials: self.credentials.clone(),
            credentials_hash: self.credentials_hash.clone(),
            connection_type: self.connection_type.clone(),
            aes_keys,
        }
    }
}
