//! Protocol factory: pick the protocol/transport pair for a device.

use std::sync::Arc;

use serde_json::Value;

use kasa_crypto::klap::KlapVersion;
use kasa_transport::{
    AesTransport, DeviceTransport, KlapTransport, SslAesTransport, SslTransport,
    TpapTransport, XorTransport,
};
use kasa_types::{DeviceConfig, DeviceFamily, EncryptionType, KasaError};

use crate::iot::IotProtocol;
use crate::smart::SmartProtocol;

/// The protocol stack matching a device's connection parameters.
pub enum DeviceProtocol {
    Iot(IotProtocol<DeviceTransport>),
    Smart(SmartProtocol<DeviceTransport>),
}

impl DeviceProtocol {
    pub async fn query(&self, request: &Value, retry_count: usize) -> Result<Value, KasaError> {
        match self {
            DeviceProtocol::Iot(protocol) => protocol.query(request, retry_count).await,
            DeviceProtocol::Smart(protocol) => protocol.query(request, retry_count).await,
        }
    }

    pub async fn credentials_hash(&self) -> Option<String> {
        match self {
            DeviceProtocol::Iot(protocol) => protocol.credentials_hash().await,
            DeviceProtocol::Smart(protocol) => protocol.credentials_hash().await,
        }
    }

    pub async fn close(&self) {
        match self {
            DeviceProtocol::Iot(protocol) => protocol.close().await,
            DeviceProtocol::Smart(protocol) => protocol.close().await,
        }
    }
}

fn is_iot_family(family: DeviceFamily) -> bool {
    matches!(
        family,
        DeviceFamily::IotSmartPlugSwitch | DeviceFamily::IotSmartBulb
    )
}

/// Build the protocol for a connection type, or `None` for combinations no
/// firmware ships.
pub fn get_protocol(config: Arc<DeviceConfig>) -> Result<Option<DeviceProtocol>, KasaError> {
    let host = config.host.clone();
    let connection = config.connection_type.clone();
    let iot = is_iot_family(connection.device_family);

    let protocol = match (iot, connection.encryption_type) {
        (true, EncryptionType::Xor) => DeviceProtocol::Iot(IotProtocol::new(
            host,
            DeviceTransport::Xor(XorTransport::new(config)),
        )),
        (true, EncryptionType::Klap) => DeviceProtocol::Iot(IotProtocol::new(
            host,
            DeviceTransport::Klap(KlapTransport::new(config)?),
        )),
        (false, EncryptionType::Aes) => DeviceProtocol::Smart(SmartProtocol::new(
            host,
            DeviceTransport::Aes(AesTransport::new(config)?),
        )),
        // SMART-generation firmware always speaks the v2 hashes.
        (false, EncryptionType::Klap) => DeviceProtocol::Smart(SmartProtocol::new(
            host,
            DeviceTransport::Klap(KlapTransport::new_with_version(config, KlapVersion::V2)?),
        )),
        (false, EncryptionType::Ssl) => DeviceProtocol::Smart(SmartProtocol::new(
            host,
            DeviceTransport::Ssl(SslTransport::new(config)?),
        )),
        (false, EncryptionType::SslAes) => DeviceProtocol::Smart(SmartProtocol::new(
            host,
            DeviceTransport::SslAes(SslAesTransport::new(config)?),
        )),
        (false, EncryptionType::Tpap) => DeviceProtocol::Smart(SmartProtocol::new(
            host,
            DeviceTransport::Tpap(TpapTransport::new(config)?),
        )),
        _ => return Ok(None),
    };
    Ok(Some(protocol))
}

/// Default port for a connection type, honoring the HTTP port override.
pub fn default_port(config: &DeviceConfig) -> u16 {
    if let Some(port) = config.connection_type.http_port {
        return port;
    }
    match config.connection_type.encryption_type {
        EncryptionType::Xor => XorTransport::DEFAULT_PORT,
        EncryptionType::Klap => KlapTransport::DEFAULT_PORT,
        EncryptionType::Aes => AesTransport::DEFAULT_PORT,
        EncryptionType::Ssl => SslTransport::DEFAULT_PORT,
        EncryptionType::SslAes => SslAesTransport::DEFAULT_PORT,
        EncryptionType::Tpap => TpapTransport::DEFAULT_PORT,
    }
}
