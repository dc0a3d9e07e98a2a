//! RSA key pair for the AES transport handshake.
//!
//! The device encrypts the session key material with the client's public
//! key; 1024-bit keys are what the firmware accepts. Key generation is CPU
//! heavy, so the transport dispatches it to a blocking worker.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use rsa::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding,
};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};

use crate::CryptoError;

pub const RSA_KEY_SIZE_BITS: usize = 1024;

/// An RSA key pair with DER/base64 accessors for config persistence.
pub struct RsaKeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl RsaKeyPair {
    /// Generate a fresh pair. Blocking; call from a worker thread.
    pub fn generate() -> Result<Self, CryptoError> {
        let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_SIZE_BITS)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Rebuild a pair from base64-wrapped DER, as cached in `DeviceConfig`.
    pub fn from_der_b64(private_b64: &str, public_b64: &str) -> Result<Self, CryptoError> {
        let private_der = BASE64
            .decode(private_b64)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let public_der = BASE64
            .decode(public_b64)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let private_key = RsaPrivateKey::from_pkcs8_der(&private_der)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let public_key = RsaPublicKey::from_public_key_der(&public_der)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self {
            private_key,
            public_key,
        })
    }

    pub fn private_key_der_b64(&self) -> Result<String, CryptoError> {
        let der = self
            .private_key
            .to_pkcs8_der()
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(BASE64.encode(der.as_bytes()))
    }

    pub fn public_key_der_b64(&self) -> Result<String, CryptoError> {
        let der = self
            .public_key
            .to_public_key_der()
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(BASE64.encode(der.as_bytes()))
    }

    /// SubjectPublicKeyInfo PEM, as sent in the handshake request.
    pub fn public_key_pem(&self) -> Result<String, CryptoError> {
        self.public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    /// Decrypt the RSA-wrapped session key blob from the handshake reply.
    pub fn decrypt_handshake_key(&self, encrypted: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.private_key
            .decrypt(Pkcs1v15Encrypt, encrypted)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_persist_and_decrypt() {
        let pair = RsaKeyPair::generate().unwrap();

        let pem = pair.public_key_pem().unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));

        // Round-trip through the persisted DER form.
        let restored = RsaKeyPair::from_der_b64(
            &pair.private_key_der_b64().unwrap(),
            &pair.public_key_der_b64().unwrap(),
        )
        .unwrap();

        // Simulate the device wrapping key material for us.
        let key_and_iv: Vec<u8> = (0u8..32).collect();
        let wrapped = pair
            .public_key
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, &key_and_iv)
            .unwrap();
        assert_eq!(restored.decrypt_handshake_key(&wrapped).unwrap(), key_and_iv);
    }

    #[test]
    fn test_bad_der_rejected() {
        assert!(RsaKeyPair::from_der_b64("!!!", "!!!").is_err());
        assert!(RsaKeyPair::from_der_b64("AAAA", "AAAA").is_err());
    }
}
