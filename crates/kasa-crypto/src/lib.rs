//! Wire cryptography for TP-Link smart home devices.
//!
//! Pure primitives only: no I/O, no session state machines. The transport
//! crate drives these from its handshake and send paths.

#![forbid(unsafe_code)]

pub mod aead;
pub mod aes_cbc;
pub mod certs;
pub mod hash;
pub mod klap;
pub mod rsa_keys;
pub mod spake2;
pub mod sslaes;
pub mod tpap_cred;
pub mod xor;

/// Error type for crypto operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("message authentication failed")]
    MacMismatch,
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("invalid curve point encoding")]
    InvalidPoint,
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("non-utf8 plaintext")]
    InvalidUtf8,
}
