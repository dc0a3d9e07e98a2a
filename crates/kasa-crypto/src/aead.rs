//! AEAD data channel for the TPAP transport.
//!
//! The session key from either authenticator expands through HKDF with
//! cipher-specific labels into an AEAD key and a 12-byte base nonce. The
//! last four nonce bytes are replaced by the request sequence number, so
//! the first eight bytes stay constant for the whole session.

use ccm::aead::generic_array::GenericArray;
use ccm::aead::{Aead, KeyInit};
use ccm::consts::{U12, U16};
use ccm::Ccm;
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use sha2::{Sha256, Sha512};

use crate::CryptoError;

pub const TAG_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;

type Aes128Ccm = Ccm<aes::Aes128, U16, U12>;
type Aes256Ccm = Ccm<aes::Aes256, U16, U12>;

/// Hash used for HKDF expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HkdfHash {
    Sha256,
    Sha512,
}

/// Expand key material with HKDF over the selected hash.
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    length: usize,
    hash: HkdfHash,
) -> Vec<u8> {
    let mut okm = vec![0u8; length];
    match hash {
        HkdfHash::Sha256 => Hkdf::<Sha256>::new(salt, ikm)
            .expand(info, &mut okm)
            .expect("okm length within hkdf bounds"),
        HkdfHash::Sha512 => Hkdf::<Sha512>::new(salt, ikm)
            .expand(info, &mut okm)
            .expect("okm length within hkdf bounds"),
    }
    okm
}

/// AEAD suites the device may negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Ccm,
    Aes256Ccm,
    ChaCha20Poly1305,
}

struct CipherLabels {
    key_salt: &'static [u8],
    key_info: &'static [u8],
    nonce_salt: &'static [u8],
    nonce_info: &'static [u8],
    key_len: usize,
}

impl CipherKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "aes_128_ccm" => Some(CipherKind::Aes128Ccm),
            "aes_256_ccm" => Some(CipherKind::Aes256Ccm),
            "chacha20_poly1305" => Some(CipherKind::ChaCha20Poly1305),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CipherKind::Aes128Ccm => "aes_128_ccm",
            CipherKind::Aes256Ccm => "aes_256_ccm",
            CipherKind::ChaCha20Poly1305 => "chacha20_poly1305",
        }
    }

    fn labels(self) -> CipherLabels {
        match self {
            CipherKind::Aes128Ccm => CipherLabels {
                key_salt: b"tp-kdf-salt-aes128-key",
                key_info: b"tp-kdf-info-aes128-key",
                nonce_salt: b"tp-kdf-salt-aes128-iv",
                nonce_info: b"tp-kdf-info-aes128-iv",
                key_len: 16,
            },
            CipherKind::Aes256Ccm => CipherLabels {
                key_salt: b"tp-kdf-salt-aes256-key",
                key_info: b"tp-kdf-info-aes256-key",
                nonce_salt: b"tp-kdf-salt-aes256-iv",
                nonce_info: b"tp-kdf-info-aes256-iv",
                key_len: 32,
            },
            CipherKind::ChaCha20Poly1305 => CipherLabels {
                key_salt: b"tp-kdf-salt-chacha20-key",
                key_info: b"tp-kdf-info-chacha20-key",
                nonce_salt: b"tp-kdf-salt-chacha20-iv",
                nonce_info: b"tp-kdf-info-chacha20-iv",
                key_len: 32,
            },
        }
    }
}

/// Per-session AEAD cipher with a deterministic sequence-derived nonce.
#[derive(Clone)]
pub struct SessionCipher {
    kind: CipherKind,
    key: Vec<u8>,
    base_nonce: [u8; NONCE_LEN],
}

impl SessionCipher {
    /// Derive the cipher from the session shared key.
    pub fn from_shared_key(kind: CipherKind, shared_key: &[u8], hash: HkdfHash) -> Self {
        let labels = kind.labels();
        let key = hkdf_expand(
            shared_key,
            Some(labels.key_salt),
            labels.key_info,
            labels.key_len,
            hash,
        );
        let nonce_bytes = hkdf_expand(
            shared_key,
            Some(labels.nonce_salt),
            labels.nonce_info,
            NONCE_LEN,
            hash,
        );
        let mut base_nonce = [0u8; NONCE_LEN];
        base_nonce.copy_from_slice(&nonce_bytes);
        Self {
            kind,
            key,
            base_nonce,
        }
    }

    /// Nonce for a sequence number: base[..8] ‖ seq as big-endian u32.
    pub fn nonce_for_seq(&self, seq: u32) -> [u8; NONCE_LEN] {
        let mut nonce = self.base_nonce;
        nonce[8..].copy_from_slice(&seq.to_be_bytes());
        nonce
    }

    /// Encrypt, returning ciphertext with the 16-byte tag appended.
    pub fn encrypt(&self, plaintext: &[u8], seq: u32) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.nonce_for_seq(seq);
        let nonce = GenericArray::from_slice(&nonce);
        let result = match self.kind {
            CipherKind::Aes128Ccm => {
                Aes128Ccm::new(GenericArray::from_slice(&self.key)).encrypt(nonce, plaintext)
            }
            CipherKind::Aes256Ccm => {
                Aes256Ccm::new(GenericArray::from_slice(&self.key)).encrypt(nonce, plaintext)
            }
            CipherKind::ChaCha20Poly1305 => {
                ChaCha20Poly1305::new(GenericArray::from_slice(&self.key))
                    .encrypt(nonce, plaintext)
            }
        };
        result.map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt ciphertext-and-tag for the given sequence number.
    pub fn decrypt(&self, ciphertext_and_tag: &[u8], seq: u32) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.nonce_for_seq(seq);
        let nonce = GenericArray::from_slice(&nonce);
        let result = match self.kind {
            CipherKind::Aes128Ccm => Aes128Ccm::new(GenericArray::from_slice(&self.key))
                .decrypt(nonce, ciphertext_and_tag),
            CipherKind::Aes256Ccm => Aes256Ccm::new(GenericArray::from_slice(&self.key))
                .decrypt(nonce, ciphertext_and_tag),
            CipherKind::ChaCha20Poly1305 => {
                ChaCha20Poly1305::new(GenericArray::from_slice(&self.key))
                    .decrypt(nonce, ciphertext_and_tag)
            }
        };
        result.map_err(|_| CryptoError::DecryptionFailed)
    }
}
