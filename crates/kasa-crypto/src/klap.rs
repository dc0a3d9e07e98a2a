//! KLAP handshake hashes and session cipher.
//!
//! Two handshakes establish `(local_seed, remote_seed, auth_hash)`; from
//! those the session derives an AES key, a 12-byte IV prefix whose trailing
//! four digest bytes seed the sequence counter, and a signature key used to
//! tag every request.

use crate::aes_cbc::{cbc_decrypt, cbc_encrypt};
use crate::hash::{md5, sha1, sha256};
use crate::CryptoError;

/// Hash generation used by the two KLAP revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KlapVersion {
    V1,
    V2,
}

impl KlapVersion {
    /// Credential hash: v1 `MD5(MD5(u) ‖ MD5(p))`, v2 `SHA256(SHA1(u) ‖ SHA1(p))`.
    pub fn auth_hash(self, username: &str, password: &str) -> Vec<u8> {
        match self {
            KlapVersion::V1 => {
                let mut buf = Vec::with_capacity(32);
                buf.extend_from_slice(&md5(username.as_bytes()));
                buf.extend_from_slice(&md5(password.as_bytes()));
                md5(&buf).to_vec()
            }
            KlapVersion::V2 => {
                let mut buf = Vec::with_capacity(40);
                buf.extend_from_slice(&sha1(username.as_bytes()));
                buf.extend_from_slice(&sha1(password.as_bytes()));
                sha256(&buf).to_vec()
            }
        }
    }

    /// The confirmation the device returns from handshake1.
    pub fn handshake1_seed_auth_hash(
        self,
        local_seed: &[u8],
        remote_seed: &[u8],
        auth_hash: &[u8],
    ) -> [u8; 32] {
        match self {
            KlapVersion::V1 => sha256(&[local_seed, auth_hash].concat()),
            KlapVersion::V2 => sha256(&[local_seed, remote_seed, auth_hash].concat()),
        }
    }

    /// The payload the client posts in handshake2.
    pub fn handshake2_seed_auth_hash(
        self,
        local_seed: &[u8],
        remote_seed: &[u8],
        auth_hash: &[u8],
    ) -> [u8; 32] {
        match self {
            KlapVersion::V1 => sha256(&[remote_seed, auth_hash].concat()),
            KlapVersion::V2 => sha256(&[remote_seed, local_seed, auth_hash].concat()),
        }
    }
}

/// Encryption state for one KLAP session.
///
/// The sequence number is part of the IV and is sent as a URL parameter;
/// the device expects it to increment by exactly one per request.
pub struct KlapSession {
    key: [u8; 16],
    iv: [u8; 12],
    sig: [u8; 28],
    seq: i32,
}

impl KlapSession {
    pub fn new(local_seed: &[u8], remote_seed: &[u8], auth_hash: &[u8]) -> Self {
        let key_digest = sha256(&[b"lsk" as &[u8], local_seed, remote_seed, auth_hash].concat());
        let iv_digest = sha256(&[b"iv" as &[u8], local_seed, remote_seed, auth_hash].concat());
        let sig_digest = sha256(&[b"ldk" as &[u8], local_seed, remote_seed, auth_hash].concat());

        let mut key = [0u8; 16];
        key.copy_from_slice(&key_digest[..16]);
        let mut iv = [0u8; 12];
        iv.copy_from_slice(&iv_digest[..12]);
        let mut sig = [0u8; 28];
        sig.copy_from_slice(&sig_digest[..28]);
        // The last four digest bytes seed the sequence counter.
        let seq = i32::from_be_bytes(iv_digest[28..32].try_into().expect("4 bytes"));

        Self { key, iv, sig, seq }
    }

    /// Current sequence number (the value of the last encrypt).
    pub fn seq(&self) -> i32 {
        self.seq
    }

    fn iv_for_seq(&self, seq: i32) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[..12].copy_from_slice(&self.iv);
        iv[12..].copy_from_slice(&seq.to_be_bytes());
        iv
    }

    /// Encrypt a request, consuming the next sequence number.
    ///
    /// Returns the wire body `signature(32) ‖ ciphertext` and the sequence
    /// number to put on the URL.
    pub fn encrypt(&mut self, msg: &[u8]) -> (Vec<u8>, i32) {
        self.seq = self.seq.wrapping_add(1);
        let iv = self.iv_for_seq(self.seq);
        let ciphertext = cbc_encrypt(&self.key, &iv, msg);
        let signature = sha256(
            &[
                &self.sig as &[u8],
                &self.seq.to_be_bytes(),
                &ciphertext,
            ]
            .concat(),
        );
        let mut out = Vec::with_capacity(32 + ciphertext.len());
        out.extend_from_slice(&signature);
        out.extend_from_slice(&ciphertext);
        (out, self.seq)
    }

    /// Decrypt a response to the request with the current sequence number.
    ///
    /// The device tags its responses the same way it expects requests to be
    /// tagged; the tag is checked before decrypting.
    pub fn decrypt(&self, msg: &[u8]) -> Result<String, CryptoError> {
        if msg.len() < 32 {
            return Err(CryptoError::DecryptionFailed);
        }
        let (tag, ciphertext) = msg.split_at(32);
        let expected = sha256(
            &[
                &self.sig as &[u8],
                &self.seq.to_be_bytes(),
                ciphertext,
            ]
            .concat(),
        );
        if !constant_time_eq::constant_time_eq(tag, &expected) {
            return Err(CryptoError::MacMismatch);
        }
        let iv = self.iv_for_seq(self.seq);
        let plain = cbc_decrypt(&self.key, &iv, ciphertext)?;
        String::from_utf8(plain).map_err(|_| CryptoError::InvalidUtf8)
    }
}
