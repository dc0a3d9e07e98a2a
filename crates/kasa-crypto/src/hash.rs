//! Digest helpers shared by every transport.
//!
//! Device firmware mixes MD5, SHA-1, SHA-256 and SHA-512 in its key
//! schedules; the weak digests are required for wire compatibility and are
//! never used as general-purpose password hashes.

use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

pub fn md5(data: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&Md5::digest(data));
    out
}

pub fn sha1(data: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(&Sha1::digest(data));
    out
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

pub fn sha512(data: &[u8]) -> [u8; 64] {
    let mut out = [0u8; 64];
    out.copy_from_slice(&Sha512::digest(data));
    out
}

/// Lower-case hex of MD5, as used in login payloads.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(md5(data))
}

/// Upper-case hex of MD5, as used by the camera digest ladder.
pub fn md5_hex_upper(data: &[u8]) -> String {
    hex::encode_upper(md5(data))
}

/// Lower-case hex of SHA-1, as used by AES login hashing.
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(sha1(data))
}

/// Lower-case hex of SHA-256.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Upper-case hex of SHA-256, as used by the camera digest ladder.
pub fn sha256_hex_upper(data: &[u8]) -> String {
    hex::encode_upper(sha256(data))
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("HMAC can take keys of any size");
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

pub fn hmac_sha512(key: &[u8], data: &[u8]) -> [u8; 64] {
    let mut mac =
        Hmac::<Sha512>::new_from_slice(key).expect("HMAC can take keys of any size");
    mac.update(data);
    let mut out = [0u8; 64];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}
