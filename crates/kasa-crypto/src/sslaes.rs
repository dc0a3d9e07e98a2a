//! Digest ladder for the camera SSL-AES handshake.
//!
//! All values travel as upper-case hex strings; the inputs here are the
//! already-hex-encoded nonces and password hash, concatenated as text the
//! way the firmware does.

use crate::hash::{sha256, sha256_hex_upper};

/// The device's `device_confirm` value:
/// `SHA256(cnonce ‖ pwd_hash ‖ nonce)` in upper hex, followed by the server
/// nonce and the client nonce.
pub fn confirm_hash(local_nonce: &str, server_nonce: &str, pwd_hash: &str) -> String {
    let digest = sha256_hex_upper(
        format!("{local_nonce}{pwd_hash}{server_nonce}").as_bytes(),
    );
    format!("{digest}{server_nonce}{local_nonce}")
}

/// The `digest_passwd` field of handshake2:
/// `SHA256(pwd_hash ‖ cnonce ‖ nonce)` in upper hex followed by both nonces.
pub fn digest_password(local_nonce: &str, server_nonce: &str, pwd_hash: &str) -> String {
    let digest = sha256_hex_upper(
        format!("{pwd_hash}{local_nonce}{server_nonce}").as_bytes(),
    );
    format!("{digest}{local_nonce}{server_nonce}")
}

/// Session key material: `SHA256(tag ‖ cnonce ‖ nonce ‖ hashed_key)[..16]`
/// where `hashed_key = SHA256(cnonce ‖ pwd_hash ‖ nonce)` in upper hex.
/// `token_type` is `"lsk"` for the key and `"ivb"` for the IV.
pub fn encryption_token(
    token_type: &str,
    local_nonce: &str,
    server_nonce: &str,
    pwd_hash: &str,
) -> [u8; 16] {
    let hashed_key = sha256_hex_upper(
        format!("{local_nonce}{pwd_hash}{server_nonce}").as_bytes(),
    );
    let digest = sha256(
        format!("{token_type}{local_nonce}{server_nonce}{hashed_key}").as_bytes(),
    );
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

/// The `Tapo_tag` header for a secure request:
/// `SHA256(SHA256(pwd_hash ‖ cnonce) ‖ body ‖ seq)` in upper hex.
pub fn request_tag(request_body: &str, local_nonce: &str, pwd_hash: &str, seq: i64) -> String {
    let pwd_nonce_hash = sha256_hex_upper(format!("{pwd_hash}{local_nonce}").as_bytes());
    sha256_hex_upper(format!("{pwd_nonce_hash}{request_body}{seq}").as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::sha256_hex_upper;

    const LN: &str = "AAAABBBBCCCCDDDD";
    const SN: &str = "1111222233334444";

    #[test]
    fn test_confirm_hash_layout() {
        let pwd = sha256_hex_upper(b"password");
        let confirm = confirm_hash(LN, SN, &pwd);
        assert_eq!(confirm.len(), 64 + SN.len() + LN.len());
        assert!(confirm.ends_with(&format!("{SN}{LN}")));
    }

    #[test]
    fn test_digest_password_layout() {
        let pwd = sha256_hex_upper(b"password");
        let digest = digest_password(LN, SN, &pwd);
        assert!(digest.ends_with(&format!("{LN}{SN}")));
        assert_ne!(digest[..64], confirm_hash(LN, SN, &pwd)[..64]);
    }

    #[test]
    fn test_tokens_differ_by_type() {
        let pwd = sha256_hex_upper(b"password");
        let lsk = encryption_token("lsk", LN, SN, &pwd);
        let ivb = encryption_token("ivb", LN, SN, &pwd);
        assert_ne!(lsk, ivb);
    }

    #[test]
    fn test_tag_depends_on_seq_and_body() {
        let pwd = sha256_hex_upper(b"password");
        let a = request_tag("{}", LN, &pwd, 1);
        let b = request_tag("{}", LN, &pwd, 2);
        let c = request_tag("[]", LN, &pwd, 1);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert_eq!(a, a.to_uppercase());
    }
}
