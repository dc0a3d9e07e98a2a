//! Autokey XOR cipher used by the legacy TCP protocol.
//!
//! The keystream starts at 171; each ciphertext byte becomes the key for
//! the next. The cipher is expressed as an iterator over the input so
//! encryption folds straight into the output buffer.

pub const INITIALIZATION_VECTOR: u8 = 171;

struct XorEncrypt<I> {
    key: u8,
    inner: I,
}

impl<I: Iterator<Item = u8>> Iterator for XorEncrypt<I> {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        let plain = self.inner.next()?;
        let cipher = self.key ^ plain;
        self.key = cipher;
        Some(cipher)
    }
}

struct XorDecrypt<I> {
    key: u8,
    inner: I,
}

impl<I: Iterator<Item = u8>> Iterator for XorDecrypt<I> {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        let cipher = self.inner.next()?;
        let plain = self.key ^ cipher;
        self.key = cipher;
        Some(plain)
    }
}

/// Encrypt a request for the wire: big-endian u32 length followed by the
/// XOR-encrypted body.
pub fn encrypt(request: &str) -> Vec<u8> {
    let plain = request.as_bytes();
    let mut out = Vec::with_capacity(4 + plain.len());
    out.extend_from_slice(&(plain.len() as u32).to_be_bytes());
    out.extend(XorEncrypt {
        key: INITIALIZATION_VECTOR,
        inner: plain.iter().copied(),
    });
    out
}

/// Decrypt a response body (without the length header).
pub fn decrypt(ciphertext: &[u8]) -> Result<String, std::string::FromUtf8Error> {
    let plain: Vec<u8> = XorDecrypt {
        key: INITIALIZATION_VECTOR,
        inner: ciphertext.iter().copied(),
    }
    .collect();
    String::from_utf8(plain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let request = r#"{"system":{"get_sysinfo":null}}"#;
        let wire = encrypt(request);
        let length = u32::from_be_bytes(wire[..4].try_into().unwrap()) as usize;
        assert_eq!(length, request.len());
        assert_eq!(decrypt(&wire[4..]).unwrap(), request);
    }

    #[test]
    fn test_first_cipher_byte() {
        // 171 ^ b'{' == 0xD0
        let wire = encrypt("{}");
        assert_eq!(wire[4], 0xD0);
    }

    #[test]
    fn test_snowman_fixture() {
        // 18 bytes of UTF-8 including a three-byte snowman.
        let request = "{\"snowman\": \"\u{2603}\"}";
        assert_eq!(request.len(), 18);
        let wire = encrypt(request);
        assert_eq!(&wire[..4], &18u32.to_be_bytes());
        assert_eq!(decrypt(&wire[4..]).unwrap(), request);
    }

    #[test]
    fn test_empty_payload() {
        let wire = encrypt("");
        assert_eq!(wire, 0u32.to_be_bytes());
        assert_eq!(decrypt(&wire[4..]).unwrap(), "");
    }
}
