//! AES-128-CBC with PKCS#7 padding, the passthrough cipher shared by the
//! AES and SSL-AES transports.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use zeroize::Zeroize;

use crate::CryptoError;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Raw CBC encrypt with PKCS#7 padding.
pub fn cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    Aes128CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Raw CBC decrypt, stripping PKCS#7 padding.
pub fn cbc_decrypt(
    key: &[u8; 16],
    iv: &[u8; 16],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// A passthrough encryption session: fixed key and IV for the lifetime of
/// the device session, base64 on the wire.
#[derive(Clone)]
pub struct AesSession {
    key: [u8; 16],
    iv: [u8; 16],
}

impl AesSession {
    pub fn new(key: [u8; 16], iv: [u8; 16]) -> Self {
        Self { key, iv }
    }

    /// Build a session from the 32-byte key-and-IV buffer produced by the
    /// RSA handshake.
    pub fn from_key_and_iv(key_and_iv: &[u8]) -> Result<Self, CryptoError> {
        if key_and_iv.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "expected 32 bytes of key material, got {}",
                key_and_iv.len()
            )));
        }
        let mut key = [0u8; 16];
        let mut iv = [0u8; 16];
        key.copy_from_slice(&key_and_iv[..16]);
        iv.copy_from_slice(&key_and_iv[16..]);
        Ok(Self { key, iv })
    }

    /// Encrypt to the base64 form carried inside the passthrough envelope.
    pub fn encrypt(&self, data: &[u8]) -> String {
        BASE64.encode(cbc_encrypt(&self.key, &self.iv, data))
    }

    /// Decrypt a base64 passthrough response to its JSON text.
    pub fn decrypt(&self, data: &str) -> Result<String, CryptoError> {
        let ciphertext = BASE64
            .decode(data)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        let plain = cbc_decrypt(&self.key, &self.iv, &ciphertext)?;
        String::from_utf8(plain).map_err(|_| CryptoError::InvalidUtf8)
    }
}

impl Drop for AesSession {
    fn drop(&mut self) {
        self.key.zeroize();
        self.iv.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> AesSession {
        AesSession::new(*b"0123456789abcdef", *b"fedcba9876543210")
    }

    #[test]
    fn test_round_trip() {
        let s = session();
        let plaintext = r#"{"method":"get_device_info"}"#;
        let wire = s.encrypt(plaintext.as_bytes());
        assert_eq!(s.decrypt(&wire).unwrap(), plaintext);
    }

    #[test]
    fn test_padding_reversible_up_to_64k() {
        let s = session();
        for len in [1usize, 15, 16, 17, 255, 4096, 65536] {
            let data = vec![b'x'; len];
            let wire = s.encrypt(&data);
            assert_eq!(s.decrypt(&wire).unwrap().as_bytes(), &data[..]);
        }
    }

    #[test]
    fn test_ciphertext_is_block_padded() {
        let ct = cbc_encrypt(b"0123456789abcdef", b"fedcba9876543210", b"x");
        assert_eq!(ct.len(), 16);
        let ct = cbc_encrypt(b"0123456789abcdef", b"fedcba9876543210", &[b'y'; 16]);
        assert_eq!(ct.len(), 32);
    }

    #[test]
    fn test_key_and_iv_split() {
        let buf: Vec<u8> = (0u8..32).collect();
        let s = AesSession::from_key_and_iv(&buf).unwrap();
        let wire = s.encrypt(b"data");
        assert_eq!(s.decrypt(&wire).unwrap(), "data");
        assert!(AesSession::from_key_and_iv(&buf[..31]).is_err());
    }

    #[test]
    fn test_bad_base64_fails() {
        assert!(session().decrypt("not base64 !!!").is_err());
    }
}
