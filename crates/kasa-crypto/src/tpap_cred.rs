//! Credential-string construction for TPAP registration.
//!
//! The device advertises how it stores the passcode via `extra_crypt`; the
//! client must reproduce the exact stored form before PBKDF2. These
//! transforms mirror vendor formats and must not be "improved".

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::aead::{hkdf_expand, HkdfHash};
use crate::hash::{md5_hex, sha1_hex, sha256_hex};
use crate::CryptoError;

/// Parsed form of the device's `extra_crypt` advertisement.
#[derive(Debug, Clone, Default)]
pub struct ExtraCrypt {
    pub kind: String,
    pub passwd_id: i64,
    pub passwd_prefix: String,
    pub authkey_tmpkey: String,
    pub authkey_dictionary: String,
    pub sha_name: i64,
    pub sha_salt_b64: String,
}

impl ExtraCrypt {
    /// Read the fields out of the registration response value.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.is_empty() {
            return None;
        }
        let params = obj.get("params").and_then(|p| p.as_object());
        let get_str = |key: &str| -> String {
            params
                .and_then(|p| p.get(key))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let get_int = |key: &str, default: i64| -> i64 {
            params
                .and_then(|p| p.get(key))
                .and_then(|v| v.as_i64())
                .unwrap_or(default)
        };
        Some(Self {
            kind: obj
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_ascii_lowercase(),
            passwd_id: get_int("passwd_id", 0),
            passwd_prefix: get_str("passwd_prefix"),
            authkey_tmpkey: get_str("authkey_tmpkey"),
            authkey_dictionary: get_str("authkey_dictionary"),
            sha_name: get_int("sha_name", -1),
            sha_salt_b64: get_str("sha_salt"),
        })
    }
}

fn authkey_mask(passcode: &str, tmpkey: &str, dictionary: &str) -> String {
    let dict: Vec<char> = dictionary.chars().collect();
    if dict.is_empty() {
        return passcode.to_string();
    }
    let pass: Vec<char> = passcode.chars().collect();
    let tmp: Vec<char> = tmpkey.chars().collect();
    let len = pass.len().max(tmp.len());
    let mut out = String::with_capacity(len);
    for i in 0..len {
        let a = pass.get(i).map(|c| *c as u32).unwrap_or(0xBB);
        let b = tmp.get(i).map(|c| *c as u32).unwrap_or(0xBB);
        out.push(dict[((a ^ b) as usize) % dict.len()]);
    }
    out
}

fn sha1_username_mac_shadow(username: &str, mac12hex: &str, passcode: &str) -> String {
    if username.is_empty()
        || mac12hex.len() != 12
        || !mac12hex.chars().all(|c| c.is_ascii_hexdigit())
    {
        return passcode.to_string();
    }
    let mac: Vec<String> = mac12hex
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).to_uppercase())
        .collect();
    let mac_colon = mac.join(":");
    let inner = format!("{}_{}", md5_hex(username.as_bytes()), mac_colon);
    sha1_hex(inner.as_bytes())
}

fn sha256crypt_simple(passcode: &str, prefix: &str) -> String {
    format!("{prefix}${}", sha256_hex(passcode.as_bytes()))
}

/// Build the credential string expected by the device firmware.
pub fn build_credential_string(
    extra_crypt: Option<&ExtraCrypt>,
    username: &str,
    passcode: &str,
    mac_no_colon: &str,
) -> String {
    let plain = || {
        if username.is_empty() {
            passcode.to_string()
        } else {
            format!("{username}/{passcode}")
        }
    };
    let Some(crypt) = extra_crypt else {
        return plain();
    };

    match crypt.kind.as_str() {
        "password_shadow" => match crypt.passwd_id {
            1 => md5_hex(passcode.as_bytes()),
            2 => sha1_hex(passcode.as_bytes()),
            3 => sha1_username_mac_shadow(username, mac_no_colon, passcode),
            5 => sha256crypt_simple(passcode, &crypt.passwd_prefix),
            _ => passcode.to_string(),
        },
        "password_authkey" => {
            if crypt.authkey_tmpkey.is_empty() || crypt.authkey_dictionary.is_empty() {
                passcode.to_string()
            } else {
                authkey_mask(passcode, &crypt.authkey_tmpkey, &crypt.authkey_dictionary)
            }
        }
        "password_sha_with_salt" => {
            let name = if crypt.sha_name == 0 { "admin" } else { "user" };
            match BASE64
                .decode(&crypt.sha_salt_b64)
                .ok()
                .and_then(|b| String::from_utf8(b).ok())
            {
                Some(salt) => sha256_hex(format!("{name}{salt}{passcode}").as_bytes()),
                None => passcode.to_string(),
            }
        }
        _ => plain(),
    }
}

/// Derive the MAC-based passcode used when the device negotiates suite 0.
pub fn mac_passcode(mac: &str) -> Result<String, CryptoError> {
    let mac_hex: String = mac
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect();
    let mac_bytes = hex::decode(&mac_hex)
        .map_err(|_| CryptoError::InvalidKey("bad MAC address".into()))?;
    if mac_bytes.len() != 6 {
        return Err(CryptoError::InvalidKey("bad MAC address".into()));
    }
    let seed = b"GqY5o136oa4i6VprTlMW2DpVXxmfW8";
    let ikm = [&seed[..], &mac_bytes[3..6], &mac_bytes[0..3]].concat();
    let okm = hkdf_expand(
        &ikm,
        Some(b"tp-kdf-salt-default-passcode"),
        b"tp-kdf-info-default-passcode",
        32,
        HkdfHash::Sha256,
    );
    Ok(hex::encode_upper(okm))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_credential_joins_username() {
        assert_eq!(build_credential_string(None, "admin", "pw", ""), "admin/pw");
        assert_eq!(build_credential_string(None, "", "pw", ""), "pw");
    }

    #[test]
    fn test_password_shadow_ids() {
        let crypt = |id: i64| ExtraCrypt {
            kind: "password_shadow".into(),
            passwd_id: id,
            passwd_prefix: "$5".into(),
            ..Default::default()
        };
        assert_eq!(
            build_credential_string(Some(&crypt(1)), "u", "pw", ""),
            md5_hex(b"pw")
        );
        assert_eq!(
            build_credential_string(Some(&crypt(2)), "u", "pw", ""),
            sha1_hex(b"pw")
        );
        assert_eq!(
            build_credential_string(Some(&crypt(5)), "u", "pw", ""),
            format!("$5${}", sha256_hex(b"pw"))
        );
        // Unknown id falls back to the raw passcode.
        assert_eq!(build_credential_string(Some(&crypt(9)), "u", "pw", ""), "pw");
    }

    #[test]
    fn test_mac_shadow_requires_valid_mac() {
        let crypt = ExtraCrypt {
            kind: "password_shadow".into(),
            passwd_id: 3,
            ..Default::default()
        };
        // Invalid MAC degrades to the passcode.
        assert_eq!(
            build_credential_string(Some(&crypt), "u", "pw", "zz"),
            "pw"
        );
        let shadow = build_credential_string(Some(&crypt), "u", "pw", "aabbccddeeff");
        assert_eq!(shadow.len(), 40);
        assert_ne!(shadow, "pw");
    }

    #[test]
    fn test_authkey_mask() {
        let crypt = ExtraCrypt {
            kind: "password_authkey".into(),
            authkey_tmpkey: "tmp".into(),
            authkey_dictionary: "abcdef0123456789".into(),
            ..Default::default()
        };
        let masked = build_credential_string(Some(&crypt), "u", "passcode", "");
        assert_eq!(masked.len(), 8);
        // Missing parameters fall back to the passcode.
        let empty = ExtraCrypt {
            kind: "password_authkey".into(),
            ..Default::default()
        };
        assert_eq!(build_credential_string(Some(&empty), "u", "pw", ""), "pw");
    }

    #[test]
    fn test_sha_with_salt() {
        let crypt = ExtraCrypt {
            kind: "password_sha_with_salt".into(),
            sha_name: 0,
            sha_salt_b64: BASE64.encode("salty"),
            ..Default::default()
        };
        assert_eq!(
            build_credential_string(Some(&crypt), "u", "pw", ""),
            sha256_hex(b"adminsaltypw")
        );
    }

    #[test]
    fn test_extra_crypt_parsing() {
        let value = json!({
            "type": "PASSWORD_SHADOW",
            "params": {"passwd_id": 5, "passwd_prefix": "$5"}
        });
        let crypt = ExtraCrypt::from_value(&value).unwrap();
        assert_eq!(crypt.kind, "password_shadow");
        assert_eq!(crypt.passwd_id, 5);
        assert!(ExtraCrypt::from_value(&json!({})).is_none());
    }

    #[test]
    fn test_mac_passcode() {
        let a = mac_passcode("AA:BB:CC:DD:EE:FF").unwrap();
        let b = mac_passcode("AABBCCDDEEFF").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_eq!(a, a.to_uppercase());
        assert!(mac_passcode("AA:BB").is_err());
    }
}
