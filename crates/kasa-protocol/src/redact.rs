//! Redaction of identifying fields in debug logs.
//!
//! Device ids, MACs and tokens are replaced by an irreversible
//! fixed-length tag so two log lines about the same device still
//! correlate, but nothing can be recovered.

use serde_json::Value;

use kasa_crypto::hash::sha256_hex;

/// Keys whose values identify the device or the account.
pub const DEFAULT_REDACTORS: &[&str] = &[
    "device_id",
    "dev_id",
    "fw_id",
    "hw_id",
    "oem_id",
    "mac",
    "ssid",
    "nickname",
    "ip",
    "token",
    "stok",
    "latitude",
    "longitude",
];

/// Irreversible fixed-length tag for one value.
pub fn redacted_tag(value: &str) -> String {
    format!("REDACTED_{}", &sha256_hex(value.as_bytes())[..9])
}

fn redact_in_place(value: &mut Value, keys: &[&str]) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if keys.contains(&key.as_str()) {
                    match entry {
                        Value::String(s) => *entry = Value::String(redacted_tag(s)),
                        Value::Number(_) => *entry = Value::from(0),
                        _ => {}
                    }
                } else {
                    redact_in_place(entry, keys);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                redact_in_place(item, keys);
            }
        }
        _ => {}
    }
}

/// Copy of `value` with all matching keys redacted, at any depth.
pub fn redact_data(value: &Value, keys: &[&str]) -> Value {
    let mut copy = value.clone();
    redact_in_place(&mut copy, keys);
    copy
}
