//! Toggle for experimental code paths.
//!
//! Read once from the `KASA_EXPERIMENTAL` environment variable unless a
//! test or embedder overrides it explicitly.

use std::sync::Mutex;

pub const ENV_VAR: &str = "KASA_EXPERIMENTAL";

static OVERRIDE: Mutex<Option<bool>> = Mutex::new(None);

/// Whether experimental functionality is enabled.
pub fn enabled() -> bool {
    if let Some(value) = *OVERRIDE.lock().expect("experimental flag lock") {
        return value;
    }
    match std::env::var(ENV_VAR) {
        Ok(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "true" | "1" | "t" | "on"
        ),
        Err(_) => false,
    }
}

/// Override the environment lookup. `None` restores env-driven behavior;
/// exposed so tests can reset global state.
pub fn set(value: Option<bool>) {
    *OVERRIDE.lock().expect("experimental flag lock") = value;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_beats_env() {
        set(Some(true));
        assert!(enabled());
        set(Some(false));
        assert!(!enabled());
        set(None);
    }
}
