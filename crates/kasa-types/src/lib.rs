//! Shared types for the TP-Link smart home transport core.
//!
//! This crate holds everything the transport and protocol layers have in
//! common: credentials and the per-family default credential table, the
//! immutable device configuration, the device error-code enumeration with
//! its retryable/authentication/timeout partitions, and the unified error
//! taxonomy.

#![forbid(unsafe_code)]

pub mod config;
pub mod credentials;
pub mod error;
pub mod error_code;
pub mod experimental;

pub use config::{ConnectionType, DeviceConfig, DeviceFamily, EncryptionType, KeyPairData};
pub use credentials::{get_default_credentials, Credentials, DEFAULT_CREDENTIALS};
pub use error::{error_for_code, KasaError};
pub use error_code::{
    ErrorCode, AUTHENTICATION_ERRORS, RETRYABLE_ERRORS, TIMEOUT_ERRORS,
};
