//! Protocol layer over the device transports.
//!
//! `SmartProtocol` speaks the JSON envelope of the newer firmware
//! generations: request ids, multi-request batching, list paging and the
//! child-device wrapper. `IotProtocol` serializes the legacy tree-shaped
//! queries as-is. Both share the error-class-driven retry policy.

#![forbid(unsafe_code)]

pub mod child;
pub mod factory;
pub mod iot;
pub mod merge;
pub mod redact;
pub mod smart;
pub mod snowflake;
pub mod timezone;

pub use child::ChildProtocol;
pub use factory::{get_protocol, DeviceProtocol};
pub use iot::IotProtocol;
pub use smart::{SmartProtocol, DEFAULT_MULTI_REQUEST_BATCH_SIZE, DEFAULT_RETRY_COUNT};
