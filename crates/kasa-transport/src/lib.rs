//! Transport layer for TP-Link smart home devices.
//!
//! Five wire protocols behind one trait: the legacy XOR/TCP framing, the
//! KLAP challenge/response HTTP protocol, the RSA-bootstrapped AES
//! passthrough, the camera SSL-AES digest handshake, and the TPAP HTTPS
//! protocol with SPAKE2+ or NOC authentication. Each transport owns its
//! session state machine and re-handshakes transparently from `send`.

#![forbid(unsafe_code)]

pub mod aes;
pub mod base;
pub mod http;
pub mod klap;
pub mod ssl;
pub mod sslaes;
pub mod testing;
pub mod tpap;
pub mod xor;

pub use base::{
    DeviceTransport, Transport, TransportState, ONE_DAY_SECONDS,
    SESSION_EXPIRE_BUFFER_SECONDS,
};
pub use http::{HttpClient, HttpRequest, HttpResponse, RequestBody, ReqwestClient, ResponseBody, TlsMode};
pub use aes::AesTransport;
pub use klap::KlapTransport;
pub use ssl::SslTransport;
pub use sslaes::SslAesTransport;
pub use tpap::TpapTransport;
pub use xor::XorTransport;
