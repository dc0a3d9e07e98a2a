//! TPAP transport for recent cameras and vacuums.
//!
//! Two authentication strategies feed one AEAD data channel: SPAKE2+ where
//! only the device passcode is known, and NOC where cloud-issued
//! certificate material is available. Old firmware that cannot negotiate
//! the secure channel falls back to a plain MD5 login and an unencrypted
//! data path.

mod noc;
mod pake;

pub use noc::{NocClient, TpapNocData};

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use kasa_crypto::aead::SessionCipher;
use kasa_types::{error_for_code, DeviceConfig, ErrorCode, KasaError};

use crate::base::{Transport, TransportState};
use crate::http::{HttpClient, HttpRequest, ReqwestClient, ResponseBody, TlsMode};

const TAG_LEN: usize = 16;

/// How the current session authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    Pake,
    Noc,
    /// Less-secure fallback; no AEAD material was derived.
    Unencrypted,
}

/// Session parameters extracted from the final handshake response.
///
/// Firmware revisions disagree on field names, so both spellings of every
/// field are accepted.
#[derive(Debug, Clone)]
pub struct TlaSession {
    pub session_id: String,
    pub start_seq: u32,
    pub expired: i64,
    pub session_type: SessionType,
}

impl TlaSession {
    pub fn from_result(result: &Value, session_type: SessionType) -> Self {
        let session_id = result
            .get("sessionId")
            .or_else(|| result.get("stok"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let start_seq = result
            .get("start_seq")
            .or_else(|| result.get("startSeq"))
            .and_then(Value::as_u64)
            .unwrap_or(1) as u32;
        let expired = result
            .get("expired")
            .or_else(|| result.get("sessionExpired"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Self {
            session_id,
            start_seq,
            expired,
            session_type,
        }
    }
}

pub struct TpapTransport {
    pub(crate) config: Arc<DeviceConfig>,
    pub(crate) host: String,
    pub(crate) http: Arc<dyn HttpClient>,
    state: TransportState,
    pub(crate) app_url: Url,
    ds_url: Option<Url>,
    session_id: Option<String>,
    seq: Option<u32>,
    cipher: Option<SessionCipher>,
    pub(crate) discover_mac: Option<String>,
    pub(crate) discover_suites: Option<Vec<i64>>,
    discovered: bool,
    noc_data: Option<TpapNocData>,
}

impl TpapTransport {
    pub const DEFAULT_PORT: u16 = 4433;

    pub fn new(config: Arc<DeviceConfig>) -> Result<Self, KasaError> {
        let http = Arc::new(ReqwestClient::new(
            &config.host,
            config.timeout,
            TlsMode::SelfSigned,
        )?);
        Self::with_http_client(config, http)
    }

    pub fn with_http_client(
        config: Arc<DeviceConfig>,
        http: Arc<dyn HttpClient>,
    ) -> Result<Self, KasaError> {
        let port = config
            .port_override
            .or(config.connection_type.http_port)
            .unwrap_or(Self::DEFAULT_PORT);
        let app_url = Url::parse(&format!("https://{}:{}/", config.host, port))
            .map_err(|e| KasaError::protocol(format!("invalid device url: {e}")))?;

        debug!(host = %config.host, "created TPAP transport");

        Ok(Self {
            host: config.host.clone(),
            config,
            http,
            state: TransportState::HandshakeRequired,
            app_url,
            ds_url: None,
            session_id: None,
            seq: None,
            cipher: None,
            discover_mac: None,
            discover_suites: None,
            discovered: false,
            noc_data: None,
        })
    }

    /// Provide NOC materials explicitly; otherwise the process-wide cache
    /// decides whether the NOC path is attempted.
    pub fn set_noc_data(&mut self, data: TpapNocData) {
        self.noc_data = Some(data);
    }

    pub(crate) fn handle_response_error_code(
        &mut self,
        resp: &Value,
        msg: &str,
    ) -> Result<(), KasaError> {
        let code = match ErrorCode::from_raw(resp.get("error_code").and_then(Value::as_i64)) {
            Ok(code) => code,
            Err(raw) => {
                warn!(host = %self.host, "device received unknown error code: {}", raw);
                ErrorCode::InternalUnknown
            }
        };
        if code.is_success() {
            return Ok(());
        }
        let err = error_for_code(code, &format!("{msg}: {}", self.host));
        if err.is_authentication() {
            self.state = TransportState::HandshakeRequired;
        }
        Err(err)
    }

    /// POST one login step and return the whole response document.
    pub(crate) async fn post_login_raw(
        &mut self,
        params: Value,
        step: &str,
    ) -> Result<Value, KasaError> {
        let body = json!({"method": "login", "params": params});
        let response = self
            .http
            .post(
                &self.app_url,
                HttpRequest::json(body).with_headers(vec![(
                    "Content-Type".to_string(),
                    "application/json".to_string(),
                )]),
            )
            .await?;
        if response.status != 200 {
            return Err(KasaError::protocol(format!(
                "{} login/{step} bad status: {}",
                self.host, response.status
            )));
        }
        response.body.as_json().cloned().ok_or_else(|| {
            KasaError::protocol(format!("{} login/{step} bad body", self.host))
        })
    }

    /// POST one login step, check the error code, and return `result`.
    pub(crate) async fn post_login(
        &mut self,
        params: Value,
        step: &str,
    ) -> Result<Value, KasaError> {
        let resp = self.post_login_raw(params, step).await?;
        self.handle_response_error_code(&resp, &format!("TPAP {step} failed"))?;
        Ok(resp.get("result").cloned().unwrap_or_else(|| json!({})))
    }

    /// Fetch MAC and advertised PAKE suites; both are optional inputs to
    /// the authenticators, so failures here are non-fatal.
    async fn perform_discover(&mut self) -> Result<(), KasaError> {
        if self.discovered {
            return Ok(());
        }
        let resp = match self
            .post_login_raw(json!({"sub_method": "discover"}), "discover")
            .await
        {
            Ok(resp) => resp,
            // Unreachable hosts are a transport problem, not a missing
            // discover endpoint.
            Err(err @ (KasaError::Connection { .. } | KasaError::Timeout { .. })) => {
                return Err(err)
            }
            Err(err) => {
                debug!(host = %self.host, "TPAP discover failed: {}", err);
                return Ok(());
            }
        };
        if let Err(err) = self.handle_response_error_code(&resp, "TPAP discover failed") {
            debug!(host = %self.host, "TPAP discover failed: {}", err);
            return Ok(());
        }
        let result = resp.get("result").cloned().unwrap_or_else(|| json!({}));
        self.discover_mac = result
            .get("mac")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(suites) = result
            .get("tpap")
            .and_then(|t| t.get("pake"))
            .and_then(Value::as_array)
        {
            let parsed: Option<Vec<i64>> = suites.iter().map(Value::as_i64).collect();
            self.discover_suites = parsed;
        }
        self.discovered = true;
        Ok(())
    }

    fn install_session(&mut self, session: TlaSession, cipher: Option<SessionCipher>) {
        let ds_url = Url::parse(&format!(
            "{}stok={}/ds",
            self.app_url, session.session_id
        ))
        .expect("app url is valid");
        self.ds_url = Some(ds_url);
        self.session_id = Some(session.session_id);
        self.seq = Some(session.start_seq);
        self.cipher = cipher;
        self.state = TransportState::Established;
    }

    async fn perform_handshake(&mut self) -> Result<(), KasaError> {
        self.perform_discover().await?;

        // NOC is used when the embedder wired cloud-issued materials in
        // (typically from the process-wide `NocClient` cache); otherwise
        // the passcode-based SPAKE2+ exchange runs.
        let noc_data = self.noc_data.clone();
        let (session, cipher) = match noc_data {
            Some(data) => self.noc_handshake(&data).await?,
            None => self.pake_handshake().await?,
        };
        self.install_session(session, cipher);
        Ok(())
    }

    async fn send_secure(&mut self, request: &str) -> Result<Value, KasaError> {
        let (Some(cipher), Some(seq), Some(ds_url)) =
            (self.cipher.clone(), self.seq, self.ds_url.clone())
        else {
            return Err(KasaError::protocol("TPAP transport is not established"));
        };

        let mut frame = Vec::with_capacity(4 + request.len() + TAG_LEN);
        frame.extend_from_slice(&seq.to_be_bytes());
        frame.extend_from_slice(
            &cipher
                .encrypt(request.as_bytes(), seq)
                .map_err(|e| KasaError::protocol(format!("unable to encrypt request: {e}")))?,
        );
        self.seq = Some(seq.wrapping_add(1));

        let response = self.http.post(&ds_url, HttpRequest::data(frame)).await?;

        if response.status == 401 || response.status == 403 {
            self.state = TransportState::HandshakeRequired;
            return Err(KasaError::Retryable {
                message: format!(
                    "got a security error from {} on secure request",
                    self.host
                ),
                error_code: None,
            });
        }
        if response.status != 200 {
            return Err(KasaError::protocol(format!(
                "{} responded with unexpected status {} on secure request",
                self.host, response.status
            )));
        }

        match response.body {
            // Some firmware replies with a plain JSON error document.
            ResponseBody::Json(resp) => {
                self.handle_response_error_code(&resp, "error sending TPAP request")?;
                Ok(resp)
            }
            ResponseBody::Bytes(raw) => {
                if raw.len() < 4 + TAG_LEN {
                    return Err(KasaError::protocol("TPAP response too short"));
                }
                let rseq = u32::from_be_bytes(raw[..4].try_into().expect("4 bytes"));
                let plaintext = cipher.decrypt(&raw[4..], rseq).map_err(|e| {
                    KasaError::protocol(format!("unable to decrypt TPAP response: {e}"))
                })?;
                serde_json::from_slice(&plaintext).map_err(|e| {
                    KasaError::protocol(format!("invalid json in TPAP response: {e}"))
                })
            }
        }
    }

    async fn send_unencrypted(&mut self, request: &str) -> Result<Value, KasaError> {
        let ds_url = self
            .ds_url
            .clone()
            .ok_or_else(|| KasaError::protocol("TPAP transport is not established"))?;
        let response = self
            .http
            .post(&ds_url, HttpRequest::json_text(request.to_string()))
            .await?;
        if response.status != 200 {
            return Err(KasaError::protocol(format!(
                "{} responded with unexpected status {} on request",
                self.host, response.status
            )));
        }
        let resp = response.body.as_json().cloned().ok_or_else(|| {
            KasaError::protocol(format!("{} sent a non-json response", self.host))
        })?;
        self.handle_response_error_code(&resp, "error sending TPAP request")?;
        Ok(resp)
    }
}

#[async_trait]
impl Transport for TpapTransport {
    fn default_port(&self) -> u16 {
        Self::DEFAULT_PORT
    }

    fn credentials_hash(&self) -> Option<String> {
        // Session material is never reusable across handshakes.
        None
    }

    async fn send(&mut self, request: &str) -> Result<Value, KasaError> {
        if self.state == TransportState::HandshakeRequired {
            self.perform_handshake().await?;
        }
        if self.cipher.is_some() {
            self.send_secure(request).await
        } else {
            self.send_unencrypted(request).await
        }
    }

    async fn close(&mut self) {
        self.reset().await;
    }

    async fn reset(&mut self) {
        self.state = TransportState::HandshakeRequired;
        self.session_id = None;
        self.seq = None;
        self.cipher = None;
        self.ds_url = None;
    }
}
