//! Clear-text HTTPS transport.
//!
//! Seen on robovacs behind self-signed certificates: the payloads are not
//! encrypted at all, but a login is required and the token rides on the
//! URL, as in the AES transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use kasa_crypto::hash::md5_hex;
use kasa_types::{
    error_for_code, get_default_credentials, Credentials, DeviceConfig, ErrorCode, KasaError,
};

use crate::base::{SessionExpiry, Transport, TransportState, ONE_DAY_SECONDS};
use crate::http::{HttpClient, HttpRequest, ReqwestClient, TlsMode};

const BACKOFF_SECONDS_AFTER_LOGIN_ERROR: u64 = 1;

pub struct SslTransport {
    host: String,
    http: Arc<dyn HttpClient>,
    login_params: Value,
    credentials_blank: bool,
    default_credentials: Option<Credentials>,
    state: TransportState,
    expiry: SessionExpiry,
    app_url: Url,
}

impl SslTransport {
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
        let (login_params, credentials_blank) = match (&config.credentials, &config.credentials_hash)
        {
            (Some(creds), _) => (Self::get_login_params(creds), creds.is_blank()),
            (None, Some(hash)) => {
                let decoded = BASE64.decode(hash).map_err(|_| {
                    KasaError::protocol("credentials_hash is not valid base64")
                })?;
                let params: Value = serde_json::from_slice(&decoded).map_err(|_| {
                    KasaError::protocol("credentials_hash does not decode to login params")
                })?;
                (params, false)
            }
            (None, None) => {
                let blank = Credentials::default();
                (Self::get_login_params(&blank), true)
            }
        };

        let port = config
            .port_override
            .or(config.connection_type.http_port)
            .unwrap_or(Self::DEFAULT_PORT);
        let app_url = Url::parse(&format!("https://{}:{}/app", config.host, port))
            .map_err(|e| KasaError::protocol(format!("invalid device url: {e}")))?;

        debug!(host = %config.host, "created ssl transport");

        Ok(Self {
            host: config.host.clone(),
            http,
            login_params,
            credentials_blank,
            default_credentials: None,
            state: TransportState::LoginRequired,
            expiry: SessionExpiry::default(),
            app_url,
        })
    }

    /// The password travels as an upper-case MD5 hex digest.
    pub fn hash_credentials(credentials: &Credentials) -> (String, String) {
        (
            credentials.username.clone(),
            md5_hex(credentials.password.as_bytes()),
        )
    }

    fn get_login_params(credentials: &Credentials) -> Value {
        let (username, password) = Self::hash_credentials(credentials);
        json!({"password": password.to_uppercase(), "username": username})
    }

    fn handle_response_error_code(&mut self, resp: &Value, msg: &str) -> Result<(), KasaError> {
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
            self.state = TransportState::LoginRequired;
        }
        Err(err)
    }

    async fn send_request(&mut self, request: &str) -> Result<Value, KasaError> {
        debug!(host = %self.host, "sending {} to {}", request, self.app_url);
        let response = self
            .http
            .post(
                &self.app_url,
                HttpRequest::json_text(request.to_string()),
            )
            .await?;
        if response.status != 200 {
            return Err(KasaError::protocol(format!(
                "{} responded with an unexpected status code {}",
                self.host, response.status
            )));
        }
        let resp = response.body.as_json().cloned().ok_or_else(|| {
            KasaError::protocol(format!("{} sent a non-json response", self.host))
        })?;
        self.handle_response_error_code(&resp, "error sending request")?;
        Ok(resp)
    }

    async fn try_login(&mut self, login_params: Value) -> Result<(), KasaError> {
        let request = json!({"method": "login", "params": login_params}).to_string();
        let resp = self.send_request(&request).await?;
        self.handle_response_error_code(&resp, "error logging in")?;

        let token = resp
            .get("result")
            .and_then(|r| r.get("token"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                KasaError::protocol(format!("{} login response is missing token", self.host))
            })?;
        self.app_url.set_query(Some(&format!("token={token}")));
        self.state = TransportState::Established;
        self.expiry.arm(ONE_DAY_SECONDS);
        Ok(())
    }

    async fn perform_login(&mut self) -> Result<(), KasaError> {
        match self.try_login(self.login_params.clone()).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let is_login_error = matches!(
                    &err,
                    KasaError::Authentication {
                        error_code: Some(ErrorCode::LoginError),
                        ..
                    }
                );
                if !is_login_error {
                    return Err(err);
                }
                let defaults = self
                    .default_credentials
                    .get_or_insert_with(|| get_default_credentials("TAPO"))
                    .clone();
                tokio::time::sleep(Duration::from_secs(BACKOFF_SECONDS_AFTER_LOGIN_ERROR))
                    .await;
                self.try_login(Self::get_login_params(&defaults)).await?;
                debug!(host = %self.host, "logged in with default credentials");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Transport for SslTransport {
    fn default_port(&self) -> u16 {
        Self::DEFAULT_PORT
    }

    fn credentials_hash(&self) -> Option<String> {
        if self.credentials_blank {
            return None;
        }
        Some(BASE64.encode(self.login_params.to_string().as_bytes()))
    }

    async fn send(&mut self, request: &str) -> Result<Value, KasaError> {
        if self.state != TransportState::Established || self.expiry.is_expired() {
            debug!(host = %self.host, "transport not established or session expired, logging in");
            self.perform_login().await?;
        }
        self.send_request(request).await
    }

    async fn close(&mut self) {
        self.reset().await;
    }

    async fn reset(&mut self) {
        self.state = TransportState::LoginRequired;
    }
}
