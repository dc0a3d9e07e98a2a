//! AES transport: RSA-wrapped key exchange, then CBC passthrough.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use kasa_crypto::aes_cbc::AesSession;
use kasa_crypto::hash::sha1_hex;
use kasa_crypto::rsa_keys::RsaKeyPair;
use kasa_types::{
    error_for_code, get_default_credentials, Credentials, DeviceConfig, ErrorCode, KasaError,
    KeyPairData,
};

use crate::base::{SessionExpiry, Transport, TransportState, ONE_DAY_SECONDS};
use crate::http::{HttpClient, HttpRequest, ReqwestClient, TlsMode};

const SESSION_COOKIE_NAME: &str = "TP_SESSIONID";
const FALLBACK_SESSION_COOKIE_NAME: &str = "SESSIONID";
const TIMEOUT_COOKIE_NAME: &str = "TIMEOUT";
/// The device replies 500 to the handshake unless the content length is
/// spelled out up front.
const KEY_PAIR_CONTENT_LENGTH: usize = 314;
const BACKOFF_SECONDS_AFTER_LOGIN_ERROR: u64 = 1;

fn common_headers() -> Vec<(String, String)> {
    vec![
        ("Content-Type".into(), "application/json".into()),
        ("requestByApp".into(), "true".into()),
        ("Accept".into(), "application/json".into()),
    ]
}

pub struct AesTransport {
    config: Arc<DeviceConfig>,
    host: String,
    http: Arc<dyn HttpClient>,
    login_version: u8,
    login_params: Value,
    credentials_blank: bool,
    default_credentials: Option<Credentials>,
    state: TransportState,
    session: Option<AesSession>,
    expiry: SessionExpiry,
    session_cookie: Option<HashMap<String, String>>,
    key_pair: Option<RsaKeyPair>,
    app_url: Url,
    token_url: Option<Url>,
}

impl AesTransport {
    pub const DEFAULT_PORT: u16 = 80;

    pub fn new(config: Arc<DeviceConfig>) -> Result<Self, KasaError> {
        let http = Arc::new(ReqwestClient::new(
            &config.host,
            config.timeout,
            TlsMode::Default,
        )?);
        Self::with_http_client(config, http)
    }

    pub fn with_http_client(
        config: Arc<DeviceConfig>,
        http: Arc<dyn HttpClient>,
    ) -> Result<Self, KasaError> {
        let login_version = config.connection_type.login_version.unwrap_or(2);

        let (login_params, credentials_blank) = match (&config.credentials, &config.credentials_hash)
        {
            (Some(creds), _) => (
                Self::get_login_params(login_version, creds),
                creds.is_blank(),
            ),
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
                (Self::get_login_params(login_version, &blank), true)
            }
        };

        let key_pair = match config.aes_keys() {
            Some(keys) => Some(RsaKeyPair::from_der_b64(&keys.private, &keys.public).map_err(
                |e| KasaError::protocol(format!("cached aes keys are invalid: {e}")),
            )?),
            None => None,
        };

        let port = config.port_override.unwrap_or(Self::DEFAULT_PORT);
        let app_url = Url::parse(&format!("http://{}:{}/app", config.host, port))
            .map_err(|e| KasaError::protocol(format!("invalid device url: {e}")))?;

        debug!(host = %config.host, "created AES transport");

        Ok(Self {
            host: config.host.clone(),
            config,
            http,
            login_version,
            login_params,
            credentials_blank,
            default_credentials: None,
            state: TransportState::HandshakeRequired,
            session: None,
            expiry: SessionExpiry::default(),
            session_cookie: None,
            key_pair,
            app_url,
            token_url: None,
        })
    }

    /// Hash credentials the way the firmware's login method expects.
    pub fn hash_credentials(login_v2: bool, credentials: &Credentials) -> (String, String) {
        let username = BASE64.encode(sha1_hex(credentials.username.as_bytes()).as_bytes());
        let password = if login_v2 {
            BASE64.encode(sha1_hex(credentials.password.as_bytes()).as_bytes())
        } else {
            BASE64.encode(credentials.password.as_bytes())
        };
        (username, password)
    }

    fn get_login_params(login_version: u8, credentials: &Credentials) -> Value {
        let (username, password) = Self::hash_credentials(login_version == 2, credentials);
        if login_version == 2 {
            json!({"password2": password, "username": username})
        } else {
            json!({"password": password, "username": username})
        }
    }

    fn handle_response_error_code(&mut self, resp: &Value, msg: &str) -> Result<(), KasaError> {
        let error_code = match ErrorCode::from_raw(resp.get("error_code").and_then(Value::as_i64))
        {
            Ok(code) => code,
            Err(raw) => {
                warn!(host = %self.host, "device received unknown error code: {}", raw);
                ErrorCode::InternalUnknown
            }
        };
        if error_code.is_success() {
            return Ok(());
        }
        let err = error_for_code(error_code, &format!("{msg}: {}", self.host));
        if err.is_authentication() {
            self.state = TransportState::HandshakeRequired;
        }
        Err(err)
    }

    async fn send_secure_passthrough(&mut self, request: &str) -> Result<Value, KasaError> {
        let url = if self.state == TransportState::Established {
            self.token_url.clone().unwrap_or_else(|| self.app_url.clone())
        } else {
            self.app_url.clone()
        };

        let session = self
            .session
            .as_ref()
            .ok_or_else(|| KasaError::protocol("passthrough before handshake"))?
            .clone();
        let encrypted = session.encrypt(request.as_bytes());
        let passthrough = json!({
            "method": "securePassthrough",
            "params": {"request": encrypted},
        });

        let mut http_request = HttpRequest::json(passthrough).with_headers(common_headers());
        if let Some(cookie) = &self.session_cookie {
            http_request = http_request.with_cookies(cookie.clone());
        }
        let response = self.http.post(&url, http_request).await?;

        if response.status != 200 {
            return Err(KasaError::protocol(format!(
                "{} responded with an unexpected status code {} to passthrough",
                self.host, response.status
            )));
        }
        let resp = response.body.as_json().cloned().ok_or_else(|| {
            KasaError::protocol(format!("{} sent a non-json passthrough response", self.host))
        })?;
        self.handle_response_error_code(&resp, "error sending secure_passthrough message")?;

        let Some(raw_response) = resp
            .get("result")
            .and_then(|r| r.get("response"))
            .and_then(Value::as_str)
        else {
            return Err(KasaError::protocol(format!(
                "{} passthrough response is missing result.response",
                self.host
            )));
        };

        match session.decrypt(raw_response) {
            Ok(decrypted) => serde_json::from_str(&decrypted).map_err(|e| {
                KasaError::protocol(format!("invalid json in passthrough response: {e}"))
            }),
            Err(decrypt_err) => {
                // Devices occasionally reply unencrypted over the secure
                // passthrough.
                match serde_json::from_str(raw_response) {
                    Ok(value) => {
                        debug!(
                            host = %self.host,
                            "received unencrypted response over secure passthrough"
                        );
                        Ok(value)
                    }
                    Err(_) => Err(KasaError::protocol(format!(
                        "unable to decrypt response from {}: {decrypt_err}",
                        self.host
                    ))),
                }
            }
        }
    }

    async fn try_login(&mut self, login_params: Value) -> Result<(), KasaError> {
        let request = json!({
            "method": "login_device",
            "params": login_params,
            "request_time_milis": now_millis(),
        });
        let resp = self.send_secure_passthrough(&request.to_string()).await?;
        self.handle_response_error_code(&resp, "error logging in")?;

        let token = resp
            .get("result")
            .and_then(|r| r.get("token"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                KasaError::protocol(format!("{} login response is missing token", self.host))
            })?;
        let mut url = self.app_url.clone();
        url.set_query(Some(&format!("token={token}")));
        self.token_url = Some(url);
        self.state = TransportState::Established;
        Ok(())
    }

    async fn perform_login(&mut self) -> Result<(), KasaError> {
        match self.try_login(self.login_params.clone()).await {
            Ok(()) => {
                debug!(host = %self.host, "logged in with provided credentials");
                Ok(())
            }
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
                debug!(host = %self.host, "trying login with default TAPO credentials");
                tokio::time::sleep(Duration::from_secs(BACKOFF_SECONDS_AFTER_LOGIN_ERROR))
                    .await;
                let defaults = self
                    .default_credentials
                    .get_or_insert_with(|| get_default_credentials("TAPO"))
                    .clone();
                // After a login failure the handshake must be redone or the
                // device answers 9999 to everything.
                self.perform_handshake().await?;
                let params = Self::get_login_params(self.login_version, &defaults);
                self.try_login(params).await?;
                debug!(host = %self.host, "logged in with default TAPO credentials");
                Ok(())
            }
        }
    }

    async fn ensure_key_pair(&mut self) -> Result<(), KasaError> {
        if self.key_pair.is_some() {
            return Ok(());
        }
        debug!(host = %self.host, "generating keypair");
        let pair = tokio::task::spawn_blocking(RsaKeyPair::generate)
            .await
            .map_err(|e| KasaError::protocol(format!("key generation task failed: {e}")))?
            .map_err(|e| KasaError::protocol(format!("key generation failed: {e}")))?;
        let keys = KeyPairData {
            private: pair
                .private_key_der_b64()
                .map_err(|e| KasaError::protocol(e.to_string()))?,
            public: pair
                .public_key_der_b64()
                .map_err(|e| KasaError::protocol(e.to_string()))?,
        };
        // First writer wins; concurrent handshakes converge on one pair.
        let stored = self.config.set_aes_keys(keys);
        self.key_pair = Some(
            RsaKeyPair::from_der_b64(&stored.private, &stored.public)
                .map_err(|e| KasaError::protocol(e.to_string()))?,
        );
        Ok(())
    }

    async fn perform_handshake(&mut self) -> Result<(), KasaError> {
        debug!(host = %self.host, "will perform handshaking...");
        self.token_url = None;
        self.expiry.clear();
        self.session_cookie = None;

        self.ensure_key_pair().await?;
        let key_pair = self.key_pair.as_ref().expect("key pair ensured");
        let public_pem = key_pair
            .public_key_pem()
            .map_err(|e| KasaError::protocol(e.to_string()))?;

        let request_body = json!({"method": "handshake", "params": {"key": public_pem}});
        let mut headers = common_headers();
        headers.push((
            "Content-Length".into(),
            KEY_PAIR_CONTENT_LENGTH.to_string(),
        ));
        let response = self
            .http
            .post(
                &self.app_url,
                HttpRequest::json(request_body).with_headers(headers),
            )
            .await?;

        if response.status != 200 {
            return Err(KasaError::protocol(format!(
                "{} responded with an unexpected status code {} to handshake",
                self.host, response.status
            )));
        }
        let resp = response.body.as_json().cloned().ok_or_else(|| {
            KasaError::protocol(format!("{} sent a non-json handshake response", self.host))
        })?;
        self.handle_response_error_code(&resp, "unable to complete handshake")?;

        let handshake_key = resp
            .get("result")
            .and_then(|r| r.get("key"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                KasaError::protocol(format!("{} handshake response is missing key", self.host))
            })?;

        if let Some(cookie) = self
            .http
            .get_cookie(SESSION_COOKIE_NAME)
            .or_else(|| self.http.get_cookie(FALLBACK_SESSION_COOKIE_NAME))
        {
            self.session_cookie =
                Some(HashMap::from([(SESSION_COOKIE_NAME.to_string(), cookie)]));
        }
        let timeout = self
            .http
            .get_cookie(TIMEOUT_COOKIE_NAME)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(ONE_DAY_SECONDS);
        self.expiry.arm(timeout);

        let wrapped = BASE64
            .decode(handshake_key)
            .map_err(|_| KasaError::protocol("handshake key is not valid base64"))?;
        let key_pair = self.key_pair.as_ref().expect("key pair ensured");
        let key_and_iv = key_pair
            .decrypt_handshake_key(&wrapped)
            .map_err(|_| KasaError::protocol("unable to decrypt handshake key"))?;
        self.session = Some(
            AesSession::from_key_and_iv(&key_and_iv)
                .map_err(|e| KasaError::protocol(e.to_string()))?,
        );

        self.state = TransportState::LoginRequired;
        debug!(host = %self.host, "handshake complete");
        Ok(())
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[async_trait]
impl Transport for AesTransport {
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
        if self.state == TransportState::HandshakeRequired || self.expiry.is_expired() {
            self.perform_handshake().await?;
        }
        if self.state != TransportState::Established {
            if let Err(err) = self.perform_login().await {
                // A failed login leaves the device expecting a fresh
                // handshake.
                if err.is_authentication() {
                    self.state = TransportState::HandshakeRequired;
                }
                return Err(err);
            }
        }
        self.send_secure_passthrough(request).await
    }

    async fn close(&mut self) {
        self.reset().await;
    }

    async fn reset(&mut self) {
        self.state = TransportState::HandshakeRequired;
    }
}
