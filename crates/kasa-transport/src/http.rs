//! The HTTP port used by every HTTP-based transport.
//!
//! A thin async POST interface behind a trait so tests can script device
//! behavior. The reqwest implementation keeps the automatic cookie store
//! disabled: outgoing requests carry exactly the cookies the transport
//! passes, and cookies set by the device are only readable through
//! `get_cookie`. That keeps the jar at one session cookie per transport no
//! matter what the device sets.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use kasa_types::KasaError;

/// Request body variants, mirroring the octet/JSON split on the wire.
#[derive(Debug, Clone)]
pub enum RequestBody {
    /// Raw octet stream (KLAP frames, TPAP frames, XOR-free bodies).
    Data(Vec<u8>),
    /// JSON value serialized by the client.
    Json(Value),
    /// Pre-serialized JSON text (used where a byte-exact body is tagged).
    JsonText(String),
}

/// One POST request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub params: Vec<(String, String)>,
    pub body: RequestBody,
    pub headers: Vec<(String, String)>,
    pub cookies: Option<HashMap<String, String>>,
}

impl HttpRequest {
    pub fn data(body: Vec<u8>) -> Self {
        Self {
            params: Vec::new(),
            body: RequestBody::Data(body),
            headers: Vec::new(),
            cookies: None,
        }
    }

    pub fn json(body: Value) -> Self {
        Self {
            params: Vec::new(),
            body: RequestBody::Json(body),
            headers: Vec::new(),
            cookies: None,
        }
    }

    pub fn json_text(body: String) -> Self {
        Self {
            params: Vec::new(),
            body: RequestBody::JsonText(body),
            headers: Vec::new(),
            cookies: None,
        }
    }

    pub fn with_params(mut self, params: Vec<(String, String)>) -> Self {
        self.params = params;
        self
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_cookies(mut self, cookies: HashMap<String, String>) -> Self {
        self.cookies = Some(cookies);
        self
    }

    /// Whether the caller expects a JSON response.
    pub fn expects_json(&self) -> bool {
        matches!(self.body, RequestBody::Json(_) | RequestBody::JsonText(_))
    }
}

/// Response body: decoded JSON for JSON exchanges, raw bytes otherwise.
#[derive(Debug, Clone)]
pub enum ResponseBody {
    Bytes(Vec<u8>),
    Json(Value),
}

impl ResponseBody {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            ResponseBody::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ResponseBody::Bytes(bytes) => Some(bytes),
            ResponseBody::Json(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: ResponseBody,
}

/// The async POST port.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn post(&self, url: &Url, request: HttpRequest) -> Result<HttpResponse, KasaError>;

    /// Cookie value set by the most recent response, if any.
    fn get_cookie(&self, name: &str) -> Option<String>;
}

/// TLS behavior for the underlying client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// Plain HTTP or regular certificate validation.
    Default,
    /// Camera-class devices present self-signed certificates; hostname and
    /// chain checks are disabled for them. The legacy cipher allow-list the
    /// devices offer cannot be expressed through rustls, so this mode is
    /// the whole of the special-casing.
    SelfSigned,
}

/// reqwest-backed implementation of the port.
pub struct ReqwestClient {
    client: reqwest::Client,
    host: String,
    timeout: Duration,
    response_cookies: Mutex<HashMap<String, String>>,
}

impl ReqwestClient {
    pub fn new(host: &str, timeout: Duration, tls: TlsMode) -> Result<Self, KasaError> {
        let mut builder = reqwest::Client::builder().use_rustls_tls();
        if tls == TlsMode::SelfSigned {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| KasaError::protocol(format!("unable to build http client: {e}")))?;
        Ok(Self {
            client,
            host: host.to_string(),
            timeout,
            response_cookies: Mutex::new(HashMap::new()),
        })
    }

    fn record_set_cookies(&self, response: &reqwest::Response) {
        let mut jar = self.response_cookies.lock().expect("cookie jar lock");
        for value in response.headers().get_all(reqwest::header::SET_COOKIE) {
            let Ok(text) = value.to_str() else { continue };
            let first = text.split(';').next().unwrap_or_default();
            if let Some((name, value)) = first.split_once('=') {
                jar.insert(name.trim().to_string(), value.trim().to_string());
            }
        }
    }

    fn classify(&self, error: reqwest::Error) -> KasaError {
        if error.is_timeout() {
            return KasaError::Timeout {
                host: self.host.clone(),
                message: error.to_string(),
            };
        }
        if error.is_connect() {
            // Connection refused means nothing is listening; retrying in a
            // tight loop only blocks the executor.
            let fatal = {
                let mut source = std::error::Error::source(&error);
                let mut found = false;
                while let Some(err) = source {
                    if let Some(io) = err.downcast_ref::<std::io::Error>() {
                        if matches!(
                            io.kind(),
                            std::io::ErrorKind::ConnectionRefused
                                | std::io::ErrorKind::HostUnreachable
                                | std::io::ErrorKind::NetworkUnreachable
                        ) {
                            found = true;
                            break;
                        }
                    }
                    source = err.source();
                }
                found
            };
            return KasaError::Connection {
                host: self.host.clone(),
                message: error.to_string(),
                fatal,
            };
        }
        KasaError::protocol(format!(
            "unable to query the device: {}: {error}",
            self.host
        ))
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn post(&self, url: &Url, request: HttpRequest) -> Result<HttpResponse, KasaError> {
        let expects_json = request.expects_json();
        let mut builder = self
            .client
            .post(url.clone())
            .timeout(self.timeout)
            .query(&request.params);

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(cookies) = &request.cookies {
            let header = cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ");
            if !header.is_empty() {
                builder = builder.header(reqwest::header::COOKIE, header);
            }
        }
        let has_content_type = request
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("content-type"));
        builder = match request.body {
            RequestBody::Data(bytes) => builder.body(bytes),
            RequestBody::Json(value) => {
                if !has_content_type {
                    builder = builder.header(reqwest::header::CONTENT_TYPE, "application/json");
                }
                builder.body(value.to_string())
            }
            RequestBody::JsonText(text) => {
                if !has_content_type {
                    builder = builder.header(reqwest::header::CONTENT_TYPE, "application/json");
                }
                builder.body(text)
            }
        };

        let response = builder.send().await.map_err(|e| self.classify(e))?;
        self.record_set_cookies(&response);
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.classify(e))?
            .to_vec();

        let body = if expects_json {
            match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) => ResponseBody::Json(value),
                // Error bodies are not always JSON; leave the bytes for the
                // transport to report.
                Err(_) => ResponseBody::Bytes(bytes),
            }
        } else {
            ResponseBody::Bytes(bytes)
        };

        Ok(HttpResponse { status, body })
    }

    fn get_cookie(&self, name: &str) -> Option<String> {
        self.response_cookies
            .lock()
            .expect("cookie jar lock")
            .get(name)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_request_builders() {
        let req = HttpRequest::json(serde_json::json!({"method": "login"}))
            .with_params(vec![("seq".into(), "1".into())]);
        assert!(req.expects_json());
        assert_eq!(req.params[0].1, "1");

        let req = HttpRequest::data(vec![1, 2, 3]);
        assert!(!req.expects_json());
    }

    #[test]
    fn test_response_accessors() {
        let json = ResponseBody::Json(serde_json::json!({"a": 1}));
        assert!(json.as_json().is_some());
        assert!(json.as_bytes().is_none());
        let bytes = ResponseBody::Bytes(vec![1]);
        assert!(bytes.as_bytes().is_some());
    }

    /// Minimal HTTP/1.1 device stand-in: records each request's header
    /// block and answers with the given Set-Cookie headers.
    async fn serve(
        listener: TcpListener,
        count: usize,
        set_cookies: &'static [&'static str],
        seen: std::sync::Arc<Mutex<Vec<String>>>,
    ) {
        for _ in 0..count {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = Vec::new();
            let mut chunk = [0u8; 1024];
            let header_end = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                buffer.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos;
                }
            };
            let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
            let content_length: usize = head
                .lines()
                .find(|line| line.to_ascii_lowercase().starts_with("content-length:"))
                .and_then(|line| line.split(':').nth(1))
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0);
            while buffer.len() < header_end + 4 + content_length {
                let n = socket.read(&mut chunk).await.unwrap();
                buffer.extend_from_slice(&chunk[..n]);
            }
            seen.lock().expect("request log").push(head);

            let body = br#"{"error_code":0}"#;
            let mut response = String::from("HTTP/1.1 200 OK\r\n");
            for cookie in set_cookies {
                response.push_str(&format!("Set-Cookie: {cookie}\r\n"));
            }
            response.push_str(&format!(
                "Content-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            ));
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_cookie_discipline_over_the_wire() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let server = tokio::spawn(serve(
            listener,
            3,
            &["TP_SESSIONID=dev-set; Path=/", "TIMEOUT=86400"],
            seen.clone(),
        ));

        let client = ReqwestClient::new(
            "127.0.0.1",
            std::time::Duration::from_secs(5),
            TlsMode::Default,
        )
        .unwrap();
        let url = Url::parse(&format!("http://127.0.0.1:{port}/app")).unwrap();

        // First request carries no cookies at all.
        client
            .post(&url, HttpRequest::json(serde_json::json!({})))
            .await
            .unwrap();
        // Device-set cookies are readable but not auto-resent.
        assert_eq!(client.get_cookie("TP_SESSIONID").as_deref(), Some("dev-set"));
        assert_eq!(client.get_cookie("TIMEOUT").as_deref(), Some("86400"));

        client
            .post(&url, HttpRequest::json(serde_json::json!({})))
            .await
            .unwrap();

        // Only an explicit cookie map goes out.
        client
            .post(
                &url,
                HttpRequest::json(serde_json::json!({})).with_cookies(HashMap::from([(
                    "TP_SESSIONID".to_string(),
                    "mine".to_string(),
                )])),
            )
            .await
            .unwrap();

        server.await.unwrap();
        let seen = seen.lock().unwrap();
        assert!(!seen[0].to_ascii_lowercase().contains("cookie:"));
        // The device's cookies from the first response never accrete.
        assert!(!seen[1].to_ascii_lowercase().contains("cookie:"));
        let third = seen[2].to_ascii_lowercase();
        assert!(third.contains("cookie: tp_sessionid=mine"));
        assert!(!third.contains("timeout"));
        assert!(!third.contains("dev-set"));
    }
}
