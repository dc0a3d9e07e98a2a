//! The SMART protocol: JSON envelope, batching and the retry policy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use kasa_crypto::hash::md5;
use kasa_transport::Transport;
use kasa_types::{error_for_code, ErrorCode, KasaError};

use crate::redact::{redact_data, DEFAULT_REDACTORS};
use crate::snowflake;

pub const DEFAULT_RETRY_COUNT: usize = 3;
pub const DEFAULT_MULTI_REQUEST_BATCH_SIZE: usize = 5;
const BACKOFF_SECONDS_AFTER_TIMEOUT: u64 = 1;

/// Protocol for the newer firmware generations.
///
/// One query at a time per transport: handshakes and sequence counters are
/// not re-entrant, so a single lock serializes concurrent callers.
pub struct SmartProtocol<T: Transport> {
    host: String,
    transport: Mutex<T>,
    terminal_uuid: String,
    batch_size: AtomicUsize,
    redact: bool,
}

impl<T: Transport> SmartProtocol<T> {
    pub fn new(host: impl Into<String>, transport: T) -> Self {
        let terminal_uuid = BASE64.encode(md5(uuid::Uuid::new_v4().as_bytes()));
        Self {
            host: host.into(),
            transport: Mutex::new(transport),
            terminal_uuid,
            batch_size: AtomicUsize::new(DEFAULT_MULTI_REQUEST_BATCH_SIZE),
            redact: true,
        }
    }

    /// Disable debug-log redaction (development only).
    pub fn with_redaction_disabled(mut self) -> Self {
        self.redact = false;
        self
    }

    /// Credential material of the underlying transport, for persistence.
    pub async fn credentials_hash(&self) -> Option<String> {
        self.transport.lock().await.credentials_hash()
    }

    fn get_smart_request(&self, method: &str, params: Option<&Value>) -> String {
        json!({
            "method": method,
            "params": params,
            "requestID": snowflake::next_id(),
            "request_time_milis": now_millis(),
            "terminal_uuid": self.terminal_uuid,
        })
        .to_string()
    }

    fn debug_value(&self, value: &Value) -> Value {
        if self.redact {
            redact_data(value, DEFAULT_REDACTORS)
        } else {
            value.clone()
        }
    }

    fn response_code(&self, resp: &Value) -> ErrorCode {
        match ErrorCode::from_raw(resp.get("error_code").and_then(Value::as_i64)) {
            Ok(code) => code,
            Err(raw) => {
                warn!(host = %self.host, "device received unknown error code: {}", raw);
                ErrorCode::InternalUnknown
            }
        }
    }

    fn raise_for_response(&self, resp: &Value, method: &str) -> Result<(), KasaError> {
        let code = self.response_code(resp);
        if code.is_success() {
            return Ok(());
        }
        Err(error_for_code(
            code,
            &format!("Error querying device: {} for method: {method}", self.host),
        ))
    }

    async fn send_request(
        &self,
        transport: &mut T,
        method: &str,
        params: Option<&Value>,
    ) -> Result<Value, KasaError> {
        let smart_request = self.get_smart_request(method, params);
        if tracing::enabled!(tracing::Level::DEBUG) {
            let parsed: Value =
                serde_json::from_str(&smart_request).expect("own serialization");
            debug!(host = %self.host, ">> {}", self.debug_value(&parsed));
        }
        let response = transport.send(&smart_request).await?;
        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!(host = %self.host, "<< {}", self.debug_value(&response));
        }
        Ok(response)
    }

    /// Query the device, retrying per the error-class policy.
    pub async fn query(&self, request: &Value, retry_count: usize) -> Result<Value, KasaError> {
        let mut transport = self.transport.lock().await;
        self.query_locked(&mut transport, request, retry_count).await
    }

    pub(crate) async fn query_locked(
        &self,
        transport: &mut T,
        request: &Value,
        retry_count: usize,
    ) -> Result<Value, KasaError> {
        for retry in 0..=retry_count {
            let err = match self.execute_query(transport, request).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if err.is_authentication() {
                transport.close().await;
                debug!(host = %self.host, "unable to authenticate, not retrying");
                return Err(err);
            }
            if !err.is_retryable() {
                transport.close().await;
                debug!(host = %self.host, "unable to query the device, not retrying: {}", err);
                return Err(err);
            }
            if retry >= retry_count {
                transport.close().await;
                debug!(host = %self.host, "giving up after {} retries", retry);
                return Err(err);
            }
            if matches!(
                err,
                KasaError::Timeout { .. } | KasaError::DeviceTimeout { .. }
            ) {
                tokio::time::sleep(Duration::from_secs(BACKOFF_SECONDS_AFTER_TIMEOUT)).await;
            }
        }
        unreachable!("retry loop always returns")
    }

    async fn execute_query(&self, transport: &mut T, request: &Value) -> Result<Value, KasaError> {
        let (method, params) = match request {
            Value::Object(map) if map.len() > 1 => {
                return self.execute_multiple_query(transport, map).await;
            }
            Value::Object(map) => {
                let (method, params) = map.iter().next().ok_or_else(|| {
                    KasaError::protocol("query requires at least one method")
                })?;
                (method.as_str(), Some(params))
            }
            Value::String(method) => (method.as_str(), None),
            _ => {
                return Err(KasaError::protocol(
                    "query request must be a method name or a map",
                ))
            }
        };
        let params = params.filter(|p| !p.is_null());

        if method == "multipleRequest" {
            // An explicit multipleRequest (the child wrapper builds these)
            // is passed through untouched: its sub-methods may repeat, so
            // stitching by method would lose responses.
            let resp = self.send_request(transport, method, params).await?;
            self.raise_for_response(&resp, method)?;
            let result = resp.get("result").cloned().unwrap_or(Value::Null);
            return Ok(json!({method: result}));
        }

        let resp = self.send_request(transport, method, params).await?;
        self.raise_for_response(&resp, method)?;

        let Some(result) = resp.get("result") else {
            // Single set_ requests do not return a result.
            return Ok(json!({method: null}));
        };
        let mut result = result.clone();
        self.fetch_remaining_pages(transport, method, &mut result)
            .await?;
        Ok(json!({method: result}))
    }

    async fn execute_multiple_query(
        &self,
        transport: &mut T,
        request: &Map<String, Value>,
    ) -> Result<Value, KasaError> {
        let batch_size = self.batch_size.load(Ordering::Relaxed);
        let entries: Vec<(&String, &Value)> = request.iter().collect();
        let mut multi_result = Map::new();

        for chunk in entries.chunks(batch_size) {
            let requests: Vec<Value> = chunk
                .iter()
                .map(|(method, params)| {
                    if params.is_null() {
                        json!({"method": method})
                    } else {
                        json!({"method": method, "params": params})
                    }
                })
                .collect();
            let params = json!({"requests": requests});
            let resp = self
                .send_request(transport, "multipleRequest", Some(&params))
                .await?;

            let code = self.response_code(&resp);
            if code == ErrorCode::JsonDecodeFail && batch_size > 1 {
                // The device could not parse a batch this large; fall back
                // to single-request batches for the rest of this session.
                self.batch_size.store(1, Ordering::Relaxed);
                warn!(
                    host = %self.host,
                    "device returned JSON_DECODE_FAIL for a multi-request, \
                     retrying with individual requests"
                );
                return Err(KasaError::Retryable {
                    message: format!(
                        "device {} could not decode a batched request",
                        self.host
                    ),
                    error_code: Some(code),
                });
            }
            self.raise_for_response(&resp, "multipleRequest")?;

            let responses = resp
                .get("result")
                .and_then(|r| r.get("responses"))
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    KasaError::protocol(format!(
                        "{} multipleRequest response is missing responses",
                        self.host
                    ))
                })?;

            for response in responses {
                let Some(method) = response.get("method").and_then(Value::as_str) else {
                    return Err(KasaError::protocol(format!(
                        "{} multipleRequest sub-response is missing method",
                        self.host
                    )));
                };
                let code = self.response_code(response);
                if code.is_success() {
                    let mut result = response.get("result").cloned().unwrap_or(Value::Null);
                    self.fetch_remaining_pages(transport, method, &mut result)
                        .await?;
                    multi_result.insert(method.to_string(), result);
                } else if code.is_retryable() || code.is_timeout() || code.is_authentication() {
                    // Codes that invalidate the whole exchange bubble up so
                    // the retry loop (or the caller) can deal with them.
                    return Err(error_for_code(
                        code,
                        &format!("Error querying device: {} for method: {method}", self.host),
                    ));
                } else {
                    // A partial failure must not mask the siblings.
                    multi_result.insert(method.to_string(), json!(code.value()));
                }
            }
        }
        Ok(Value::Object(multi_result))
    }

    /// Devices page large list responses; keep requesting until `sum` rows
    /// have arrived.
    async fn fetch_remaining_pages(
        &self,
        transport: &mut T,
        method: &str,
        result: &mut Value,
    ) -> Result<(), KasaError> {
        let Some(result_map) = result.as_object() else {
            return Ok(());
        };
        let (Some(sum), true) = (
            result_map.get("sum").and_then(Value::as_u64),
            result_map.contains_key("start_index"),
        ) else {
            return Ok(());
        };
        let Some(list_key) = result_map
            .iter()
            .find(|(_, value)| value.is_array())
            .map(|(key, _)| key.clone())
        else {
            return Ok(());
        };

        let mut sum = sum as usize;
        loop {
            let collected = result[list_key.as_str()]
                .as_array()
                .map(Vec::len)
                .unwrap_or(0);
            if collected >= sum {
                break;
            }
            let params = json!({"start_index": collected});
            let resp = self.send_request(transport, method, Some(&params)).await?;
            self.raise_for_response(&resp, method)?;
            let next_batch = resp
                .get("result")
                .and_then(|r| r.get(list_key.as_str()))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if next_batch.is_empty() {
                warn!(
                    host = %self.host,
                    "device under-reported rows for {}: expected {}, got {}",
                    method, sum, collected
                );
                sum = collected;
                break;
            }
            if let Some(rows) = result[list_key.as_str()].as_array_mut() {
                rows.extend(next_batch);
            }
        }
        result["sum"] = json!(sum);
        Ok(())
    }

    pub async fn close(&self) {
        self.transport.lock().await.close().await;
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    /// Transport driven by a closure, counting sends and closes.
    pub(crate) struct MockTransport {
        script: Box<dyn FnMut(&str) -> Result<Value, KasaError> + Send>,
        pub sends: Arc<AtomicUsize>,
        pub closes: Arc<AtomicUsize>,
    }

    impl MockTransport {
        pub fn new(
            script: impl FnMut(&str) -> Result<Value, KasaError> + Send + 'static,
        ) -> Self {
            Self {
                script: Box::new(script),
                sends: Arc::new(AtomicUsize::new(0)),
                closes: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn default_port(&self) -> u16 {
            80
        }

        fn credentials_hash(&self) -> Option<String> {
            None
        }

        async fn send(&mut self, request: &str) -> Result<Value, KasaError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            (self.script)(request)
        }

        async fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        async fn reset(&mut self) {}
    }

    /// Device answering each method through `per_method`, with full
    /// multipleRequest support.
    pub(crate) fn smart_device(
        mut per_method: impl FnMut(&str, Option<&Value>) -> (i64, Value) + Send + 'static,
    ) -> impl FnMut(&str) -> Result<Value, KasaError> + Send + 'static {
        move |request: &str| {
            let request: Value = serde_json::from_str(request).expect("valid json request");
            let method = request["method"].as_str().expect("method present");
            if method == "multipleRequest" {
                let mut responses = Vec::new();
                for sub in request["params"]["requests"].as_array().expect("requests") {
                    let sub_method = sub["method"].as_str().expect("sub method");
                    let (code, result) = per_method(sub_method, sub.get("params"));
                    responses.push(json!({
                        "method": sub_method,
                        "error_code": code,
                        "result": result,
                    }));
                }
                return Ok(json!({
                    "error_code": 0,
                    "result": {"responses": responses},
                }));
            }
            let (code, result) = per_method(method, request.get("params"));
            Ok(json!({"error_code": code, "result": result}))
        }
    }

    #[tokio::test]
    async fn test_envelope_fields() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        let transport = MockTransport::new(move |request| {
            seen_in.lock().unwrap().push(request.to_string());
            Ok(json!({"error_code": 0, "result": {"model": "P110"}}))
        });
        let protocol = SmartProtocol::new("127.0.0.1", transport);

        protocol
            .query(&json!({"get_device_info": null}), 1)
            .await
            .unwrap();
        protocol
            .query(&json!({"get_device_info": null}), 1)
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        let first: Value = serde_json::from_str(&seen[0]).unwrap();
        let second: Value = serde_json::from_str(&seen[1]).unwrap();
        assert_eq!(first["method"], "get_device_info");
        assert_eq!(first["params"], Value::Null);
        assert!(first["request_time_milis"].as_u64().unwrap() > 0);
        // Snowflake ids are monotonic; the terminal uuid is stable.
        assert!(second["requestID"].as_u64().unwrap() > first["requestID"].as_u64().unwrap());
        assert_eq!(first["terminal_uuid"], second["terminal_uuid"]);
    }

    #[tokio::test]
    async fn test_single_query_unwraps_result() {
        let transport = MockTransport::new(smart_device(|method, _| {
            assert_eq!(method, "get_device_info");
            (0, json!({"model": "P110"}))
        }));
        let protocol = SmartProtocol::new("127.0.0.1", transport);
        let result = protocol
            .query(&json!({"get_device_info": null}), 0)
            .await
            .unwrap();
        assert_eq!(result, json!({"get_device_info": {"model": "P110"}}));
    }

    #[tokio::test]
    async fn test_multi_request_batches_by_size() {
        let batches = Arc::new(std::sync::Mutex::new(Vec::new()));
        let batches_in = batches.clone();
        let transport = MockTransport::new(move |request| {
            let request: Value = serde_json::from_str(request).unwrap();
            let count = request["params"]["requests"].as_array().unwrap().len();
            batches_in.lock().unwrap().push(count);
            let responses: Vec<Value> = request["params"]["requests"]
                .as_array()
                .unwrap()
                .iter()
                .map(|sub| {
                    json!({
                        "method": sub["method"],
                        "error_code": 0,
                        "result": {"ok": true},
                    })
                })
                .collect();
            Ok(json!({"error_code": 0, "result": {"responses": responses}}))
        });
        let protocol = SmartProtocol::new("127.0.0.1", transport);

        // Seven methods with the default batch size of five.
        let request = json!({
            "m1": null, "m2": null, "m3": null, "m4": null,
            "m5": null, "m6": null, "m7": null,
        });
        let result = protocol.query(&request, 0).await.unwrap();
        assert_eq!(result.as_object().unwrap().len(), 7);
        assert_eq!(*batches.lock().unwrap(), vec![5, 2]);
    }

    #[tokio::test]
    async fn test_explicit_multiple_request_passes_through() {
        // Sub-methods can repeat in a caller-built multipleRequest, so the
        // responses list must come back unstitched.
        let transport = MockTransport::new(smart_device(|method, _| {
            assert_eq!(method, "controlChild");
            (0, json!({"response_data": {"method": "get_device_info"}}))
        }));
        let protocol = SmartProtocol::new("127.0.0.1", transport);
        let request = json!({"multipleRequest": {"requests": [
            {"method": "controlChild", "params": {"childControl": {}}},
            {"method": "controlChild", "params": {"childControl": {}}},
        ]}});
        let result = protocol.query(&request, 0).await.unwrap();
        let responses = result["multipleRequest"]["responses"].as_array().unwrap();
        assert_eq!(responses.len(), 2);
    }

    #[tokio::test]
    async fn test_multi_request_partial_failure() {
        let transport = MockTransport::new(smart_device(|method, _| {
            if method == "set_state" {
                (ErrorCode::ParamsError.value(), Value::Null)
            } else {
                (0, json!({"model": "P110"}))
            }
        }));
        let protocol = SmartProtocol::new("127.0.0.1", transport);
        let result = protocol
            .query(&json!({"get_device_info": null, "set_state": {"state": 1}}), 0)
            .await
            .unwrap();
        // The failing method carries the error code; siblings are intact.
        assert_eq!(result["get_device_info"], json!({"model": "P110"}));
        assert_eq!(result["set_state"], json!(ErrorCode::ParamsError.value()));
    }

    #[tokio::test]
    async fn test_json_decode_fail_lowers_batch_size() {
        let batch_sizes = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sizes_in = batch_sizes.clone();
        let transport = MockTransport::new(move |request| {
            let request: Value = serde_json::from_str(request).unwrap();
            let requests = request["params"]["requests"].as_array().unwrap();
            sizes_in.lock().unwrap().push(requests.len());
            if requests.len() > 1 {
                return Ok(json!({"error_code": ErrorCode::JsonDecodeFail.value()}));
            }
            let responses: Vec<Value> = requests
                .iter()
                .map(|sub| json!({"method": sub["method"], "error_code": 0, "result": {}}))
                .collect();
            Ok(json!({"error_code": 0, "result": {"responses": responses}}))
        });
        let protocol = SmartProtocol::new("127.0.0.1", transport);
        let result = protocol
            .query(&json!({"m1": null, "m2": null}), 1)
            .await
            .unwrap();
        assert_eq!(result.as_object().unwrap().len(), 2);
        // First attempt batched both, the retry went one by one.
        assert_eq!(*batch_sizes.lock().unwrap(), vec![2, 1, 1]);
    }

    #[tokio::test]
    async fn test_list_responses_are_paged() {
        let transport = MockTransport::new(smart_device(|method, params| {
            assert_eq!(method, "get_child_device_list");
            let start = params
                .and_then(|p| p.get("start_index"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let rows: Vec<Value> = (start..(start + 2).min(5))
                .map(|i| json!({"device_id": format!("child-{i}")}))
                .collect();
            (
                0,
                json!({"child_device_list": rows, "start_index": start, "sum": 5}),
            )
        }));
        let protocol = SmartProtocol::new("127.0.0.1", transport);
        let result = protocol
            .query(&json!({"get_child_device_list": {"start_index": 0}}), 0)
            .await
            .unwrap();
        let rows = result["get_child_device_list"]["child_device_list"]
            .as_array()
            .unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[4]["device_id"], "child-4");
    }

    #[tokio::test]
    async fn test_under_reported_sum_is_normalized() {
        let transport = MockTransport::new(smart_device(|_, params| {
            let start = params
                .and_then(|p| p.get("start_index"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            // Claims ten rows but only ever produces three.
            let rows: Vec<Value> = (start..3u64.max(start))
                .map(|i| json!({"id": i}))
                .collect();
            (0, json!({"rows": rows, "start_index": start, "sum": 10}))
        }));
        let protocol = SmartProtocol::new("127.0.0.1", transport);
        let result = protocol
            .query(&json!({"get_rows": {"start_index": 0}}), 0)
            .await
            .unwrap();
        assert_eq!(result["get_rows"]["rows"].as_array().unwrap().len(), 3);
        assert_eq!(result["get_rows"]["sum"], json!(3));
    }

    async fn attempts_for(error: impl Fn() -> KasaError + Send + Sync + 'static) -> (usize, usize) {
        let transport = MockTransport::new(move |_| Err(error()));
        let sends = transport.sends.clone();
        let closes = transport.closes.clone();
        let protocol = SmartProtocol::new("127.0.0.1", transport);
        let _ = protocol.query(&json!({"get_device_info": null}), 3).await;
        (sends.load(Ordering::SeqCst), closes.load(Ordering::SeqCst))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_policy_attempt_counts() {
        // Retryable kinds: retry_count + 1 attempts, then close.
        let (sends, closes) = attempts_for(|| KasaError::Retryable {
            message: "retryable".into(),
            error_code: Some(ErrorCode::Unspecific),
        })
        .await;
        assert_eq!((sends, closes), (4, 1));

        let (sends, _) = attempts_for(|| KasaError::Connection {
            host: "h".into(),
            message: "down".into(),
            fatal: false,
        })
        .await;
        assert_eq!(sends, 4);

        // Timeouts retry with backoff (virtual time).
        let (sends, _) = attempts_for(|| KasaError::Timeout {
            host: "h".into(),
            message: "slow".into(),
        })
        .await;
        assert_eq!(sends, 4);

        // Authentication never retries.
        let (sends, closes) = attempts_for(|| KasaError::Authentication {
            message: "denied".into(),
            error_code: Some(ErrorCode::LoginError),
        })
        .await;
        assert_eq!((sends, closes), (1, 1));

        // Fatal connection errors and device errors never retry.
        let (sends, _) = attempts_for(|| KasaError::Connection {
            host: "h".into(),
            message: "refused".into(),
            fatal: true,
        })
        .await;
        assert_eq!(sends, 1);

        let (sends, closes) = attempts_for(|| KasaError::Device {
            message: "bad params".into(),
            error_code: ErrorCode::ParamsError,
        })
        .await;
        assert_eq!((sends, closes), (1, 1));
    }

    #[tokio::test]
    async fn test_device_error_code_surfaces() {
        let transport = MockTransport::new(smart_device(|_, _| {
            (ErrorCode::DeviceBlocked.value(), Value::Null)
        }));
        let protocol = SmartProtocol::new("127.0.0.1", transport);
        let err = protocol
            .query(&json!({"get_device_info": null}), 3)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), Some(ErrorCode::DeviceBlocked));
        assert!(err.to_string().contains("get_device_info"));
    }

    #[tokio::test]
    async fn test_unknown_error_code_absorbed() {
        let transport = MockTransport::new(|_| Ok(json!({"error_code": -987654})));
        let protocol = SmartProtocol::new("127.0.0.1", transport);
        let err = protocol
            .query(&json!({"get_device_info": null}), 0)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), Some(ErrorCode::InternalUnknown));
    }
}
