//! Protocol wrapper for devices attached behind a hub or camera.
//!
//! Every outgoing method is wrapped in a `controlChild` envelope and
//! batched under one `multipleRequest`; the child's replies come back in
//! `result.response_data` and are unwrapped before the caller sees them.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::debug;

use kasa_transport::Transport;
use kasa_types::{ErrorCode, KasaError};

use crate::smart::SmartProtocol;

/// Wrapper around the parent's protocol for one child device.
///
/// The child holds a shared handle to the parent protocol; the parent owns
/// the transport and its lifetime.
pub struct ChildProtocol<T: Transport> {
    device_id: String,
    protocol: Arc<SmartProtocol<T>>,
}

impl<T: Transport> ChildProtocol<T> {
    pub fn new(device_id: impl Into<String>, protocol: Arc<SmartProtocol<T>>) -> Self {
        Self {
            device_id: device_id.into(),
            protocol,
        }
    }

    /// Query the child; a non-success code in any sub-response raises.
    pub async fn query(&self, request: &Value, retry_count: usize) -> Result<Value, KasaError> {
        self.query_with_options(request, retry_count, true).await
    }

    /// Query the child, recording sub-response error codes instead of
    /// raising on them.
    pub async fn query_no_raise(
        &self,
        request: &Value,
        retry_count: usize,
    ) -> Result<Value, KasaError> {
        self.query_with_options(request, retry_count, false).await
    }

    async fn query_with_options(
        &self,
        request: &Value,
        retry_count: usize,
        raise_on_error: bool,
    ) -> Result<Value, KasaError> {
        let Some(request_map) = request.as_object() else {
            return Err(KasaError::protocol("child requests must be maps"));
        };

        let requests: Vec<Value> = request_map
            .iter()
            .map(|(method, params)| {
                json!({
                    "method": "controlChild",
                    "params": {
                        "childControl": {
                            "device_id": self.device_id,
                            "request_data": {method.as_str(): params},
                        }
                    }
                })
            })
            .collect();
        let multiple = json!({"multipleRequest": {"requests": requests}});

        let response = self.protocol.query(&multiple, retry_count).await?;
        debug!("child request response: {}", response);

        let responses = response
            .get("multipleRequest")
            .and_then(|m| m.get("responses"))
            .and_then(Value::as_array)
            .ok_or_else(|| {
                KasaError::protocol("child response is missing multipleRequest.responses")
            })?;

        let mut unwrapped = Map::new();
        for entry in responses {
            let response_data = entry
                .get("result")
                .and_then(|r| r.get("response_data"))
                .ok_or_else(|| {
                    KasaError::protocol("child response is missing response_data")
                })?;
            let method = response_data
                .get("method")
                .and_then(Value::as_str)
                .ok_or_else(|| KasaError::protocol("child response is missing method"))?;

            // An error can sit on the wrapper entry or inside the child's
            // own result for the method.
            let code = self
                .entry_error(entry)
                .or_else(|| self.method_error(response_data, method));
            if let Some(code) = code {
                if raise_on_error {
                    return Err(KasaError::Device {
                        message: format!(
                            "error querying child {}: {code} for method: {method}",
                            self.device_id
                        ),
                        error_code: code,
                    });
                }
                unwrapped.insert(method.to_string(), json!(code.value()));
                continue;
            }
            unwrapped.insert(
                method.to_string(),
                response_data.get(method).cloned().unwrap_or(Value::Null),
            );
        }
        Ok(Value::Object(unwrapped))
    }

    fn parse_code(&self, raw: Option<i64>) -> Option<ErrorCode> {
        let code = match ErrorCode::from_raw(raw) {
            Ok(code) => code,
            Err(_) => ErrorCode::InternalUnknown,
        };
        match code {
            ErrorCode::Success | ErrorCode::ErrorCodeNone => None,
            other => Some(other),
        }
    }

    fn entry_error(&self, entry: &Value) -> Option<ErrorCode> {
        self.parse_code(entry.get("error_code").and_then(Value::as_i64))
    }

    fn method_error(&self, response_data: &Value, method: &str) -> Option<ErrorCode> {
        self.parse_code(
            response_data
                .get(method)
                .and_then(|r| r.get("error_code"))
                .and_then(Value::as_i64),
        )
    }
}
