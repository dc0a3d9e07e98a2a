//! Scripted HTTP client for transport tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use url::Url;

use kasa_types::KasaError;

use crate::http::{HttpClient, HttpRequest, HttpResponse, ResponseBody};

/// A request as the mock saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: Url,
    pub request: HttpRequest,
}

/// One scripted reply.
pub struct MockResponse {
    pub status: u16,
    pub body: ResponseBody,
    pub set_cookies: Vec<(String, String)>,
}

impl MockResponse {
    pub fn json(status: u16, value: serde_json::Value) -> Self {
        Self {
            status,
            body: ResponseBody::Json(value),
            set_cookies: Vec::new(),
        }
    }

    pub fn bytes(status: u16, data: Vec<u8>) -> Self {
        Self {
            status,
            body: ResponseBody::Bytes(data),
            set_cookies: Vec::new(),
        }
    }

    pub fn with_cookie(mut self, name: &str, value: &str) -> Self {
        self.set_cookies.push((name.to_string(), value.to_string()));
        self
    }
}

type Handler =
    Box<dyn Fn(usize, &RecordedRequest) -> Result<MockResponse, KasaError> + Send + Sync>;

enum Script {
    Queue(Mutex<VecDeque<Result<MockResponse, KasaError>>>),
    Handler(Handler),
}

/// Mock implementation of the HTTP port.
///
/// Either replays a fixed queue of responses or computes each reply from
/// the observed request (needed for challenge/response handshakes). Every
/// request is recorded for assertions, including the cookies it carried.
pub struct MockHttpClient {
    script: Script,
    requests: Mutex<Vec<RecordedRequest>>,
    cookies: Mutex<HashMap<String, String>>,
    calls: Mutex<usize>,
}

impl MockHttpClient {
    pub fn from_queue(responses: Vec<Result<MockResponse, KasaError>>) -> Self {
        Self {
            script: Script::Queue(Mutex::new(responses.into_iter().collect())),
            requests: Mutex::new(Vec::new()),
            cookies: Mutex::new(HashMap::new()),
            calls: Mutex::new(0),
        }
    }

    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(usize, &RecordedRequest) -> Result<MockResponse, KasaError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            script: Script::Handler(Box::new(handler)),
            requests: Mutex::new(Vec::new()),
            cookies: Mutex::new(HashMap::new()),
            calls: Mutex::new(0),
        }
    }

    /// Number of POSTs observed.
    pub fn call_count(&self) -> usize {
        *self.calls.lock().expect("call counter lock")
    }

    /// Snapshot of all recorded requests.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("request log lock").clone()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn post(&self, url: &Url, request: HttpRequest) -> Result<HttpResponse, KasaError> {
        let recorded = RecordedRequest {
            url: url.clone(),
            request,
        };
        let index = {
            let mut calls = self.calls.lock().expect("call counter lock");
            let index = *calls;
            *calls += 1;
            index
        };
        self.requests
            .lock()
            .expect("request log lock")
            .push(recorded.clone());

        let result = match &self.script {
            Script::Queue(queue) => queue
                .lock()
                .expect("script queue lock")
                .pop_front()
                .unwrap_or_else(|| {
                    Err(KasaError::protocol("mock http client script exhausted"))
                }),
            Script::Handler(handler) => handler(index, &recorded),
        };

        let response = result?;
        {
            let mut jar = self.cookies.lock().expect("cookie jar lock");
            for (name, value) in &response.set_cookies {
                jar.insert(name.clone(), value.clone());
            }
        }
        Ok(HttpResponse {
            status: response.status,
            body: response.body,
        })
    }

    fn get_cookie(&self, name: &str) -> Option<String> {
        self.cookies
            .lock()
            .expect("cookie jar lock")
            .get(name)
            .cloned()
    }
}
