use crate::config::TargetConfig;
use crate::input::Input;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Upper bound on how much response text is kept as error evidence.
pub const MAX_ERROR_TEXT_BYTES: usize = 4096;

/// Keywords that make a non-error response body worth keeping as error text.
const ERROR_BODY_KEYWORDS: [&str; 4] = ["error", "exception", "traceback", "stack trace"];

/// How a single target invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    /// The target answered with this status code.
    Http(u16),
    /// No complete answer arrived before the per-request timeout.
    Timeout,
    /// The transport failed: refused, reset, DNS, TLS, malformed response.
    ConnectionError,
}

impl ResponseStatus {
    pub fn code(&self) -> Option<u16> {
        match self {
            ResponseStatus::Http(code) => Some(*code),
            _ => None,
        }
    }
}

/// Normalized result of one target invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status: ResponseStatus,
    pub response_size: usize,
    pub elapsed: Duration,
    pub error_text: Option<String>,
}

impl Outcome {
    pub fn http(code: u16, response_size: usize, elapsed: Duration) -> Self {
        Self {
            status: ResponseStatus::Http(code),
            response_size,
            elapsed,
            error_text: None,
        }
    }

    pub fn timeout(elapsed: Duration) -> Self {
        Self {
            status: ResponseStatus::Timeout,
            response_size: 0,
            elapsed,
            error_text: None,
        }
    }

    pub fn connection_error(elapsed: Duration, error_text: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::ConnectionError,
            response_size: 0,
            elapsed,
            error_text: Some(error_text.into()),
        }
    }

    pub fn with_error_text(mut self, error_text: impl Into<String>) -> Self {
        self.error_text = Some(error_text.into());
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.status == ResponseStatus::Timeout
    }

    pub fn is_transport_failure(&self) -> bool {
        self.status == ResponseStatus::ConnectionError
    }
}

/// Sends one payload to the system under test.
///
/// Implementations make exactly one attempt per call and never retry: a
/// failed call is reported as an [`Outcome`], not as an error. The fuzz loop
/// shares one executor between its workers, hence `Send + Sync`.
pub trait Executor: Send + Sync {
    fn execute(&self, input: &Input, timeout: Duration) -> Outcome;
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Invalid HTTP method {0:?}")]
    InvalidMethod(String),
    #[error("Invalid header {name:?}: {reason}")]
    InvalidHeader { name: String, reason: String },
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Delivers payloads as HTTP requests to a single configured endpoint.
pub struct HttpExecutor {
    client: Client,
    url: String,
    method: Method,
    headers: HeaderMap,
}

impl HttpExecutor {
    pub fn new(config: &TargetConfig) -> Result<Self, ExecutorError> {
        let method = Method::from_bytes(config.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| ExecutorError::InvalidMethod(config.method.clone()))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                ExecutorError::InvalidHeader {
                    name: name.clone(),
                    reason: e.to_string(),
                }
            })?;
            let header_value =
                HeaderValue::from_str(value).map_err(|e| ExecutorError::InvalidHeader {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            headers.insert(header_name, header_value);
        }
        if !headers.contains_key(CONTENT_TYPE) {
            let content_type = HeaderValue::from_str(&config.content_type).map_err(|e| {
                ExecutorError::InvalidHeader {
                    name: CONTENT_TYPE.to_string(),
                    reason: e.to_string(),
                }
            })?;
            headers.insert(CONTENT_TYPE, content_type);
        }

        // Timeouts are applied per request so the loop controls them.
        let mut builder = Client::builder();
        if !config.use_env_proxy {
            builder = builder.no_proxy();
        }
        let client = builder.build()?;

        Ok(Self {
            client,
            url: config.url.clone(),
            method,
            headers,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn classify_transport_error(err: &reqwest::Error, elapsed: Duration) -> Outcome {
        if err.is_timeout() {
            Outcome::timeout(elapsed)
        } else {
            Outcome::connection_error(elapsed, err.to_string())
        }
    }
}

impl Executor for HttpExecutor {
    fn execute(&self, input: &Input, timeout: Duration) -> Outcome {
        let request = self
            .client
            .request(self.method.clone(), &self.url)
            .headers(self.headers.clone())
            .timeout(timeout);
        let request = if self.method == Method::GET {
            let data = String::from_utf8_lossy(input.as_bytes()).into_owned();
            request.query(&[("data", data)])
        } else {
            request.body(input.to_vec())
        };

        let start = Instant::now();
        let response = match request.send() {
            Ok(response) => response,
            Err(e) => return Self::classify_transport_error(&e, start.elapsed()),
        };
        let code = response.status().as_u16();
        let body = match response.bytes() {
            Ok(body) => body,
            Err(e) => return Self::classify_transport_error(&e, start.elapsed()),
        };

        let outcome = Outcome::http(code, body.len(), start.elapsed());
        match extract_error_text(code, &body) {
            Some(text) => outcome.with_error_text(text),
            None => outcome,
        }
    }
}

/// Keeps the response body as error evidence when the status or the body
/// itself indicates a failure.
pub fn extract_error_text(code: u16, body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    let capped = &body[..body.len().min(MAX_ERROR_TEXT_BYTES)];
    let text = String::from_utf8_lossy(capped);
    let lowered = text.to_ascii_lowercase();
    if code >= 400 || ERROR_BODY_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        Some(text.into_owned())
    } else {
        None
    }
}

/// What an in-process harness answers for one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReply {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HarnessReply {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Runs a request handler in the fuzzer's own process.
///
/// A panicking harness is reported as status 500 with the panic message as
/// error text. The harness cannot be interrupted, so a call that overruns the
/// timeout is reported as a timeout after it returns.
pub struct InProcessExecutor<F>
where
    F: Fn(&[u8]) -> HarnessReply,
{
    harness_fn: F,
}

impl<F> InProcessExecutor<F>
where
    F: Fn(&[u8]) -> HarnessReply,
{
    pub fn new(harness_fn: F) -> Self {
        Self { harness_fn }
    }
}

impl<F> Executor for InProcessExecutor<F>
where
    F: Fn(&[u8]) -> HarnessReply + Send + Sync,
{
    fn execute(&self, input: &Input, timeout: Duration) -> Outcome {
        let start = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| (self.harness_fn)(input.as_bytes())));
        let elapsed = start.elapsed();

        if elapsed > timeout {
            return Outcome::timeout(elapsed);
        }

        match result {
            Ok(reply) => {
                let outcome = Outcome::http(reply.status, reply.body.len(), elapsed);
                match extract_error_text(reply.status, &reply.body) {
                    Some(text) => outcome.with_error_text(text),
                    None => outcome,
                }
            }
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic type".to_string()
                };
                Outcome::http(500, msg.len(), elapsed).with_error_text(msg)
            }
        }
    }
}

#[cfg(test)]
mod in_process_executor_tests {
    use super::*;

    fn echo_harness(data: &[u8]) -> HarnessReply {
        HarnessReply::new(200, data.to_vec())
    }

    fn panicking_harness(data: &[u8]) -> HarnessReply {
        if data.first() == Some(&0xFF) {
            panic!("Boom!");
        }
        HarnessReply::new(200, "ok")
    }

    #[test]
    fn in_process_executor_reports_status_and_size() {
        let executor = InProcessExecutor::new(echo_harness);
        let outcome = executor.execute(&Input::from("hello"), Duration::from_secs(1));
        assert_eq!(outcome.status, ResponseStatus::Http(200));
        assert_eq!(outcome.response_size, 5);
        assert_eq!(outcome.error_text, None);
    }

    #[test]
    fn in_process_executor_turns_panic_into_server_error() {
        let executor = InProcessExecutor::new(panicking_harness);
        let outcome = executor.execute(&Input::from(vec![0xFF]), Duration::from_secs(1));
        assert_eq!(outcome.status, ResponseStatus::Http(500));
        match outcome.error_text {
            Some(text) => assert!(text.contains("Boom!")),
            None => panic!("Expected panic message as error text, got {outcome:?}"),
        }
    }

    #[test]
    fn in_process_executor_reports_overrun_as_timeout() {
        let executor = InProcessExecutor::new(|_data: &[u8]| {
            std::thread::sleep(Duration::from_millis(30));
            HarnessReply::new(200, "late")
        });
        let outcome = executor.execute(&Input::from("x"), Duration::from_millis(5));
        assert!(outcome.is_timeout(), "Expected timeout, got {outcome:?}");
    }

    #[test]
    fn error_text_is_kept_for_failures_and_error_bodies_only() {
        assert_eq!(extract_error_text(200, b"{\"ok\":true}"), None);
        assert_eq!(extract_error_text(500, b""), None);
        assert_eq!(
            extract_error_text(400, b"missing field"),
            Some("missing field".to_string())
        );
        assert_eq!(
            extract_error_text(200, b"{\"error\": \"bad\"}"),
            Some("{\"error\": \"bad\"}".to_string())
        );
        let huge = vec![b'e'; MAX_ERROR_TEXT_BYTES * 2];
        let kept = extract_error_text(500, &huge).unwrap();
        assert_eq!(kept.len(), MAX_ERROR_TEXT_BYTES);
    }
}

#[cfg(test)]
mod http_executor_tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn target_config(url: String) -> TargetConfig {
        TargetConfig {
            url,
            ..TargetConfig::default()
        }
    }

    /// Reads one request (headers plus content-length body) from the stream.
    fn read_request(stream: &mut std::net::TcpStream) -> Vec<u8> {
        let mut request = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).unwrap_or(0);
            if n == 0 {
                return request;
            }
            request.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&request).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let lower = line.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                    })
                    .unwrap_or(0);
                if request.len() >= header_end + 4 + content_length {
                    return request;
                }
            }
        }
    }

    /// Serves `responses` one connection at a time, returning what each
    /// request contained.
    fn spawn_stub_server(
        responses: Vec<(u16, &'static str)>,
    ) -> (String, thread::JoinHandle<Vec<Vec<u8>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/api/parse", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            for (code, body) in responses {
                let (mut stream, _) = listener.accept().unwrap();
                seen.push(read_request(&mut stream));
                let reply = format!(
                    "HTTP/1.1 {code} Stub\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(reply.as_bytes()).unwrap();
            }
            seen
        });
        (url, handle)
    }

    #[test]
    fn http_executor_posts_payload_and_reports_status() {
        let (url, server) = spawn_stub_server(vec![(200, "{\"ok\":true}")]);
        let executor = HttpExecutor::new(&target_config(url)).unwrap();

        let outcome = executor.execute(&Input::from("{\"value\": 42}"), Duration::from_secs(5));
        assert_eq!(outcome.status, ResponseStatus::Http(200));
        assert_eq!(outcome.response_size, 11);
        assert_eq!(outcome.error_text, None);

        let requests = server.join().unwrap();
        let request = String::from_utf8_lossy(&requests[0]).to_string();
        assert!(request.starts_with("POST /api/parse"), "got {request}");
        assert!(request.to_ascii_lowercase().contains("content-type: application/json"));
        assert!(request.ends_with("{\"value\": 42}"));
    }

    #[test]
    fn http_executor_sends_get_payload_as_data_query_parameter() {
        let (url, server) = spawn_stub_server(vec![(200, "ok")]);
        let config = TargetConfig {
            method: "get".to_string(),
            ..target_config(url)
        };
        let executor = HttpExecutor::new(&config).unwrap();

        let outcome = executor.execute(&Input::from("{\"a\":1}"), Duration::from_secs(5));
        assert_eq!(outcome.status, ResponseStatus::Http(200));

        let requests = server.join().unwrap();
        let request = String::from_utf8_lossy(&requests[0]).to_string();
        assert!(
            request.starts_with("GET /api/parse?data=%7B%22a%22%3A1%7D HTTP/1.1\r\n"),
            "got {request}"
        );
        assert!(request.ends_with("\r\n\r\n"), "GET must not carry a body: {request}");
    }

    #[test]
    fn http_executor_sends_configured_headers() {
        let (url, server) = spawn_stub_server(vec![(200, "ok")]);
        let mut config = target_config(url);
        config.headers.insert("X-Trace".to_string(), "on".to_string());
        config
            .headers
            .insert("Content-Type".to_string(), "text/plain".to_string());
        let executor = HttpExecutor::new(&config).unwrap();

        executor.execute(&Input::from("hello"), Duration::from_secs(5));

        let requests = server.join().unwrap();
        let request = String::from_utf8_lossy(&requests[0]).to_ascii_lowercase();
        assert!(request.contains("\r\nx-trace: on\r\n"), "got {request}");
        assert!(request.contains("\r\ncontent-type: text/plain\r\n"), "got {request}");
        assert_eq!(request.matches("content-type:").count(), 1);
    }

    #[test]
    fn http_executor_captures_server_error_text() {
        let (url, server) =
            spawn_stub_server(vec![(500, "Traceback (most recent call last): KeyError")]);
        let executor = HttpExecutor::new(&target_config(url)).unwrap();

        let outcome = executor.execute(&Input::from("{}"), Duration::from_secs(5));
        assert_eq!(outcome.status, ResponseStatus::Http(500));
        assert!(outcome.error_text.unwrap().contains("KeyError"));
        server.join().unwrap();
    }

    #[test]
    fn http_executor_reports_timeout_when_target_never_answers() {
        // The kernel completes the handshake from the backlog; nobody answers.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let executor = HttpExecutor::new(&target_config(url)).unwrap();

        let outcome = executor.execute(&Input::from("{}"), Duration::from_millis(50));
        assert_eq!(outcome.status, ResponseStatus::Timeout);
        assert!(outcome.is_timeout());
        drop(listener);
    }

    #[test]
    fn http_executor_reports_refused_connection_as_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let executor = HttpExecutor::new(&target_config(format!("http://{addr}/"))).unwrap();

        let outcome = executor.execute(&Input::from("{}"), Duration::from_secs(2));
        assert_eq!(outcome.status, ResponseStatus::ConnectionError);
        assert!(outcome.is_transport_failure());
        assert!(outcome.error_text.is_some());
    }

    #[test]
    fn http_executor_rejects_invalid_method() {
        let config = TargetConfig {
            method: "NOT A METHOD".to_string(),
            ..target_config("http://127.0.0.1:1/".to_string())
        };
        match HttpExecutor::new(&config) {
            Err(ExecutorError::InvalidMethod(m)) => assert_eq!(m, "NOT A METHOD"),
            Err(e) => panic!("Expected InvalidMethod, got {e:?}"),
            Ok(_) => panic!("Expected InvalidMethod, got a working executor"),
        }
    }
}
