use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use serde_json::{Value, json};
use std::error::Error as StdError;
use std::time::Duration;
use tomb_core::{ConversationRole, HistoryEntry, LlmConfig};
use tomb_errors::{EngineError, StartupError};

/// Synthetic player utterance that opens a level.
pub const OPENING_UTTERANCE: &str = "Begin the game. Describe the setting.";

/// Everything the gateway needs for one engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineRequest {
    pub instruction: String,
    /// Scoped history for the current level. Never contains the in-flight utterance.
    pub history: Vec<HistoryEntry>,
    pub utterance: Option<String>,
    pub initialize: bool,
}

impl EngineRequest {
    pub fn initialize(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            history: Vec::new(),
            utterance: None,
            initialize: true,
        }
    }

    pub fn player(
        instruction: impl Into<String>,
        history: Vec<HistoryEntry>,
        utterance: impl Into<String>,
    ) -> Self {
        Self {
            instruction: instruction.into(),
            history,
            utterance: Some(utterance.into()),
            initialize: false,
        }
    }

    /// The ordered `(role, content)` list sent to the engine after the system instruction.
    ///
    /// Initialization sends only the opening utterance. Otherwise the scoped history is
    /// attached in order and the new utterance goes last.
    pub fn conversation(&self) -> Vec<(ConversationRole, &str)> {
        if self.initialize {
            return vec![(ConversationRole::Player, OPENING_UTTERANCE)];
        }
        let mut turns: Vec<(ConversationRole, &str)> = self
            .history
            .iter()
            .map(|entry| (entry.speaker, entry.text.as_str()))
            .collect();
        if let Some(utterance) = self.utterance.as_deref()
            && !utterance.trim().is_empty()
        {
            turns.push((ConversationRole::Player, utterance));
        }
        turns
    }
}

/// One outbound call to the reasoning engine, returning the raw completion text.
///
/// Implementations must not retry: the player resubmitting is the retry mechanism.
pub trait EngineClient: Send + Sync {
    fn complete(&self, req: &EngineRequest) -> std::result::Result<String, EngineError>;
}

#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    cfg: LlmConfig,
    api_key: String,
    client: Client,
}

impl OpenRouterClient {
    /// Resolves the credential up front; a missing key is a startup failure, not a turn failure.
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        let provider = cfg.provider.to_ascii_lowercase();
        if provider != "openrouter" {
            return Err(anyhow!(
                "unsupported llm.provider='{}' (only 'openrouter' is supported)",
                cfg.provider
            ));
        }
        let key = resolve_api_key(&cfg).ok_or_else(|| StartupError::ConfigurationMissing {
            env_var: cfg.api_key_env.clone(),
        })?;
        Self::with_api_key(cfg, key)
    }

    pub fn with_api_key(cfg: LlmConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self {
            cfg,
            api_key: api_key.into(),
            client,
        })
    }

    fn build_payload(&self, req: &EngineRequest) -> Value {
        let mut messages = vec![json!({"role": "system", "content": req.instruction})];
        messages.extend(req.conversation().into_iter().map(|(role, content)| {
            let role = match role {
                ConversationRole::Player => "user",
                ConversationRole::Engine => "assistant",
            };
            json!({"role": role, "content": content})
        }));

        let mut payload = json!({
            "model": self.cfg.model,
            "messages": messages,
        });
        if self.cfg.json_response_format {
            payload["response_format"] = json!({"type": "json_object"});
        }
        if let Some(temperature) = self.cfg.temperature {
            payload["temperature"] = json!(temperature);
        }
        payload
    }
}

impl EngineClient for OpenRouterClient {
    fn complete(&self, req: &EngineRequest) -> std::result::Result<String, EngineError> {
        let payload = self.build_payload(req);
        let mut request = self
            .client
            .post(&self.cfg.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload);
        if !self.cfg.referer.is_empty() {
            request = request.header("HTTP-Referer", &self.cfg.referer);
        }
        if !self.cfg.title.is_empty() {
            request = request.header("X-Title", &self.cfg.title);
        }

        let resp = request
            .send()
            .map_err(|err| classify_transport_error(&err, self.cfg.timeout_seconds))?;
        let status = resp.status();
        let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));
        let body = resp
            .text()
            .map_err(|err| classify_transport_error(&err, self.cfg.timeout_seconds))?;
        if !status.is_success() {
            return Err(classify_status(status, &body, retry_after));
        }
        parse_completion_envelope(&body)
    }
}

pub fn resolve_api_key(cfg: &LlmConfig) -> Option<String> {
    std::env::var(&cfg.api_key_env)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| {
            cfg.api_key
                .as_ref()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
}

fn classify_status(status: StatusCode, body: &str, retry_after: Option<u64>) -> EngineError {
    let detail = error_detail(body);
    let code = status.as_u16();
    match status {
        StatusCode::TOO_MANY_REQUESTS => EngineError::RateLimited {
            retry_after_seconds: retry_after,
            detail,
        },
        StatusCode::UNAUTHORIZED | StatusCode::PAYMENT_REQUIRED | StatusCode::FORBIDDEN => {
            EngineError::AuthFailure {
                status: code,
                detail,
            }
        }
        s if s.is_server_error() => EngineError::UpstreamError {
            status: code,
            detail,
        },
        _ => EngineError::RequestFailed {
            status: code,
            detail,
        },
    }
}

/// Pulls `error.message` out of a JSON error body, or the first 200 chars of anything else.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str().map(ToString::to_string))
        })
        .unwrap_or_else(|| body.chars().take(200).collect())
}

fn classify_transport_error(err: &reqwest::Error, timeout_seconds: u64) -> EngineError {
    if err.is_timeout() {
        return EngineError::Timeout {
            seconds: timeout_seconds,
        };
    }
    let inner_msg = err
        .source()
        .map(|e| e.to_string())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let is_dns = inner_msg.contains("dns")
        || inner_msg.contains("resolve")
        || inner_msg.contains("name or service not known")
        || inner_msg.contains("no such host")
        || inner_msg.contains("getaddrinfo");

    let detail = if is_dns {
        format!("DNS resolution failed: {err}")
    } else if err.is_connect() {
        format!("connection refused: {err}")
    } else {
        format!("network error: {err}")
    };
    EngineError::Unreachable { detail }
}

fn parse_retry_after_seconds(header: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let value = header?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    parse_retry_after_http_date(value)
}

fn parse_retry_after_http_date(value: &str) -> Option<u64> {
    let retry_at = DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
                .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        })
        .ok()?;
    let delta = retry_at.signed_duration_since(Utc::now()).num_seconds();
    Some(delta.max(0) as u64)
}

/// Extracts `choices[0].message.content` from a chat-completions envelope.
fn parse_completion_envelope(body: &str) -> std::result::Result<String, EngineError> {
    let value: Value =
        serde_json::from_str(body).map_err(|err| EngineError::MalformedEnvelope {
            detail: format!("body is not JSON: {err}"),
        })?;
    if value.get("error").is_some() {
        return Err(EngineError::MalformedEnvelope {
            detail: format!("success status with error payload: {}", error_detail(body)),
        });
    }
    let choice = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .ok_or_else(|| EngineError::MalformedEnvelope {
            detail: "missing choices[0]".to_string(),
        })?;
    choice
        .get("message")
        .and_then(|message| message.get("content"))
        .and_then(|content| content.as_str())
        .map(ToString::to_string)
        .ok_or_else(|| EngineError::MalformedEnvelope {
            detail: "missing choices[0].message.content".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, mpsc};
    use std::thread;
    use std::time::Duration as StdDuration;
    use tomb_errors::FailureKind;

    fn history() -> Vec<HistoryEntry> {
        vec![
            HistoryEntry {
                speaker: ConversationRole::Engine,
                text: "You stand before a gate.".to_string(),
            },
            HistoryEntry {
                speaker: ConversationRole::Player,
                text: "knock".to_string(),
            },
            HistoryEntry {
                speaker: ConversationRole::Engine,
                text: "Nothing happens.".to_string(),
            },
        ]
    }

    fn client_for(endpoint: &str) -> OpenRouterClient {
        let cfg = LlmConfig {
            endpoint: endpoint.to_string(),
            timeout_seconds: 1,
            ..LlmConfig::default()
        };
        OpenRouterClient::with_api_key(cfg, "test-key").expect("client")
    }

    #[test]
    fn init_payload_has_system_and_opening_utterance_only() {
        let client = client_for("http://127.0.0.1:9/chat");
        let req = EngineRequest {
            history: history(),
            ..EngineRequest::initialize("SYSTEM")
        };
        let payload = client.build_payload(&req);
        let messages = payload["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], json!({"role": "system", "content": "SYSTEM"}));
        assert_eq!(
            messages[1],
            json!({"role": "user", "content": OPENING_UTTERANCE})
        );
        assert_eq!(payload["model"], tomb_core::DEFAULT_MODEL);
        assert_eq!(payload["response_format"]["type"], "json_object");
        assert!(payload.get("temperature").is_none());
    }

    #[test]
    fn player_payload_appends_utterance_after_history() {
        let client = client_for("http://127.0.0.1:9/chat");
        let req = EngineRequest::player("SYSTEM", history(), "pull lever");
        let payload = client.build_payload(&req);
        let roles: Vec<&str> = payload["messages"]
            .as_array()
            .expect("messages")
            .iter()
            .map(|m| m["role"].as_str().expect("role"))
            .collect();
        assert_eq!(roles, vec!["system", "assistant", "user", "assistant", "user"]);
        assert_eq!(payload["messages"][4]["content"], "pull lever");
    }

    #[test]
    fn blank_utterance_is_not_appended() {
        let req = EngineRequest::player("SYSTEM", history(), "   ");
        assert_eq!(req.conversation().len(), 3);
    }

    #[test]
    fn optional_payload_fields_follow_config() {
        let cfg = LlmConfig {
            json_response_format: false,
            temperature: Some(0.7),
            ..LlmConfig::default()
        };
        let client = OpenRouterClient::with_api_key(cfg, "k").expect("client");
        let payload = client.build_payload(&EngineRequest::initialize("S"));
        assert!(payload.get("response_format").is_none());
        assert!((payload["temperature"].as_f64().expect("temp") - 0.7).abs() < 1e-6);
    }

    #[test]
    fn missing_api_key_is_a_startup_error() {
        let cfg = LlmConfig {
            api_key: None,
            api_key_env: "TOMB_NONEXISTENT_KEY_FOR_TEST".to_string(),
            ..LlmConfig::default()
        };
        let err = OpenRouterClient::new(cfg).expect_err("missing key");
        let startup = err.downcast_ref::<StartupError>().expect("startup error");
        assert_eq!(
            startup,
            &StartupError::ConfigurationMissing {
                env_var: "TOMB_NONEXISTENT_KEY_FOR_TEST".to_string()
            }
        );
    }

    #[test]
    fn inline_key_is_used_when_env_is_unset() {
        let cfg = LlmConfig {
            api_key: Some("  inline-key ".to_string()),
            api_key_env: "TOMB_NONEXISTENT_KEY_FOR_INLINE_TEST".to_string(),
            ..LlmConfig::default()
        };
        assert_eq!(resolve_api_key(&cfg).as_deref(), Some("inline-key"));
        assert!(OpenRouterClient::new(cfg).is_ok());
    }

    #[test]
    fn unsupported_provider_is_rejected() {
        let cfg = LlmConfig {
            provider: "anthropic".to_string(),
            api_key: Some("k".to_string()),
            ..LlmConfig::default()
        };
        let err = OpenRouterClient::new(cfg).expect_err("provider");
        assert!(err.to_string().contains("only 'openrouter' is supported"));
    }

    #[test]
    fn status_classification_covers_each_class() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "{}", Some(3)).kind(),
            FailureKind::RateLimited
        );
        for status in [
            StatusCode::UNAUTHORIZED,
            StatusCode::PAYMENT_REQUIRED,
            StatusCode::FORBIDDEN,
        ] {
            assert_eq!(classify_status(status, "", None).kind(), FailureKind::AuthFailure);
        }
        for status in [StatusCode::INTERNAL_SERVER_ERROR, StatusCode::BAD_GATEWAY] {
            assert_eq!(
                classify_status(status, "", None).kind(),
                FailureKind::UpstreamError
            );
        }
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST, "", None).kind(),
            FailureKind::RequestFailed
        );
    }

    #[test]
    fn error_detail_prefers_json_message() {
        assert_eq!(
            error_detail(r#"{"error":{"message":"invalid key","code":401}}"#),
            "invalid key"
        );
        assert_eq!(error_detail(r#"{"error":"flat"}"#), "flat");
        let long = "x".repeat(500);
        assert_eq!(error_detail(&long).len(), 200);
    }

    #[test]
    fn envelope_parsing_requires_content() {
        let ok = r#"{"choices":[{"message":{"content":"{\"message\":\"hi\",\"solved\":false}"}}]}"#;
        assert_eq!(
            parse_completion_envelope(ok).expect("content"),
            r#"{"message":"hi","solved":false}"#
        );
        for bad in [
            "not json",
            r#"{"choices":[]}"#,
            r#"{"choices":[{"message":{}}]}"#,
            r#"{"choices":[{"message":{"content":null}}]}"#,
            r#"{"error":{"message":"provider overloaded"}}"#,
        ] {
            let err = parse_completion_envelope(bad).expect_err(bad);
            assert_eq!(err.kind(), FailureKind::MalformedEnvelope, "{bad}");
        }
    }

    #[test]
    fn retry_after_parses_seconds_and_http_date() {
        let seconds_header = reqwest::header::HeaderValue::from_static("7");
        assert_eq!(parse_retry_after_seconds(Some(&seconds_header)), Some(7));

        let future = Utc::now() + chrono::Duration::seconds(5);
        let http_date = future.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let date_header = reqwest::header::HeaderValue::from_str(&http_date).expect("header");
        let parsed = parse_retry_after_seconds(Some(&date_header)).expect("parsed");
        assert!(parsed <= 10);
        assert_eq!(parse_retry_after_seconds(None), None);
    }

    #[test]
    fn complete_sends_one_request_with_attribution_headers() {
        let server = start_mock_server(vec![MockHttpResponse {
            status: 200,
            body: r#"{"choices":[{"message":{"content":"{\"message\":\"A gate.\",\"solved\":false}"}}]}"#
                .to_string(),
            retry_after: None,
        }]);
        let client = client_for(&server.endpoint);

        let text = client
            .complete(&EngineRequest::initialize("SYSTEM"))
            .expect("completion");
        assert_eq!(text, r#"{"message":"A gate.","solved":false}"#);
        assert_eq!(server.request_count(), 1);

        let request = server.requests().remove(0);
        let lower = request.to_ascii_lowercase();
        assert!(lower.contains("authorization: bearer test-key"));
        assert!(lower.contains("http-referer: http://localhost:3000"));
        assert!(lower.contains("x-title: tomb of the silver king"));
        assert!(request.contains(OPENING_UTTERANCE));
    }

    #[test]
    fn complete_does_not_retry_rate_limits() {
        let server = start_mock_server(vec![MockHttpResponse {
            status: 429,
            body: r#"{"error":{"message":"slow down"}}"#.to_string(),
            retry_after: Some("4".to_string()),
        }]);
        let client = client_for(&server.endpoint);

        let err = client
            .complete(&EngineRequest::initialize("SYSTEM"))
            .expect_err("rate limited");
        assert_eq!(
            err,
            EngineError::RateLimited {
                retry_after_seconds: Some(4),
                detail: "slow down".to_string()
            }
        );
        assert_eq!(server.request_count(), 1);
    }

    #[test]
    fn complete_classifies_401_and_503() {
        let server = start_mock_server(vec![
            MockHttpResponse {
                status: 401,
                body: r#"{"error":{"message":"No auth credentials found"}}"#.to_string(),
                retry_after: None,
            },
            MockHttpResponse {
                status: 503,
                body: "upstream down".to_string(),
                retry_after: None,
            },
        ]);
        let client = client_for(&server.endpoint);
        let req = EngineRequest::initialize("SYSTEM");

        let first = client.complete(&req).expect_err("401");
        assert_eq!(first.kind(), FailureKind::AuthFailure);
        let second = client.complete(&req).expect_err("503");
        assert_eq!(
            second,
            EngineError::UpstreamError {
                status: 503,
                detail: "upstream down".to_string()
            }
        );
    }

    #[test]
    fn complete_times_out_on_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let _ = consume_http_request(&mut stream);
                thread::sleep(StdDuration::from_millis(2500));
            }
        });

        let client = client_for(&format!("http://{addr}/chat/completions"));
        let err = client
            .complete(&EngineRequest::initialize("SYSTEM"))
            .expect_err("timeout");
        assert_eq!(err, EngineError::Timeout { seconds: 1 });
        let _ = server.join();
    }

    #[test]
    fn complete_reports_unreachable_endpoint() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr")
        };
        let client = client_for(&format!("http://{addr}/chat/completions"));
        let err = client
            .complete(&EngineRequest::initialize("SYSTEM"))
            .expect_err("refused");
        assert_eq!(err.kind(), FailureKind::Unreachable);
    }

    #[derive(Clone)]
    struct MockHttpResponse {
        status: u16,
        body: String,
        retry_after: Option<String>,
    }

    struct MockServer {
        endpoint: String,
        request_count: Arc<AtomicUsize>,
        requests: Arc<Mutex<Vec<String>>>,
        stop_tx: Option<mpsc::Sender<()>>,
        handle: Option<thread::JoinHandle<()>>,
    }

    impl MockServer {
        fn request_count(&self) -> usize {
            self.request_count.load(Ordering::SeqCst)
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().expect("test lock").clone()
        }
    }

    impl Drop for MockServer {
        fn drop(&mut self) {
            if let Some(tx) = self.stop_tx.take() {
                let _ = tx.send(());
            }
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    fn start_mock_server(scripted: Vec<MockHttpResponse>) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        listener
            .set_nonblocking(true)
            .expect("set nonblocking listener");
        let addr = listener.local_addr().expect("addr");
        let request_count = Arc::new(AtomicUsize::new(0));
        let request_count_thread = Arc::clone(&request_count);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let requests_thread = Arc::clone(&requests);
        let (tx, rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            loop {
                if rx.try_recv().is_ok() {
                    break;
                }
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = stream.set_nonblocking(false);
                        let raw = consume_http_request(&mut stream).unwrap_or_default();
                        requests_thread.lock().expect("test lock").push(raw);
                        let idx = request_count_thread.fetch_add(1, Ordering::SeqCst);
                        let selected = scripted
                            .get(idx)
                            .cloned()
                            .or_else(|| scripted.last().cloned())
                            .expect("scripted response");
                        let status_text = match selected.status {
                            200 => "OK",
                            401 => "Unauthorized",
                            429 => "Too Many Requests",
                            503 => "Service Unavailable",
                            _ => "Error",
                        };
                        let mut headers = format!(
                            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
                            selected.status,
                            status_text,
                            selected.body.len()
                        );
                        if let Some(retry_after) = selected.retry_after {
                            headers.push_str(&format!("Retry-After: {retry_after}\r\n"));
                        }
                        headers.push_str("\r\n");
                        let response = format!("{headers}{}", selected.body);
                        let _ = stream.write_all(response.as_bytes());
                        let _ = stream.flush();
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(StdDuration::from_millis(2));
                    }
                    Err(_) => break,
                }
            }
        });
        MockServer {
            endpoint: format!("http://{addr}/chat/completions"),
            request_count,
            requests,
            stop_tx: Some(tx),
            handle: Some(handle),
        }
    }

    fn consume_http_request(stream: &mut std::net::TcpStream) -> std::io::Result<String> {
        let mut buffer = Vec::new();
        let mut chunk = [0_u8; 1024];
        let mut header_end = None;
        while header_end.is_none() {
            let read = stream.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..read]);
            header_end = find_subsequence(&buffer, b"\r\n\r\n").map(|idx| idx + 4);
            if buffer.len() > 1_048_576 {
                break;
            }
        }
        let header_len = header_end.unwrap_or(buffer.len());
        let content_length = parse_content_length(&buffer[..header_len]);
        while buffer.len() < header_len + content_length {
            let read = stream.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..read]);
        }
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }

    fn parse_content_length(headers: &[u8]) -> usize {
        let raw = String::from_utf8_lossy(headers);
        for line in raw.lines() {
            let mut parts = line.splitn(2, ':');
            let key = parts.next().unwrap_or_default().trim();
            if key.eq_ignore_ascii_case("content-length")
                && let Some(value) = parts.next()
                && let Ok(parsed) = value.trim().parse::<usize>()
            {
                return parsed;
            }
        }
        0
    }

    fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        if needle.is_empty() || haystack.len() < needle.len() {
            return None;
        }
        haystack
            .windows(needle.len())
            .position(|window| window == needle)
    }
}
