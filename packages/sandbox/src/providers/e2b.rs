// ABOUTME: E2B gateway opening remote sandboxes over the E2B REST and envd process APIs
// ABOUTME: Credentials and endpoints are explicit per call; commands stream over Connect JSON

use super::{CommandHandle, Completion, ExecMode, ProviderError, Result, Session, SessionGateway};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Client, Response, StatusCode};
use sandloop_config::constants::{
    DEFAULT_E2B_API_URL, DEFAULT_E2B_DOMAIN, DEFAULT_E2B_TEMPLATE, DEFAULT_SANDBOX_TIMEOUT_SECS,
};
use sandloop_config::CredentialKey;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Port the in-sandbox envd daemon listens on
const ENVD_PORT: u16 = 49983;

/// Default user commands run as inside the sandbox
const ENVD_USER: &str = "user";

/// Connect envelope flag marking the trailing end-of-stream message
const END_STREAM_FLAG: u8 = 0x02;

const ENVELOPE_HEADER_LEN: usize = 5;

#[derive(Debug, Clone)]
pub struct E2BConfig {
    /// Control-plane base URL
    pub api_url: String,
    /// Domain sandboxes are reachable under, unless the API returns one
    pub domain: String,
    /// Sandbox template to boot
    pub template: String,
    /// Lifetime the provider enforces on a sandbox nobody closes
    pub sandbox_timeout: Duration,
    /// Timeout for control-plane requests (create/delete)
    pub request_timeout: Duration,
    /// Fixed envd base URL, bypassing `https://{port}-{id}.{domain}`
    pub envd_url: Option<String>,
}

impl Default for E2BConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_E2B_API_URL.to_string(),
            domain: DEFAULT_E2B_DOMAIN.to_string(),
            template: DEFAULT_E2B_TEMPLATE.to_string(),
            sandbox_timeout: Duration::from_secs(DEFAULT_SANDBOX_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(30),
            envd_url: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateSandboxRequest<'a> {
    #[serde(rename = "templateID")]
    template_id: &'a str,
    timeout: u64,
}

#[derive(Debug, Deserialize)]
struct CreatedSandbox {
    #[serde(rename = "sandboxID")]
    sandbox_id: String,
    #[serde(rename = "clientID", default)]
    client_id: Option<String>,
    #[serde(rename = "envdAccessToken", default)]
    envd_access_token: Option<String>,
    #[serde(default)]
    domain: Option<String>,
}

/// Gateway for E2B cloud sandboxes
pub struct E2BGateway {
    client: Client,
    config: E2BConfig,
}

impl E2BGateway {
    pub fn new(config: E2BConfig) -> Result<Self> {
        if config.api_url.trim().is_empty() {
            return Err(ProviderError::Config("E2B API URL is required".to_string()));
        }
        if config.template.trim().is_empty() {
            return Err(ProviderError::Config(
                "E2B template is required".to_string(),
            ));
        }

        // No overall client timeout: process streams stay open for the whole run.
        let client = Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| ProviderError::Config(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn api_base(&self) -> &str {
        self.config.api_url.trim_end_matches('/')
    }

    fn envd_url_for(&self, created: &CreatedSandbox) -> String {
        if let Some(url) = &self.config.envd_url {
            return url.trim_end_matches('/').to_string();
        }
        let domain = created.domain.as_deref().unwrap_or(&self.config.domain);
        format!("https://{}-{}.{}", ENVD_PORT, created.sandbox_id, domain)
    }
}

#[async_trait]
impl SessionGateway for E2BGateway {
    fn name(&self) -> &'static str {
        "e2b"
    }

    async fn open(&self, credential: &CredentialKey) -> Result<Box<dyn Session>> {
        let url = format!("{}/sandboxes", self.api_base());
        let body = CreateSandboxRequest {
            template_id: &self.config.template,
            timeout: self.config.sandbox_timeout.as_secs(),
        };

        let response = self
            .client
            .post(&url)
            .header("X-API-Key", credential.expose())
            .timeout(self.config.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))?;

        let response = check_status(response).await?;
        let created: CreatedSandbox = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        debug!(
            sandbox_id = %created.sandbox_id,
            client_id = created.client_id.as_deref().unwrap_or("-"),
            "E2B sandbox created"
        );

        Ok(Box::new(E2BSession {
            envd_url: self.envd_url_for(&created),
            id: created.sandbox_id,
            envd_access_token: created.envd_access_token,
            client: self.client.clone(),
            api_url: self.api_base().to_string(),
            credential: credential.clone(),
            request_timeout: self.config.request_timeout,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Map non-success statuses to gateway errors, keeping the response body for context.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let message = format!("HTTP {}: {}", status.as_u16(), text.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(ProviderError::Authentication(message))
        }
        _ => Err(ProviderError::Connection(message)),
    }
}

struct E2BSession {
    id: String,
    client: Client,
    api_url: String,
    envd_url: String,
    envd_access_token: Option<String>,
    credential: CredentialKey,
    request_timeout: Duration,
    closed: AtomicBool,
}

#[async_trait]
impl Session for E2BSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self, command: &str, mode: ExecMode) -> Result<Box<dyn CommandHandle>> {
        let request = serde_json::json!({
            "process": {
                "cmd": "/bin/bash",
                "args": ["-l", "-c", command],
                "envs": {},
            },
            "stdin": false,
        });
        let payload =
            serde_json::to_vec(&request).map_err(|e| ProviderError::Execution(e.to_string()))?;

        let mut builder = self
            .client
            .post(format!("{}/process.Process/Start", self.envd_url))
            .header("Content-Type", "application/connect+json")
            .header("Connect-Protocol-Version", "1")
            .header(
                "Authorization",
                format!("Basic {}", BASE64.encode(format!("{}:", ENVD_USER))),
            )
            .body(encode_envelope(0, &payload));
        if let Some(token) = &self.envd_access_token {
            builder = builder.header("X-Access-Token", token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::Execution(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Execution(format!(
                "HTTP {}: {}",
                status.as_u16(),
                text.trim()
            )));
        }

        let (tx, rx) = oneshot::channel();
        let sandbox_id = self.id.clone();
        let reader = tokio::spawn(async move {
            let outcome = read_process_stream(response, &sandbox_id, mode).await;
            let _ = tx.send(outcome);
        });

        Ok(Box::new(E2BCommandHandle::new(rx, Some(reader))))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let result = self
            .client
            .delete(format!("{}/sandboxes/{}", self.api_url, self.id))
            .header("X-API-Key", self.credential.expose())
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()));

        let outcome = match result {
            Ok(response) if response.status() == StatusCode::NOT_FOUND => Ok(()),
            Ok(response) => check_status(response).await.map(|_| ()),
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(()) => info!(sandbox_id = %self.id, "E2B sandbox killed"),
            Err(e) => {
                warn!(sandbox_id = %self.id, "Failed to kill E2B sandbox: {}", e);
                self.closed.store(false, Ordering::SeqCst);
            }
        }
        outcome
    }
}

struct E2BCommandHandle {
    receiver: oneshot::Receiver<Result<Completion>>,
    reader: Option<JoinHandle<()>>,
    finished: Option<Result<Completion>>,
}

impl E2BCommandHandle {
    fn new(receiver: oneshot::Receiver<Result<Completion>>, reader: Option<JoinHandle<()>>) -> Self {
        Self {
            receiver,
            reader,
            finished: None,
        }
    }
}

#[async_trait]
impl CommandHandle for E2BCommandHandle {
    async fn wait(&mut self, timeout: Option<Duration>) -> Result<Completion> {
        if let Some(finished) = &self.finished {
            return finished.clone();
        }

        let received = match timeout {
            Some(deadline) => tokio::time::timeout(deadline, &mut self.receiver)
                .await
                .map_err(|_| ProviderError::TimeoutExceeded(deadline))?,
            None => (&mut self.receiver).await,
        };

        let outcome = received.unwrap_or_else(|_| {
            Err(ProviderError::Execution(
                "process reader stopped without a result".to_string(),
            ))
        });
        self.finished = Some(outcome.clone());
        outcome
    }
}

impl Drop for E2BCommandHandle {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    #[serde(default)]
    event: Option<ProcessEvent>,
}

#[derive(Debug, Deserialize)]
struct ProcessEvent {
    #[serde(default)]
    start: Option<StartEvent>,
    #[serde(default)]
    data: Option<DataEvent>,
    #[serde(default)]
    end: Option<EndEvent>,
}

#[derive(Debug, Deserialize)]
struct StartEvent {
    #[serde(default)]
    pid: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct DataEvent {
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndEvent {
    #[serde(default)]
    exit_code: Option<i32>,
    #[serde(default)]
    exited: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EndOfStream {
    #[serde(default)]
    error: Option<EndOfStreamError>,
}

#[derive(Debug, Deserialize)]
struct EndOfStreamError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
struct Frame {
    flags: u8,
    payload: Vec<u8>,
}

impl Frame {
    fn is_end_stream(&self) -> bool {
        self.flags & END_STREAM_FLAG != 0
    }
}

fn encode_envelope(flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENVELOPE_HEADER_LEN + payload.len());
    out.push(flags);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Pop every complete envelope off the front of `buffer`, leaving any partial tail.
fn drain_frames(buffer: &mut Vec<u8>) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut offset = 0;

    while buffer.len() - offset >= ENVELOPE_HEADER_LEN {
        let flags = buffer[offset];
        let len = u32::from_be_bytes([
            buffer[offset + 1],
            buffer[offset + 2],
            buffer[offset + 3],
            buffer[offset + 4],
        ]) as usize;
        let start = offset + ENVELOPE_HEADER_LEN;
        if buffer.len() < start + len {
            break;
        }
        frames.push(Frame {
            flags,
            payload: buffer[start..start + len].to_vec(),
        });
        offset = start + len;
    }

    buffer.drain(..offset);
    frames
}

async fn read_process_stream(
    mut response: Response,
    sandbox_id: &str,
    mode: ExecMode,
) -> Result<Completion> {
    let mut buffer = Vec::new();

    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| ProviderError::Execution(e.to_string()))?
    {
        buffer.extend_from_slice(&chunk);
        for frame in drain_frames(&mut buffer) {
            if let Some(done) = handle_frame(&frame, sandbox_id, mode)? {
                return Ok(done);
            }
        }
    }

    Err(ProviderError::Execution(
        "process stream closed before the command finished".to_string(),
    ))
}

/// Returns `Some` once the process end event arrives.
fn handle_frame(frame: &Frame, sandbox_id: &str, mode: ExecMode) -> Result<Option<Completion>> {
    if frame.is_end_stream() {
        let trailer: EndOfStream = serde_json::from_slice(&frame.payload)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let reason = match trailer.error {
            Some(error) => format!(
                "{}: {}",
                error.code.unwrap_or_else(|| "unknown".to_string()),
                error.message.unwrap_or_default()
            ),
            None => "process stream ended without an end event".to_string(),
        };
        return Err(ProviderError::Execution(reason));
    }

    let message: StartResponse = serde_json::from_slice(&frame.payload)
        .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
    let Some(event) = message.event else {
        return Ok(None);
    };

    if let Some(start) = event.start {
        debug!(sandbox_id, pid = start.pid, "Process started");
    }

    if let (Some(data), ExecMode::Foreground) = (event.data, mode) {
        for (stream, encoded) in [("stdout", data.stdout), ("stderr", data.stderr)] {
            let Some(encoded) = encoded else { continue };
            if let Ok(bytes) = BASE64.decode(encoded.as_bytes()) {
                let text = String::from_utf8_lossy(&bytes);
                for line in text.lines() {
                    debug!(sandbox_id, stream, "{}", line);
                }
            }
        }
    }

    if let Some(end) = event.end {
        if !end.exited {
            if let Some(error) = end.error.filter(|e| !e.is_empty()) {
                return Err(ProviderError::Execution(error));
            }
        }
        let exit_code = end.exit_code.or(if end.exited { Some(0) } else { None });
        return Ok(Some(Completion { exit_code }));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json_frame(value: serde_json::Value) -> Frame {
        Frame {
            flags: 0,
            payload: serde_json::to_vec(&value).unwrap(),
        }
    }

    #[test]
    fn test_gateway_requires_api_url() {
        let config = E2BConfig {
            api_url: "  ".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            E2BGateway::new(config),
            Err(ProviderError::Config(_))
        ));
    }

    #[test]
    fn test_envd_url_uses_returned_domain() {
        let gateway = E2BGateway::new(E2BConfig::default()).unwrap();
        let created = CreatedSandbox {
            sandbox_id: "abc123".to_string(),
            client_id: None,
            envd_access_token: None,
            domain: Some("eu.e2b.app".to_string()),
        };
        assert_eq!(gateway.envd_url_for(&created), "https://49983-abc123.eu.e2b.app");

        let created = CreatedSandbox {
            domain: None,
            ..created
        };
        assert_eq!(gateway.envd_url_for(&created), "https://49983-abc123.e2b.app");
    }

    #[test]
    fn test_drain_frames_keeps_partial_tail() {
        let mut buffer = encode_envelope(0, b"{\"a\":1}");
        let second = encode_envelope(END_STREAM_FLAG, b"{}");
        buffer.extend_from_slice(&second[..3]);

        let frames = drain_frames(&mut buffer);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"{\"a\":1}".to_vec());
        assert_eq!(buffer, second[..3].to_vec());

        buffer.extend_from_slice(&second[3..]);
        let frames = drain_frames(&mut buffer);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_end_stream());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_end_event_yields_completion() {
        let frame = json_frame(serde_json::json!({
            "event": { "end": { "exitCode": 3, "exited": true, "status": "exit status 3" } }
        }));
        let done = handle_frame(&frame, "sbx", ExecMode::Background).unwrap();
        assert_eq!(done, Some(Completion { exit_code: Some(3) }));
    }

    #[test]
    fn test_end_event_without_exit_code_defaults_to_zero_when_exited() {
        let frame = json_frame(serde_json::json!({ "event": { "end": { "exited": true } } }));
        let done = handle_frame(&frame, "sbx", ExecMode::Background).unwrap();
        assert_eq!(done, Some(Completion { exit_code: Some(0) }));
    }

    #[test]
    fn test_start_and_data_events_do_not_finish() {
        let start = json_frame(serde_json::json!({ "event": { "start": { "pid": 42 } } }));
        let data = json_frame(serde_json::json!({
            "event": { "data": { "stdout": BASE64.encode("hello\n") } }
        }));
        let keepalive = json_frame(serde_json::json!({ "event": { "keepalive": {} } }));
        for frame in [start, data, keepalive] {
            assert_eq!(
                handle_frame(&frame, "sbx", ExecMode::Foreground).unwrap(),
                None
            );
        }
    }

    #[test]
    fn test_end_stream_error_is_execution_error() {
        let frame = Frame {
            flags: END_STREAM_FLAG,
            payload: serde_json::to_vec(&serde_json::json!({
                "error": { "code": "unavailable", "message": "sandbox gone" }
            }))
            .unwrap(),
        };
        let err = handle_frame(&frame, "sbx", ExecMode::Background).unwrap_err();
        assert_eq!(
            err,
            ProviderError::Execution("unavailable: sandbox gone".to_string())
        );
    }

    #[tokio::test]
    async fn test_wait_times_out_when_nothing_arrives() {
        let (_tx, rx) = oneshot::channel();
        let mut handle = E2BCommandHandle::new(rx, None);
        let err = handle
            .wait(Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::TimeoutExceeded(Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_wait_caches_result() {
        let (tx, rx) = oneshot::channel();
        let mut handle = E2BCommandHandle::new(rx, None);
        tx.send(Ok(Completion { exit_code: Some(1) })).unwrap();

        assert_eq!(handle.wait(None).await.unwrap().exit_code, Some(1));
        assert_eq!(handle.wait(None).await.unwrap().exit_code, Some(1));
    }
}
