//! Shared types for netsession
//!
//! This crate contains the plain data structures exchanged between the
//! session core, its transport backends and the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use url::Url;
use uuid::Uuid;

// ============================================================================
// Task Types
// ============================================================================

/// Identifier of a task, unique within the session that created it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of transfer a task performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Data,
    Upload,
    Download,
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Created,
    Running,
    Suspended,
    Completed,
    Cancelled,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::Failed
        )
    }
}

/// Byte count reported by transports when the expected size is not known
pub const TRANSFER_SIZE_UNKNOWN: i64 = -1;

/// Convert a transport-reported expected size into a definite total
pub fn expected_total(reported: i64) -> Option<u64> {
    if reported > 0 {
        Some(reported as u64)
    } else {
        None
    }
}

// ============================================================================
// Request / Response Types
// ============================================================================

/// HTTP request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Methods whose parameters travel in the query string rather than the body
    pub fn encodes_parameters_in_uri(&self) -> bool {
        matches!(self, HttpMethod::Get | HttpMethod::Head | HttpMethod::Delete)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An HTTP request handed to a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: HttpMethod,
    pub url: Url,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Vec<u8>>,
    /// Per-request timeout overriding the session default
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Request {
    pub fn new(method: HttpMethod, url: Url) -> Self {
        Self {
            method,
            url,
            headers: BTreeMap::new(),
            body: None,
            timeout_secs: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set a header, replacing any existing value regardless of name case
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|k, _| !k.eq_ignore_ascii_case(&name));
        self.headers.insert(name, value.into());
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }
}

/// Response metadata (status line and headers) received for a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub url: Url,
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Response {
    pub fn new(url: Url, status: u16) -> Self {
        Self {
            url,
            status,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// MIME type without parameters, lowercased
    pub fn mime_type(&self) -> Option<String> {
        self.header("content-type").map(|v| {
            v.split(';')
                .next()
                .unwrap_or("")
                .trim()
                .to_ascii_lowercase()
        })
    }

    pub fn expected_content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }

    /// File name suggested by `Content-Disposition`, falling back to the last path segment
    pub fn suggested_filename(&self) -> String {
        self.header("content-disposition")
            .and_then(|v| {
                v.split("filename=")
                    .nth(1)
                    .map(|s| s.split(';').next().unwrap_or(s).trim_matches('"').to_string())
            })
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| {
                self.url
                    .path_segments()
                    .and_then(|s| s.last())
                    .filter(|s| !s.is_empty())
                    .unwrap_or("download")
                    .to_string()
            })
    }
}

fn find_header<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// A decoded response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ResponseObject {
    Empty,
    Data(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
    File(PathBuf),
}

impl ResponseObject {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ResponseObject::Data(data) => Some(data),
            ResponseObject::Text(text) => Some(text.as_bytes()),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            ResponseObject::Json(value) => Some(value),
            _ => None,
        }
    }
}

// ============================================================================
// Progress Types
// ============================================================================

/// Point-in-time view of one direction of a task's transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub completed: u64,
    /// `None` until the transport reports a definite size
    pub total: Option<u64>,
}

impl ProgressSnapshot {
    pub fn fraction_completed(&self) -> f64 {
        match self.total {
            Some(total) if total > 0 => self.completed as f64 / total as f64,
            _ => 0.0,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.total, Some(total) if self.completed >= total)
    }
}

// ============================================================================
// Security Types
// ============================================================================

/// How server certificates are pinned
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PinningMode {
    /// Rely on the default trust store only
    #[default]
    None,
    /// Accept when any presented public key matches a pinned certificate's key
    PublicKey,
    /// Accept when any presented certificate is byte-identical to a pinned one
    Certificate,
}

// ============================================================================
// Resume Data
// ============================================================================

/// State needed to restart a cancelled download where it left off
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeData {
    pub request: Request,
    /// File holding the bytes received so far
    pub partial_path: PathBuf,
    pub bytes_written: u64,
    pub expected_total: Option<u64>,
    pub etag: Option<String>,
}

// ============================================================================
// Configuration
// ============================================================================

/// Session-wide transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub max_redirects: u32,
    /// Directory holding in-flight download files
    pub download_dir: PathBuf,
    /// Buffer size of the lifecycle event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_event_capacity() -> usize {
    1000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("netsession/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout_secs: 30,
            request_timeout_secs: 60,
            max_redirects: 10,
            download_dir: dirs::cache_dir()
                .map(|p| p.join("netsession").join("downloads"))
                .unwrap_or_else(|| std::env::temp_dir().join("netsession")),
            event_capacity: default_event_capacity(),
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Lifecycle notifications broadcast by a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum SessionEvent {
    TaskResumed {
        session: Uuid,
        task: TaskId,
    },
    TaskSuspended {
        session: Uuid,
        task: TaskId,
    },
    TaskCompleted {
        session: Uuid,
        task: TaskId,
        /// Raw bytes received, if any
        response_data: Option<Vec<u8>>,
        /// Serialized object, also present when serialization reported an error
        serialized: Option<ResponseObject>,
        /// Name of the serializer captured when the task was created
        serializer: Option<String>,
        /// Final location of a download task's file
        asset_path: Option<PathBuf>,
        error: Option<String>,
        finished_at: DateTime<Utc>,
    },
    SessionInvalidated {
        session: Uuid,
        error: Option<String>,
    },
    DownloadMoveFailed {
        session: Uuid,
        task: TaskId,
        location: PathBuf,
        destination: PathBuf,
        error: String,
    },
}

impl SessionEvent {
    pub fn task(&self) -> Option<TaskId> {
        match self {
            SessionEvent::TaskResumed { task, .. }
            | SessionEvent::TaskSuspended { task, .. }
            | SessionEvent::TaskCompleted { task, .. }
            | SessionEvent::DownloadMoveFailed { task, .. } => Some(*task),
            SessionEvent::SessionInvalidated { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_total_ignores_unknown() {
        assert_eq!(expected_total(TRANSFER_SIZE_UNKNOWN), None);
        assert_eq!(expected_total(0), None);
        assert_eq!(expected_total(42), Some(42));
    }

    #[test]
    fn test_response_header_lookup_is_case_insensitive() {
        let url = Url::parse("https://example.com/files/report.pdf").unwrap();
        let response = Response::new(url, 200)
            .with_header("Content-Type", "Application/JSON; charset=utf-8")
            .with_header("Content-Length", "128");

        assert_eq!(response.mime_type().as_deref(), Some("application/json"));
        assert_eq!(response.expected_content_length(), Some(128));
        assert_eq!(response.suggested_filename(), "report.pdf");
    }

    #[test]
    fn test_suggested_filename_prefers_content_disposition() {
        let url = Url::parse("https://example.com/dl?id=4").unwrap();
        let response = Response::new(url, 200)
            .with_header("Content-Disposition", "attachment; filename=\"data.csv\"");
        assert_eq!(response.suggested_filename(), "data.csv");
    }

    #[test]
    fn test_request_set_header_replaces_case_insensitively() {
        let url = Url::parse("https://example.com").unwrap();
        let mut request = Request::get(url).with_header("Accept", "text/html");
        request.set_header("accept", "application/json");
        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.header("ACCEPT"), Some("application/json"));
    }

    #[test]
    fn test_session_event_serializes_with_tag() {
        let event = SessionEvent::TaskResumed {
            session: Uuid::nil(),
            task: TaskId(7),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "TaskResumed");
        assert_eq!(json["payload"]["task"], 7);
    }
}
