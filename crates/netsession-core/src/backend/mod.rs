//! External session boundary
//!
//! A backend owns connections, TLS and HTTP framing. It creates tasks on
//! request, runs them when resumed, and reports everything that happens to a
//! task through the bound [`SessionDelegate`]. Events for one task are
//! delivered serially; events for different tasks may arrive concurrently.

mod handshake;
mod reqwest_backend;

pub use reqwest_backend::*;

use crate::error::SessionError;
use crate::security::Certificate;
use bytes::Bytes;
use futures::stream::BoxStream;
use netsession_types::{Request, Response, ResumeData, TaskId, TaskKind, TaskState};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

/// Streamed request body
pub type BodyStream = BoxStream<'static, std::io::Result<Bytes>>;

// ============================================================================
// Tasks
// ============================================================================

/// Where an upload's body comes from
#[derive(Debug, Clone)]
pub enum UploadBody {
    Data(Bytes),
    File(PathBuf),
    /// Supplied by the new-body-stream hook when the task starts
    Stream,
}

/// What a new task should do
#[derive(Debug, Clone)]
pub enum TaskSource {
    Data,
    Upload(UploadBody),
    Download,
    ResumedDownload(ResumeData),
}

impl TaskSource {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskSource::Data => TaskKind::Data,
            TaskSource::Upload(_) => TaskKind::Upload,
            TaskSource::Download | TaskSource::ResumedDownload(_) => TaskKind::Download,
        }
    }
}

/// A task owned by a backend
///
/// Tasks are created suspended; nothing is sent until [`SessionTask::resume`].
pub trait SessionTask: Send + Sync {
    fn id(&self) -> TaskId;

    fn kind(&self) -> TaskKind;

    fn state(&self) -> TaskState;

    /// The request the task was created with
    fn original_request(&self) -> Request;

    /// The request currently in flight, after redirects
    fn current_request(&self) -> Request {
        self.original_request()
    }

    fn response(&self) -> Option<Response>;

    fn resume(&self);

    fn suspend(&self);

    /// Cancel the task; it completes with [`SessionError::Cancelled`]
    fn cancel(&self);

    /// Cancel a download, keeping what was received so far
    fn cancel_producing_resume_data(&self) -> Option<ResumeData> {
        self.cancel();
        None
    }
}

/// The platform session a [`crate::SessionManager`] drives
pub trait SessionBackend: Send + Sync {
    /// Attach the receiver of all task events
    fn bind(&self, delegate: Weak<dyn SessionDelegate>);

    /// Create a suspended task
    fn create_task(
        &self,
        request: Request,
        source: TaskSource,
    ) -> Result<Arc<dyn SessionTask>, SessionError>;

    /// Tasks that have been created and not yet completed
    fn active_tasks(&self) -> Vec<Arc<dyn SessionTask>>;

    /// Stop accepting tasks; the delegate is told once the last task has finished
    fn invalidate(&self, cancel_pending: bool);
}

// ============================================================================
// Challenges
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationMethod {
    ServerTrust,
    HttpBasic,
    ClientCertificate,
    Default,
}

/// The host and scheme a challenge applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionSpace {
    pub host: String,
    pub port: u16,
    pub scheme: String,
    pub realm: Option<String>,
    pub method: AuthenticationMethod,
}

/// Certificates negotiated during the TLS handshake
#[derive(Debug, Clone)]
pub struct ServerTrust {
    /// Leaf first
    pub chain: Vec<Certificate>,
    /// Whether the transport already validated the chain against its own roots
    pub verified_by_transport: bool,
}

#[derive(Debug, Clone)]
pub struct AuthChallenge {
    pub protection_space: ProtectionSpace,
    pub server_trust: Option<ServerTrust>,
    pub previous_failure_count: u32,
    pub failure_response: Option<Response>,
}

impl AuthChallenge {
    pub fn is_server_trust(&self) -> bool {
        self.protection_space.method == AuthenticationMethod::ServerTrust
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Basic { user: String, password: String },
    ServerTrust,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeDisposition {
    UseCredential(Credential),
    PerformDefaultHandling,
    CancelChallenge,
    RejectProtectionSpace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDisposition {
    Allow,
    Cancel,
}

/// A response the backend proposes to cache
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub response: Response,
    pub data: Bytes,
}

// ============================================================================
// Delegate
// ============================================================================

/// Receiver of backend events
///
/// Implementations must return promptly; the backend waits on the returned
/// dispositions before continuing with the task.
pub trait SessionDelegate: Send + Sync {
    fn did_become_invalid(&self, error: Option<SessionError>);

    /// Authentication challenge; `task` is `None` for session-level challenges
    fn did_receive_challenge(
        &self,
        task: Option<&dyn SessionTask>,
        challenge: &AuthChallenge,
    ) -> ChallengeDisposition;

    /// Return the request to follow, or `None` to stop at the redirect response
    fn will_perform_redirect(
        &self,
        task: &dyn SessionTask,
        response: &Response,
        request: Request,
    ) -> Option<Request>;

    fn need_new_body_stream(&self, task: &dyn SessionTask) -> Option<BodyStream>;

    fn did_send_body_data(
        &self,
        task: &dyn SessionTask,
        bytes_sent: i64,
        total_bytes_sent: i64,
        total_bytes_expected: i64,
    );

    fn did_receive_response(&self, task: &dyn SessionTask, response: &Response) -> ResponseDisposition;

    fn did_receive_data(&self, task: &dyn SessionTask, data: &Bytes);

    fn will_cache_response(
        &self,
        task: &dyn SessionTask,
        proposed: CachedResponse,
    ) -> Option<CachedResponse>;

    fn did_write_data(
        &self,
        task: &dyn SessionTask,
        bytes_written: i64,
        total_bytes_written: i64,
        total_bytes_expected: i64,
    );

    fn did_resume_at_offset(&self, task: &dyn SessionTask, offset: i64, total_bytes_expected: i64);

    /// The download is complete at `location`
    ///
    /// Returns `true` when the delegate took ownership of the file; otherwise
    /// the backend removes it.
    fn did_finish_downloading(&self, task: &dyn SessionTask, location: &Path) -> bool;

    /// Terminal event, delivered exactly once per task
    fn did_complete(&self, task: &dyn SessionTask, error: Option<SessionError>);
}
