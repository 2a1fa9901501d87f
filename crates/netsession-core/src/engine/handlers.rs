//! Handler table - session-wide defaults and per-task overrides
//!
//! Every delegate event category has one slot. Per-task overrides are
//! checked first; the session default applies when a task has none.

use crate::backend::{
    AuthChallenge, BodyStream, CachedResponse, ChallengeDisposition, ResponseDisposition,
    SessionTask,
};
use crate::error::SessionError;
use bytes::Bytes;
use netsession_types::{Request, Response};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type RedirectHandler =
    Arc<dyn Fn(&dyn SessionTask, &Response, Request) -> Option<Request> + Send + Sync>;
pub type BodyStreamHandler = Arc<dyn Fn(&dyn SessionTask) -> Option<BodyStream> + Send + Sync>;
pub type SessionChallengeHandler =
    Arc<dyn Fn(&AuthChallenge) -> ChallengeDisposition + Send + Sync>;
pub type TaskChallengeHandler =
    Arc<dyn Fn(&dyn SessionTask, &AuthChallenge) -> ChallengeDisposition + Send + Sync>;
/// `(task, bytes_sent, total_bytes_sent, total_bytes_expected)`
pub type SendProgressHandler = Arc<dyn Fn(&dyn SessionTask, i64, i64, i64) + Send + Sync>;
pub type TaskCompleteHandler =
    Arc<dyn Fn(&dyn SessionTask, Option<&SessionError>) + Send + Sync>;
pub type ResponseHandler =
    Arc<dyn Fn(&dyn SessionTask, &Response) -> ResponseDisposition + Send + Sync>;
pub type DataHandler = Arc<dyn Fn(&dyn SessionTask, &Bytes) + Send + Sync>;
pub type CacheHandler =
    Arc<dyn Fn(&dyn SessionTask, CachedResponse) -> Option<CachedResponse> + Send + Sync>;
/// Returns where the finished download should be moved, if anywhere
pub type DownloadFinishedHandler =
    Arc<dyn Fn(&dyn SessionTask, &Path) -> Option<PathBuf> + Send + Sync>;
/// `(task, bytes_written, total_bytes_written, total_bytes_expected)`
pub type DownloadProgressHandler = Arc<dyn Fn(&dyn SessionTask, i64, i64, i64) + Send + Sync>;
/// `(task, file_offset, total_bytes_expected)`
pub type DownloadResumedHandler = Arc<dyn Fn(&dyn SessionTask, i64, i64) + Send + Sync>;
pub type InvalidatedHandler = Arc<dyn Fn(Option<&SessionError>) + Send + Sync>;
/// Per-task download destination: `(temporary location, response) -> final path`
pub type DownloadDestination = Arc<dyn Fn(&Path, Option<&Response>) -> PathBuf + Send + Sync>;

/// A replaceable handler
pub struct HandlerSlot<H> {
    handler: RwLock<Option<H>>,
}

impl<H: Clone> HandlerSlot<H> {
    pub fn set(&self, handler: Option<H>) {
        *self.handler.write() = handler;
    }

    /// Clone of the current handler; the lock is released before it is called
    pub fn get(&self) -> Option<H> {
        self.handler.read().clone()
    }
}

impl<H> Default for HandlerSlot<H> {
    fn default() -> Self {
        Self {
            handler: RwLock::new(None),
        }
    }
}

/// Session-wide default handlers
#[derive(Default)]
pub struct SessionHandlers {
    pub redirect: HandlerSlot<RedirectHandler>,
    pub new_body_stream: HandlerSlot<BodyStreamHandler>,
    pub session_challenge: HandlerSlot<SessionChallengeHandler>,
    pub task_challenge: HandlerSlot<TaskChallengeHandler>,
    pub send_body_data: HandlerSlot<SendProgressHandler>,
    pub task_complete: HandlerSlot<TaskCompleteHandler>,
    pub response: HandlerSlot<ResponseHandler>,
    pub data: HandlerSlot<DataHandler>,
    pub cache_response: HandlerSlot<CacheHandler>,
    pub download_finished: HandlerSlot<DownloadFinishedHandler>,
    pub download_progress: HandlerSlot<DownloadProgressHandler>,
    pub download_resumed: HandlerSlot<DownloadResumedHandler>,
    pub invalidated: HandlerSlot<InvalidatedHandler>,
}

/// Handlers that take precedence over the session defaults for one task
#[derive(Clone, Default)]
pub struct TaskOverrides {
    pub redirect: Option<RedirectHandler>,
    pub new_body_stream: Option<BodyStreamHandler>,
    /// Never consulted for server trust challenges the security policy rejects
    pub auth_challenge: Option<TaskChallengeHandler>,
    pub did_send_body_data: Option<SendProgressHandler>,
}

/// Pick the per-task override if present, else the session default
pub(crate) fn resolve<H: Clone>(task: Option<&H>, session: &HandlerSlot<H>) -> Option<H> {
    task.cloned().or_else(|| session.get())
}
