//! Session manager - the façade tasks are created through
//!
//! This is the top-level coordinator that:
//! - Creates tasks on the backend and registers their records before returning them
//! - Forwards every backend event to the task's record and handlers
//! - Answers server trust challenges with the session security policy
//! - Dispatches completion callbacks and broadcasts lifecycle events

use crate::backend::{
    AuthChallenge, BodyStream, CachedResponse, ChallengeDisposition, Credential,
    ReqwestBackend, ResponseDisposition, SessionBackend, SessionDelegate, SessionTask,
    TaskSource, UploadBody,
};
use crate::engine::{
    drain, resolve, CompletionContext, CompletionHandler, DownloadDestination, Progress,
    ProgressObserver, TaskDelegate, TaskOutcome, TaskOverrides, TaskRegistry, SessionHandlers,
};
use crate::error::SessionError;
use crate::security::SecurityPolicy;
use crate::serializer::{PassthroughSerializer, ResponseSerializer};
use bytes::Bytes;
use chrono::Utc;
use netsession_types::{
    PinningMode, Request, Response, ResumeData, SessionConfig, SessionEvent, TaskId, TaskKind,
    TaskState,
};
use parking_lot::RwLock;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// Task options
// ============================================================================

/// Per-task handlers and observers supplied at creation
#[derive(Clone, Default)]
pub struct TaskOptions {
    overrides: TaskOverrides,
    destination: Option<DownloadDestination>,
    upload_progress: Option<ProgressObserver>,
    download_progress: Option<ProgressObserver>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_redirect(
        mut self,
        handler: impl Fn(&dyn SessionTask, &Response, Request) -> Option<Request>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.overrides.redirect = Some(Arc::new(handler));
        self
    }

    pub fn on_new_body_stream(
        mut self,
        handler: impl Fn(&dyn SessionTask) -> Option<BodyStream> + Send + Sync + 'static,
    ) -> Self {
        self.overrides.new_body_stream = Some(Arc::new(handler));
        self
    }

    pub fn on_auth_challenge(
        mut self,
        handler: impl Fn(&dyn SessionTask, &AuthChallenge) -> ChallengeDisposition
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.overrides.auth_challenge = Some(Arc::new(handler));
        self
    }

    pub fn on_send_body_data(
        mut self,
        handler: impl Fn(&dyn SessionTask, i64, i64, i64) + Send + Sync + 'static,
    ) -> Self {
        self.overrides.did_send_body_data = Some(Arc::new(handler));
        self
    }

    /// Where a finished download is moved: `(temporary location, response) -> path`
    pub fn destination(
        mut self,
        destination: impl Fn(&Path, Option<&Response>) -> PathBuf + Send + Sync + 'static,
    ) -> Self {
        self.destination = Some(Arc::new(destination));
        self
    }

    pub fn on_upload_progress(
        mut self,
        observer: impl Fn(netsession_types::ProgressSnapshot) + Send + Sync + 'static,
    ) -> Self {
        self.upload_progress = Some(Arc::new(observer));
        self
    }

    pub fn on_download_progress(
        mut self,
        observer: impl Fn(netsession_types::ProgressSnapshot) + Send + Sync + 'static,
    ) -> Self {
        self.download_progress = Some(Arc::new(observer));
        self
    }
}

// ============================================================================
// Task handle
// ============================================================================

/// Caller-side handle to a task created by a [`SessionManager`]
#[derive(Clone)]
pub struct TaskHandle {
    task: Arc<dyn SessionTask>,
    session: Weak<SessionCore>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    pub fn kind(&self) -> TaskKind {
        self.task.kind()
    }

    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    pub fn original_request(&self) -> Request {
        self.task.original_request()
    }

    pub fn current_request(&self) -> Request {
        self.task.current_request()
    }

    pub fn response(&self) -> Option<Response> {
        self.task.response()
    }

    /// Start or continue the task
    pub fn resume(&self) {
        let before = self.task.state();
        if before.is_terminal() || before == TaskState::Running {
            return;
        }
        self.task.resume();
        debug!("Resumed task {}", self.id());
        self.emit(|session, task| SessionEvent::TaskResumed { session, task });
    }

    pub fn suspend(&self) {
        if self.task.state() != TaskState::Running {
            return;
        }
        self.task.suspend();
        debug!("Suspended task {}", self.id());
        self.emit(|session, task| SessionEvent::TaskSuspended { session, task });
    }

    pub fn cancel(&self) {
        info!("Cancelling task {}", self.id());
        self.task.cancel();
    }

    /// Cancel a download, returning serialized resume data if the backend produced any
    pub fn cancel_producing_resume_data(&self) -> Option<Vec<u8>> {
        info!("Cancelling task {} with resume data", self.id());
        let resume = self.task.cancel_producing_resume_data()?;
        match serde_json::to_vec(&resume) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Failed to encode resume data for task {}: {}", self.id(), e);
                None
            }
        }
    }

    fn emit(&self, event: impl FnOnce(Uuid, TaskId) -> SessionEvent) {
        if let Some(session) = self.session.upgrade() {
            let _ = session.event_tx.send(event(session.id, self.id()));
        }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Session manager
// ============================================================================

/// Multiplexes a backend's session-wide events onto per-task records and callbacks
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct SessionManager {
    core: Arc<SessionCore>,
}

struct SessionCore {
    id: Uuid,
    backend: Arc<dyn SessionBackend>,
    registry: TaskRegistry,
    handlers: SessionHandlers,
    security_policy: RwLock<SecurityPolicy>,
    serializer: RwLock<Arc<dyn ResponseSerializer>>,
    completion_context: RwLock<CompletionContext>,
    completions: TaskTracker,
    event_tx: broadcast::Sender<SessionEvent>,
    invalidated: AtomicBool,
}

impl SessionManager {
    /// Create a session over `backend`
    ///
    /// Completion callbacks default to the tokio runtime this is called on.
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        config: &SessionConfig,
    ) -> Result<Self, SessionError> {
        let completion_context = CompletionContext::current()?;
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        let core = Arc::new(SessionCore {
            id: Uuid::new_v4(),
            backend,
            registry: TaskRegistry::new(),
            handlers: SessionHandlers::default(),
            security_policy: RwLock::new(SecurityPolicy::default_policy()),
            serializer: RwLock::new(Arc::new(PassthroughSerializer)),
            completion_context: RwLock::new(completion_context),
            completions: TaskTracker::new(),
            event_tx,
            invalidated: AtomicBool::new(false),
        });

        let delegate: Weak<dyn SessionDelegate> = Arc::downgrade(&core) as Weak<SessionCore>;
        core.backend.bind(delegate);

        info!("Session {} created", core.id);
        Ok(Self { core })
    }

    /// Create a session over a reqwest backend built from `config`
    pub fn with_config(config: SessionConfig) -> Result<Self, SessionError> {
        let backend = ReqwestBackend::new(&config)?;
        Self::new(Arc::new(backend), &config)
    }

    pub fn id(&self) -> Uuid {
        self.core.id
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    pub fn security_policy(&self) -> SecurityPolicy {
        self.core.security_policy.read().clone()
    }

    pub fn set_security_policy(&self, policy: SecurityPolicy) {
        debug!("Session {} security policy: {:?}", self.core.id, policy);
        *self.core.security_policy.write() = policy;
    }

    /// Serializer captured by tasks created from now on
    pub fn set_response_serializer(&self, serializer: Arc<dyn ResponseSerializer>) {
        *self.core.serializer.write() = serializer;
    }

    pub fn set_completion_context(&self, context: CompletionContext) {
        *self.core.completion_context.write() = context;
    }

    /// Lifecycle notifications for every task of this session
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.core.event_tx.subscribe()
    }

    // ========================================================================
    // Task creation
    // ========================================================================

    /// Create a suspended task and register its record
    pub fn create_task(
        &self,
        request: Request,
        source: TaskSource,
        options: TaskOptions,
        completion: Option<CompletionHandler>,
    ) -> Result<TaskHandle, SessionError> {
        if self.core.invalidated.load(Ordering::Acquire) {
            return Err(SessionError::SessionInvalidated);
        }

        let task = self.core.backend.create_task(request, source)?;
        let serializer = self.core.serializer.read().clone();
        let record = TaskDelegate::new(
            task.clone(),
            options.overrides,
            serializer,
            options.destination,
            completion,
        );
        if let Some(observer) = options.upload_progress {
            record.upload_progress().observe(move |s| observer(s));
        }
        if let Some(observer) = options.download_progress {
            record.download_progress().observe(move |s| observer(s));
        }

        self.core.registry.register(Arc::new(record));
        info!(
            "Created {:?} task {} for {}",
            task.kind(),
            task.id(),
            task.original_request().url
        );

        Ok(TaskHandle {
            task,
            session: Arc::downgrade(&self.core),
        })
    }

    pub fn data_task(
        &self,
        request: Request,
        completion: impl FnOnce(TaskOutcome) + Send + 'static,
    ) -> Result<TaskHandle, SessionError> {
        self.data_task_with(request, TaskOptions::default(), completion)
    }

    pub fn data_task_with(
        &self,
        request: Request,
        options: TaskOptions,
        completion: impl FnOnce(TaskOutcome) + Send + 'static,
    ) -> Result<TaskHandle, SessionError> {
        self.create_task(request, TaskSource::Data, options, Some(Box::new(completion)))
    }

    pub fn upload_task_with_data(
        &self,
        request: Request,
        body: impl Into<Bytes>,
        options: TaskOptions,
        completion: impl FnOnce(TaskOutcome) + Send + 'static,
    ) -> Result<TaskHandle, SessionError> {
        let source = TaskSource::Upload(UploadBody::Data(body.into()));
        self.create_task(request, source, options, Some(Box::new(completion)))
    }

    pub fn upload_task_with_file(
        &self,
        request: Request,
        file: impl Into<PathBuf>,
        options: TaskOptions,
        completion: impl FnOnce(TaskOutcome) + Send + 'static,
    ) -> Result<TaskHandle, SessionError> {
        let source = TaskSource::Upload(UploadBody::File(file.into()));
        self.create_task(request, source, options, Some(Box::new(completion)))
    }

    /// Upload whose body is requested from the new-body-stream handler
    pub fn upload_task_with_stream(
        &self,
        request: Request,
        options: TaskOptions,
        completion: impl FnOnce(TaskOutcome) + Send + 'static,
    ) -> Result<TaskHandle, SessionError> {
        let source = TaskSource::Upload(UploadBody::Stream);
        self.create_task(request, source, options, Some(Box::new(completion)))
    }

    pub fn download_task(
        &self,
        request: Request,
        options: TaskOptions,
        completion: impl FnOnce(TaskOutcome) + Send + 'static,
    ) -> Result<TaskHandle, SessionError> {
        self.create_task(request, TaskSource::Download, options, Some(Box::new(completion)))
    }

    /// Continue a download from data produced by [`TaskHandle::cancel_producing_resume_data`]
    pub fn download_task_with_resume_data(
        &self,
        resume_data: &[u8],
        options: TaskOptions,
        completion: impl FnOnce(TaskOutcome) + Send + 'static,
    ) -> Result<TaskHandle, SessionError> {
        let resume: ResumeData = serde_json::from_slice(resume_data)
            .map_err(|e| SessionError::InvalidResumeData(e.to_string()))?;
        let request = resume.request.clone();
        self.create_task(
            request,
            TaskSource::ResumedDownload(resume),
            options,
            Some(Box::new(completion)),
        )
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Upload progress of a task that has not completed yet
    pub fn upload_progress(&self, task: &TaskHandle) -> Option<Progress> {
        self.core
            .registry
            .lookup(task.id())
            .map(|r| r.upload_progress().clone())
    }

    /// Download progress of a task that has not completed yet
    pub fn download_progress(&self, task: &TaskHandle) -> Option<Progress> {
        self.core
            .registry
            .lookup(task.id())
            .map(|r| r.download_progress().clone())
    }

    /// Snapshot of the backend's active tasks
    pub fn tasks(&self) -> Vec<TaskHandle> {
        self.tasks_matching(|_| true)
    }

    pub fn data_tasks(&self) -> Vec<TaskHandle> {
        self.tasks_matching(|kind| kind == TaskKind::Data)
    }

    pub fn upload_tasks(&self) -> Vec<TaskHandle> {
        self.tasks_matching(|kind| kind == TaskKind::Upload)
    }

    pub fn download_tasks(&self) -> Vec<TaskHandle> {
        self.tasks_matching(|kind| kind == TaskKind::Download)
    }

    fn tasks_matching(&self, filter: impl Fn(TaskKind) -> bool) -> Vec<TaskHandle> {
        self.core
            .backend
            .active_tasks()
            .into_iter()
            .filter(|task| filter(task.kind()))
            .map(|task| TaskHandle {
                task,
                session: Arc::downgrade(&self.core),
            })
            .collect()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Stop accepting tasks, optionally cancelling the ones in flight
    pub fn invalidate(&self, cancel_pending: bool) {
        if self.core.invalidated.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            "Invalidating session {} (cancel pending: {})",
            self.core.id, cancel_pending
        );
        self.core.backend.invalidate(cancel_pending);
    }

    pub fn is_invalidated(&self) -> bool {
        self.core.invalidated.load(Ordering::Acquire)
    }

    /// Wait until every completion callback scheduled so far has run
    pub async fn wait_for_completions(&self) {
        drain(&self.core.completions).await;
    }

    // ========================================================================
    // Session-wide handlers
    // ========================================================================

    pub fn set_redirect_handler(
        &self,
        handler: impl Fn(&dyn SessionTask, &Response, Request) -> Option<Request>
            + Send
            + Sync
            + 'static,
    ) {
        self.core.handlers.redirect.set(Some(Arc::new(handler)));
    }

    pub fn set_new_body_stream_handler(
        &self,
        handler: impl Fn(&dyn SessionTask) -> Option<BodyStream> + Send + Sync + 'static,
    ) {
        self.core.handlers.new_body_stream.set(Some(Arc::new(handler)));
    }

    /// Challenges not tied to a task
    pub fn set_session_challenge_handler(
        &self,
        handler: impl Fn(&AuthChallenge) -> ChallengeDisposition + Send + Sync + 'static,
    ) {
        self.core.handlers.session_challenge.set(Some(Arc::new(handler)));
    }

    pub fn set_task_challenge_handler(
        &self,
        handler: impl Fn(&dyn SessionTask, &AuthChallenge) -> ChallengeDisposition
            + Send
            + Sync
            + 'static,
    ) {
        self.core.handlers.task_challenge.set(Some(Arc::new(handler)));
    }

    pub fn set_send_body_data_handler(
        &self,
        handler: impl Fn(&dyn SessionTask, i64, i64, i64) + Send + Sync + 'static,
    ) {
        self.core.handlers.send_body_data.set(Some(Arc::new(handler)));
    }

    pub fn set_task_complete_handler(
        &self,
        handler: impl Fn(&dyn SessionTask, Option<&SessionError>) + Send + Sync + 'static,
    ) {
        self.core.handlers.task_complete.set(Some(Arc::new(handler)));
    }

    pub fn set_response_handler(
        &self,
        handler: impl Fn(&dyn SessionTask, &Response) -> ResponseDisposition + Send + Sync + 'static,
    ) {
        self.core.handlers.response.set(Some(Arc::new(handler)));
    }

    pub fn set_data_handler(&self, handler: impl Fn(&dyn SessionTask, &Bytes) + Send + Sync + 'static) {
        self.core.handlers.data.set(Some(Arc::new(handler)));
    }

    pub fn set_cache_response_handler(
        &self,
        handler: impl Fn(&dyn SessionTask, CachedResponse) -> Option<CachedResponse>
            + Send
            + Sync
            + 'static,
    ) {
        self.core.handlers.cache_response.set(Some(Arc::new(handler)));
    }

    /// Session-wide download destination, consulted before a task's own
    pub fn set_download_finished_handler(
        &self,
        handler: impl Fn(&dyn SessionTask, &Path) -> Option<PathBuf> + Send + Sync + 'static,
    ) {
        self.core.handlers.download_finished.set(Some(Arc::new(handler)));
    }

    pub fn set_download_progress_handler(
        &self,
        handler: impl Fn(&dyn SessionTask, i64, i64, i64) + Send + Sync + 'static,
    ) {
        self.core.handlers.download_progress.set(Some(Arc::new(handler)));
    }

    pub fn set_download_resumed_handler(
        &self,
        handler: impl Fn(&dyn SessionTask, i64, i64) + Send + Sync + 'static,
    ) {
        self.core.handlers.download_resumed.set(Some(Arc::new(handler)));
    }

    pub fn set_invalidated_handler(
        &self,
        handler: impl Fn(Option<&SessionError>) + Send + Sync + 'static,
    ) {
        self.core.handlers.invalidated.set(Some(Arc::new(handler)));
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("id", &self.core.id)
            .field("tasks", &self.core.registry.len())
            .field("invalidated", &self.is_invalidated())
            .finish()
    }
}

// ============================================================================
// Event forwarding
// ============================================================================

impl SessionCore {
    fn record(&self, task: &dyn SessionTask) -> Option<Arc<TaskDelegate>> {
        let record = self.registry.lookup(task.id());
        if record.is_none() {
            debug!("No record for task {}, ignoring event", task.id());
        }
        record
    }

    /// Decide a server trust challenge with the security policy
    fn evaluate_trust(&self, challenge: &AuthChallenge) -> bool {
        let host = &challenge.protection_space.host;
        let policy = self.security_policy.read().clone();
        let (chain, verified) = match &challenge.server_trust {
            Some(trust) => (trust.chain.as_slice(), trust.verified_by_transport),
            None => (&[][..], false),
        };

        // Without pinning, a chain the transport already validated needs no second pass
        if policy.mode() == PinningMode::None && verified {
            return true;
        }

        match policy.evaluate_server_trust(chain, Some(host)) {
            Ok(()) => true,
            Err(e) => {
                warn!("Server trust for {} rejected: {}", host, e);
                false
            }
        }
    }

    fn move_download(&self, task: &dyn SessionTask, record: &TaskDelegate, location: &Path, destination: PathBuf) {
        match move_file(location, &destination) {
            Ok(()) => {
                debug!("Moved download {} to {}", task.id(), destination.display());
                record.set_download_file(destination);
            }
            Err(e) => {
                warn!(
                    "Failed to move download {} to {}: {}",
                    task.id(),
                    destination.display(),
                    e
                );
                record.set_download_file(location.to_path_buf());
                let _ = self.event_tx.send(SessionEvent::DownloadMoveFailed {
                    session: self.id,
                    task: task.id(),
                    location: location.to_path_buf(),
                    destination,
                    error: e.to_string(),
                });
            }
        }
    }
}

impl SessionDelegate for SessionCore {
    fn did_become_invalid(&self, error: Option<SessionError>) {
        info!("Session {} invalidated", self.id);
        if let Some(handler) = self.handlers.invalidated.get() {
            handler(error.as_ref());
        }
        let _ = self.event_tx.send(SessionEvent::SessionInvalidated {
            session: self.id,
            error: error.map(|e| e.to_string()),
        });
    }

    fn did_receive_challenge(
        &self,
        task: Option<&dyn SessionTask>,
        challenge: &AuthChallenge,
    ) -> ChallengeDisposition {
        // Trust policy is session-wide; a rejection is final
        if challenge.is_server_trust() && !self.evaluate_trust(challenge) {
            return ChallengeDisposition::CancelChallenge;
        }

        let handled = match task {
            Some(task) => {
                let record = self.record(task);
                resolve(
                    record.as_ref().and_then(|r| r.overrides.auth_challenge.as_ref()),
                    &self.handlers.task_challenge,
                )
                .map(|handler| handler(task, challenge))
            }
            None => self
                .handlers
                .session_challenge
                .get()
                .map(|handler| handler(challenge)),
        };

        handled.unwrap_or_else(|| {
            if challenge.is_server_trust() {
                ChallengeDisposition::UseCredential(Credential::ServerTrust)
            } else {
                ChallengeDisposition::PerformDefaultHandling
            }
        })
    }

    fn will_perform_redirect(
        &self,
        task: &dyn SessionTask,
        response: &Response,
        request: Request,
    ) -> Option<Request> {
        let record = self.record(task);
        match resolve(
            record.as_ref().and_then(|r| r.overrides.redirect.as_ref()),
            &self.handlers.redirect,
        ) {
            Some(handler) => handler(task, response, request),
            None => Some(request),
        }
    }

    fn need_new_body_stream(&self, task: &dyn SessionTask) -> Option<BodyStream> {
        let record = self.record(task);
        resolve(
            record.as_ref().and_then(|r| r.overrides.new_body_stream.as_ref()),
            &self.handlers.new_body_stream,
        )
        .and_then(|handler| handler(task))
    }

    fn did_send_body_data(
        &self,
        task: &dyn SessionTask,
        bytes_sent: i64,
        total_bytes_sent: i64,
        total_bytes_expected: i64,
    ) {
        let record = self.record(task);
        if let Some(record) = &record {
            record.did_send_body_data(total_bytes_sent, total_bytes_expected);
        }
        if let Some(handler) = resolve(
            record.as_ref().and_then(|r| r.overrides.did_send_body_data.as_ref()),
            &self.handlers.send_body_data,
        ) {
            handler(task, bytes_sent, total_bytes_sent, total_bytes_expected);
        }
    }

    fn did_receive_response(&self, task: &dyn SessionTask, response: &Response) -> ResponseDisposition {
        match self.handlers.response.get() {
            Some(handler) => handler(task, response),
            None => ResponseDisposition::Allow,
        }
    }

    fn did_receive_data(&self, task: &dyn SessionTask, data: &Bytes) {
        if let Some(record) = self.record(task) {
            record.did_receive_data(data);
        }
        if let Some(handler) = self.handlers.data.get() {
            handler(task, data);
        }
    }

    fn will_cache_response(
        &self,
        task: &dyn SessionTask,
        proposed: CachedResponse,
    ) -> Option<CachedResponse> {
        match self.handlers.cache_response.get() {
            Some(handler) => handler(task, proposed),
            None => Some(proposed),
        }
    }

    fn did_write_data(
        &self,
        task: &dyn SessionTask,
        bytes_written: i64,
        total_bytes_written: i64,
        total_bytes_expected: i64,
    ) {
        if let Some(record) = self.record(task) {
            record.did_write_data(total_bytes_written, total_bytes_expected);
        }
        if let Some(handler) = self.handlers.download_progress.get() {
            handler(task, bytes_written, total_bytes_written, total_bytes_expected);
        }
    }

    fn did_resume_at_offset(&self, task: &dyn SessionTask, offset: i64, total_bytes_expected: i64) {
        if let Some(record) = self.record(task) {
            record.did_resume_at_offset(offset, total_bytes_expected);
        }
        if let Some(handler) = self.handlers.download_resumed.get() {
            handler(task, offset, total_bytes_expected);
        }
    }

    fn did_finish_downloading(&self, task: &dyn SessionTask, location: &Path) -> bool {
        let Some(record) = self.record(task) else {
            return false;
        };

        let destination = self
            .handlers
            .download_finished
            .get()
            .and_then(|handler| handler(task, location))
            .or_else(|| {
                record
                    .destination
                    .as_ref()
                    .map(|destination| destination(location, task.response().as_ref()))
            });

        match destination {
            Some(destination) => {
                self.move_download(task, &record, location, destination);
                true
            }
            None => false,
        }
    }

    fn did_complete(&self, task: &dyn SessionTask, error: Option<SessionError>) {
        let id = task.id();
        let Some(record) = self.record(task) else {
            return;
        };

        if let Some(handler) = self.handlers.task_complete.get() {
            handler(task, error.as_ref());
        }

        let outcome = record.finish(error);
        match outcome.error() {
            None => info!("Task {} completed", id),
            Some(e) if e.is_cancelled() => info!("Task {} cancelled", id),
            Some(e) => warn!("Task {} failed: {}", id, e),
        }

        let _ = self.event_tx.send(SessionEvent::TaskCompleted {
            session: self.id,
            task: id,
            response_data: (!outcome.data.is_empty()).then(|| outcome.data.to_vec()),
            serialized: outcome.serialized.clone(),
            serializer: Some(record.serializer_name()),
            asset_path: record.download_file(),
            error: outcome.error().map(|e| e.to_string()),
            finished_at: Utc::now(),
        });

        if let Some(completion) = record.take_completion() {
            let context = self.completion_context.read().clone();
            context.dispatch(&self.completions, Box::new(move || completion(outcome)));
        }

        self.registry.remove(id);
    }
}

/// Move a file, falling back to copy and delete across file systems
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to)?;
    std::fs::remove_file(from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AuthenticationMethod, ProtectionSpace, ServerTrust};
    use crate::error::{SerializationError, TransportError, TransportErrorKind};
    use crate::security::{test_certs, X509Trust};
    use crate::serializer::HttpResponseSerializer;
    use crate::testing::{test_request, MockBackend};
    use netsession_types::ResponseObject;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;
    use url::Url;

    fn session() -> (SessionManager, Arc<MockBackend>) {
        let backend = MockBackend::new();
        let session = SessionManager::new(backend.clone(), &SessionConfig::default()).unwrap();
        (session, backend)
    }

    fn capture() -> (
        impl FnOnce(TaskOutcome) + Send + 'static,
        oneshot::Receiver<TaskOutcome>,
    ) {
        let (tx, rx) = oneshot::channel();
        (
            move |outcome| {
                let _ = tx.send(outcome);
            },
            rx,
        )
    }

    fn challenge(method: AuthenticationMethod, chain: Option<Vec<crate::security::Certificate>>) -> AuthChallenge {
        AuthChallenge {
            protection_space: ProtectionSpace {
                host: "example.com".to_string(),
                port: 443,
                scheme: "https".to_string(),
                realm: None,
                method,
            },
            server_trust: chain.map(|chain| ServerTrust {
                chain,
                verified_by_transport: false,
            }),
            previous_failure_count: 0,
            failure_response: None,
        }
    }

    #[tokio::test]
    async fn test_data_chunks_are_delivered_concatenated() {
        let (session, backend) = session();
        let (completion, rx) = capture();
        let handle = session.data_task(test_request(), completion).unwrap();
        handle.resume();

        let task = backend.task(handle.id());
        let delegate = backend.delegate();
        for size in [10usize, 20, 30] {
            delegate.did_receive_data(&*task, &Bytes::from(vec![size as u8; size]));
        }
        assert_eq!(session.download_progress(&handle).unwrap().completed(), 60);

        backend.complete(handle.id(), None);
        let outcome = rx.await.unwrap();

        let mut expected = vec![10u8; 10];
        expected.extend(vec![20u8; 20]);
        expected.extend(vec![30u8; 30]);
        assert_eq!(outcome.result.unwrap(), ResponseObject::Data(expected));
        assert!(session.download_progress(&handle).is_none());
    }

    #[tokio::test]
    async fn test_record_is_stable_until_completion() {
        let (session, backend) = session();
        let handle = session.data_task(test_request(), |_| {}).unwrap();

        let first = session.download_progress(&handle).unwrap();
        let second = session.download_progress(&handle).unwrap();
        assert!(first.ptr_eq(&second));

        backend.complete(handle.id(), None);
        assert!(session.download_progress(&handle).is_none());
        assert!(session.upload_progress(&handle).is_none());
    }

    #[tokio::test]
    async fn test_cancel_completes_exactly_once() {
        let (session, _backend) = session();
        let calls = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let c = calls.clone();
        let e = errors.clone();
        let handle = session
            .data_task(test_request(), move |outcome| {
                c.fetch_add(1, Ordering::SeqCst);
                e.lock().push(outcome.result.err());
            })
            .unwrap();
        handle.resume();
        handle.cancel();
        handle.cancel();

        session.wait_for_completions().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(errors.lock()[0], Some(SessionError::Cancelled)));
        assert!(session.download_progress(&handle).is_none());
    }

    #[tokio::test]
    async fn test_progress_cancel_cancels_task() {
        let (session, _backend) = session();
        let (completion, rx) = capture();
        let handle = session.data_task(test_request(), completion).unwrap();
        handle.resume();

        session.download_progress(&handle).unwrap().cancel();

        let outcome = rx.await.unwrap();
        assert!(outcome.error().unwrap().is_cancelled());
        assert_eq!(handle.state(), TaskState::Cancelled);
    }

    #[tokio::test]
    async fn test_concurrent_tasks_do_not_share_progress() {
        let (session, backend) = session();
        let a = session.data_task(test_request(), |_| {}).unwrap();
        let b = session.data_task(test_request(), |_| {}).unwrap();

        let progress_a = session.download_progress(&a).unwrap();
        let seen_by_a = Arc::new(AtomicUsize::new(0));
        let counter = seen_by_a.clone();
        progress_a.observe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let threads: Vec<_> = [(a.id(), 1usize), (b.id(), 2usize)]
            .into_iter()
            .map(|(id, chunk)| {
                let task = backend.task(id);
                let delegate = backend.delegate();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        delegate.did_receive_data(&*task, &Bytes::from(vec![0u8; chunk]));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(progress_a.completed(), 1000);
        assert_eq!(session.download_progress(&b).unwrap().completed(), 2000);
        assert_eq!(seen_by_a.load(Ordering::SeqCst), 1000);
    }

    #[tokio::test]
    async fn test_transport_error_wins_over_serialization_error() {
        let (session, backend) = session();
        session.set_response_serializer(Arc::new(HttpResponseSerializer::new()));

        let (completion, rx) = capture();
        let handle = session.data_task(test_request(), completion).unwrap();
        let task = backend.task(handle.id());
        task.set_response(Response::new(Url::parse("https://example.com").unwrap(), 500));
        backend
            .delegate()
            .did_receive_data(&*task, &Bytes::from_static(b"partial"));

        let timeout = TransportError::new(TransportErrorKind::Timeout, "timed out");
        backend.complete(handle.id(), Some(timeout.into()));

        let outcome = rx.await.unwrap();
        assert!(matches!(outcome.result, Err(SessionError::Transport(_))));
        assert_eq!(outcome.serialized, Some(ResponseObject::Data(b"partial".to_vec())));
    }

    #[tokio::test]
    async fn test_serialization_error_without_transport_error() {
        let (session, backend) = session();
        session.set_response_serializer(Arc::new(HttpResponseSerializer::new()));

        let (completion, rx) = capture();
        let handle = session.data_task(test_request(), completion).unwrap();
        backend
            .task(handle.id())
            .set_response(Response::new(Url::parse("https://example.com").unwrap(), 404));
        backend.complete(handle.id(), None);

        let outcome = rx.await.unwrap();
        assert!(matches!(
            outcome.error().and_then(|e| e.serialization()),
            Some(SerializationError::UnacceptableStatusCode { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_serializer_is_captured_at_creation() {
        let (session, backend) = session();
        let (completion, rx) = capture();
        let handle = session.data_task(test_request(), completion).unwrap();

        session.set_response_serializer(Arc::new(HttpResponseSerializer::new()));
        backend
            .task(handle.id())
            .set_response(Response::new(Url::parse("https://example.com").unwrap(), 500));
        backend.complete(handle.id(), None);

        assert!(rx.await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_trust_rejection_ignores_task_override() {
        let (session, backend) = session();
        let pinned = test_certs::self_signed("example.com");
        let other = test_certs::self_signed("example.com");
        session.set_security_policy(
            SecurityPolicy::with_pinned_certificates(PinningMode::Certificate, [pinned.clone()])
                .with_platform_trust(Arc::new(X509Trust::default())),
        );

        let consulted = Arc::new(AtomicUsize::new(0));
        let c = consulted.clone();
        let options = TaskOptions::new().on_auth_challenge(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
            ChallengeDisposition::UseCredential(Credential::ServerTrust)
        });
        let handle = session.data_task_with(test_request(), options, |_| {}).unwrap();
        let task = backend.task(handle.id());
        let delegate = backend.delegate();

        let rejected = challenge(AuthenticationMethod::ServerTrust, Some(vec![other]));
        assert_eq!(
            delegate.did_receive_challenge(Some(&*task as &dyn SessionTask), &rejected),
            ChallengeDisposition::CancelChallenge
        );
        assert_eq!(consulted.load(Ordering::SeqCst), 0);

        let accepted = challenge(AuthenticationMethod::ServerTrust, Some(vec![pinned]));
        assert_eq!(
            delegate.did_receive_challenge(Some(&*task as &dyn SessionTask), &accepted),
            ChallengeDisposition::UseCredential(Credential::ServerTrust)
        );
        assert_eq!(consulted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_trust_challenges_reach_handlers() {
        let (session, backend) = session();
        session.set_task_challenge_handler(|_, _| {
            ChallengeDisposition::UseCredential(Credential::Basic {
                user: "user".to_string(),
                password: "secret".to_string(),
            })
        });
        session.set_session_challenge_handler(|_| ChallengeDisposition::RejectProtectionSpace);

        let handle = session.data_task(test_request(), |_| {}).unwrap();
        let task = backend.task(handle.id());
        let delegate = backend.delegate();
        let basic = challenge(AuthenticationMethod::HttpBasic, None);

        assert!(matches!(
            delegate.did_receive_challenge(Some(&*task as &dyn SessionTask), &basic),
            ChallengeDisposition::UseCredential(Credential::Basic { .. })
        ));
        assert_eq!(
            delegate.did_receive_challenge(None, &basic),
            ChallengeDisposition::RejectProtectionSpace
        );
    }

    #[tokio::test]
    async fn test_redirect_override_precedes_session_default() {
        let (session, backend) = session();
        session.set_redirect_handler(|_, _, _| None);

        let options = TaskOptions::new()
            .on_redirect(|_, _, request| Some(request.with_header("X-Redirected", "1")));
        let overridden = session.data_task_with(test_request(), options, |_| {}).unwrap();
        let plain = session.data_task(test_request(), |_| {}).unwrap();

        let delegate = backend.delegate();
        let redirect = Response::new(Url::parse("https://example.com/old").unwrap(), 302);

        let followed = delegate
            .will_perform_redirect(&*backend.task(overridden.id()), &redirect, test_request())
            .unwrap();
        assert_eq!(followed.header("x-redirected"), Some("1"));
        assert!(delegate
            .will_perform_redirect(&*backend.task(plain.id()), &redirect, test_request())
            .is_none());
    }

    #[tokio::test]
    async fn test_download_is_moved_to_destination() {
        let (session, backend) = session();
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().join("incoming.tmp");
        std::fs::write(&location, b"payload").unwrap();
        let destination = dir.path().join("saved").join("file.bin");

        let target = destination.clone();
        let options = TaskOptions::new().destination(move |_, _| target.clone());
        let (completion, rx) = capture();
        let handle = session.download_task(test_request(), options, completion).unwrap();

        let task = backend.task(handle.id());
        assert!(backend.delegate().did_finish_downloading(&*task, &location));
        backend.complete(handle.id(), None);

        let outcome = rx.await.unwrap();
        assert_eq!(outcome.result.unwrap(), ResponseObject::File(destination.clone()));
        assert_eq!(std::fs::read(&destination).unwrap(), b"payload");
        assert!(!location.exists());
    }

    #[tokio::test]
    async fn test_failed_download_move_is_reported_on_the_side() {
        let (session, backend) = session();
        let mut events = session.subscribe();
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().join("incoming.tmp");
        std::fs::write(&location, b"payload").unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let target = blocker.join("file.bin");
        let options = TaskOptions::new().destination(move |_, _| target.clone());
        let (completion, rx) = capture();
        let handle = session.download_task(test_request(), options, completion).unwrap();

        let task = backend.task(handle.id());
        assert!(backend.delegate().did_finish_downloading(&*task, &location));
        backend.complete(handle.id(), None);

        let outcome = rx.await.unwrap();
        assert_eq!(outcome.result.unwrap(), ResponseObject::File(location.clone()));
        assert!(location.exists());

        match events.recv().await.unwrap() {
            SessionEvent::DownloadMoveFailed { task, location: at, .. } => {
                assert_eq!(task, handle.id());
                assert_eq!(at, location);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lifecycle_events() {
        let (session, backend) = session();
        let mut events = session.subscribe();
        let handle = session.data_task(test_request(), |_| {}).unwrap();

        handle.resume();
        handle.suspend();
        handle.resume();
        backend.complete(handle.id(), None);

        assert!(matches!(events.recv().await.unwrap(), SessionEvent::TaskResumed { .. }));
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::TaskSuspended { .. }));
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::TaskResumed { .. }));
        match events.recv().await.unwrap() {
            SessionEvent::TaskCompleted { task, serializer, error, .. } => {
                assert_eq!(task, handle.id());
                assert_eq!(serializer.as_deref(), Some("passthrough"));
                assert!(error.is_none());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_task_snapshots_filter_by_kind() {
        let (session, _backend) = session();
        session.data_task(test_request(), |_| {}).unwrap();
        session
            .upload_task_with_data(test_request(), Bytes::from_static(b"x"), TaskOptions::new(), |_| {})
            .unwrap();
        session
            .download_task(test_request(), TaskOptions::new(), |_| {})
            .unwrap();

        assert_eq!(session.tasks().len(), 3);
        assert_eq!(session.data_tasks().len(), 1);
        assert_eq!(session.upload_tasks().len(), 1);
        assert_eq!(session.download_tasks()[0].kind(), TaskKind::Download);
    }

    #[tokio::test]
    async fn test_resume_data_round_trip() {
        let (session, backend) = session();
        let handle = session
            .download_task(test_request(), TaskOptions::new(), |_| {})
            .unwrap();
        backend.task(handle.id()).set_resume_data(ResumeData {
            request: test_request(),
            partial_path: PathBuf::from("/tmp/partial"),
            bytes_written: 512,
            expected_total: Some(1024),
            etag: Some("\"v1\"".to_string()),
        });

        let data = handle.cancel_producing_resume_data().unwrap();
        let resumed = session
            .download_task_with_resume_data(&data, TaskOptions::new(), |_| {})
            .unwrap();
        assert_eq!(resumed.kind(), TaskKind::Download);

        assert!(matches!(
            session.download_task_with_resume_data(b"garbage", TaskOptions::new(), |_| {}),
            Err(SessionError::InvalidResumeData(_))
        ));
    }

    #[tokio::test]
    async fn test_invalidate_cancels_pending_and_refuses_new_tasks() {
        let (session, _backend) = session();
        let invalidated = Arc::new(AtomicUsize::new(0));
        let i = invalidated.clone();
        session.set_invalidated_handler(move |_| {
            i.fetch_add(1, Ordering::SeqCst);
        });

        let (completion, rx) = capture();
        let handle = session.data_task(test_request(), completion).unwrap();
        handle.resume();

        session.invalidate(true);
        assert!(rx.await.unwrap().error().unwrap().is_cancelled());
        assert_eq!(invalidated.load(Ordering::SeqCst), 1);
        assert!(matches!(
            session.data_task(test_request(), |_| {}),
            Err(SessionError::SessionInvalidated)
        ));
    }

    #[tokio::test]
    async fn test_events_for_unknown_tasks_are_ignored() {
        let (session, backend) = session();
        let handle = session.data_task(test_request(), |_| {}).unwrap();
        let task = backend.task(handle.id());
        backend.complete(handle.id(), None);

        let delegate = backend.delegate();
        delegate.did_receive_data(&*task, &Bytes::from_static(b"late"));
        delegate.did_complete(&*task, None);
        session.wait_for_completions().await;
    }
}
