//! Reqwest backend - runs session tasks over a `reqwest` client
//!
//! Each resumed task runs as one tokio task that:
//! - Follows redirects itself so the delegate can veto or rewrite them
//! - Decides server trust in the TLS handshake, before any request bytes are sent
//! - Raises an HTTP Basic challenge on `401` and retries once with the credential
//! - Streams bodies chunk by chunk into the delegate or a download file
//! - Pauses by holding the stream between chunks

use crate::backend::handshake::{client_tls_config, TrustGate};
use crate::backend::{
    AuthChallenge, AuthenticationMethod, BodyStream, CachedResponse, ChallengeDisposition,
    Credential, ProtectionSpace, ResponseDisposition, SessionBackend, SessionDelegate,
    SessionTask, TaskSource, UploadBody,
};
use crate::error::{SessionError, TransportError, TransportErrorKind};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use netsession_types::{
    HttpMethod, Request, Response, ResumeData, SessionConfig, TaskId, TaskKind, TaskState,
    TRANSFER_SIZE_UNKNOWN,
};
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// [`SessionBackend`] over a `reqwest` client
pub struct ReqwestBackend {
    shared: Arc<BackendShared>,
}

struct BackendShared {
    client: Client,
    runtime: Handle,
    config: SessionConfig,
    gate: Arc<TrustGate>,
    tasks: RwLock<HashMap<TaskId, Arc<ReqwestTask>>>,
    next_id: AtomicU64,
    invalidated: AtomicBool,
    invalidation_reported: AtomicBool,
    cache: Mutex<HashMap<Url, CachedResponse>>,
}

impl ReqwestBackend {
    /// Backend that validates certificates against native roots before the
    /// trust challenge is raised
    pub fn new(config: &SessionConfig) -> Result<Self, SessionError> {
        Self::with_certificate_validation(config, true)
    }

    /// With `validate = false` the session security policy alone decides trust
    /// (needed to pin self-signed certificates)
    pub fn with_certificate_validation(
        config: &SessionConfig,
        validate: bool,
    ) -> Result<Self, SessionError> {
        let runtime = Handle::try_current().map_err(|e| {
            SessionError::InvalidConfiguration(format!("no tokio runtime for transfers: {}", e))
        })?;

        let gate = Arc::new(TrustGate::new(validate));
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .use_preconfigured_tls(client_tls_config(gate.clone())?)
            .build()
            .map_err(|e| SessionError::InvalidConfiguration(e.to_string()))?;

        Ok(Self {
            shared: Arc::new(BackendShared {
                client,
                runtime,
                config: config.clone(),
                gate,
                tasks: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                invalidated: AtomicBool::new(false),
                invalidation_reported: AtomicBool::new(false),
                cache: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Response stored by the cache hook for `url`
    pub fn cached_response(&self, url: &Url) -> Option<CachedResponse> {
        self.shared.cache.lock().get(url).cloned()
    }
}

impl SessionBackend for ReqwestBackend {
    fn bind(&self, delegate: Weak<dyn SessionDelegate>) {
        self.shared.gate.bind(delegate);
    }

    fn create_task(
        &self,
        request: Request,
        source: TaskSource,
    ) -> Result<Arc<dyn SessionTask>, SessionError> {
        if self.shared.invalidated.load(Ordering::Acquire) {
            return Err(SessionError::SessionInvalidated);
        }
        if !matches!(request.url.scheme(), "http" | "https") {
            return Err(SessionError::InvalidRequest(format!(
                "unsupported URL scheme: {}",
                request.url.scheme()
            )));
        }

        let id = TaskId(self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let task = Arc::new_cyclic(|this| ReqwestTask {
            id,
            kind: source.kind(),
            original_request: request.clone(),
            current_request: Mutex::new(request),
            source,
            state: Mutex::new(TaskState::Created),
            response: Mutex::new(None),
            started: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            keep_partial: AtomicBool::new(false),
            partial: Mutex::new(None),
            shared: Arc::downgrade(&self.shared),
            this: this.clone(),
        });

        self.shared.tasks.write().insert(id, task.clone());
        debug!("Backend created task {}", id);
        Ok(task)
    }

    fn active_tasks(&self) -> Vec<Arc<dyn SessionTask>> {
        self.shared
            .tasks
            .read()
            .values()
            .map(|task| task.clone() as Arc<dyn SessionTask>)
            .collect()
    }

    fn invalidate(&self, cancel_pending: bool) {
        self.shared.invalidated.store(true, Ordering::Release);
        if cancel_pending {
            let tasks: Vec<Arc<ReqwestTask>> = self.shared.tasks.read().values().cloned().collect();
            for task in tasks {
                task.cancel();
            }
        }
        self.shared.finish_invalidation();
    }
}

impl BackendShared {
    fn delegate(&self) -> Option<Arc<dyn SessionDelegate>> {
        self.gate.delegate()
    }

    fn finish_invalidation(&self) {
        if self.invalidated.load(Ordering::Acquire)
            && self.tasks.read().is_empty()
            && !self.invalidation_reported.swap(true, Ordering::AcqRel)
        {
            if let Some(delegate) = self.delegate() {
                delegate.did_become_invalid(None);
            }
        }
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// Bytes of a download written so far
#[derive(Debug, Clone)]
struct PartialDownload {
    path: PathBuf,
    written: u64,
    expected: Option<u64>,
    etag: Option<String>,
}

pub struct ReqwestTask {
    id: TaskId,
    kind: TaskKind,
    original_request: Request,
    current_request: Mutex<Request>,
    source: TaskSource,
    state: Mutex<TaskState>,
    response: Mutex<Option<Response>>,
    started: AtomicBool,
    paused: AtomicBool,
    cancel: CancellationToken,
    /// Keep the partial download file for resume data
    keep_partial: AtomicBool,
    partial: Mutex<Option<PartialDownload>>,
    shared: Weak<BackendShared>,
    this: Weak<ReqwestTask>,
}

impl SessionTask for ReqwestTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn kind(&self) -> TaskKind {
        self.kind
    }

    fn state(&self) -> TaskState {
        *self.state.lock()
    }

    fn original_request(&self) -> Request {
        self.original_request.clone()
    }

    fn current_request(&self) -> Request {
        self.current_request.lock().clone()
    }

    fn response(&self) -> Option<Response> {
        self.response.lock().clone()
    }

    fn resume(&self) {
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return;
            }
            *state = TaskState::Running;
        }
        self.paused.store(false, Ordering::Release);
        self.start();
    }

    fn suspend(&self) {
        let mut state = self.state.lock();
        if *state == TaskState::Running {
            *state = TaskState::Suspended;
            self.paused.store(true, Ordering::Release);
        }
    }

    fn cancel(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.cancel.cancel();
        // A task that never ran still has to deliver its completion
        self.start();
    }

    fn cancel_producing_resume_data(&self) -> Option<ResumeData> {
        if self.kind != TaskKind::Download {
            self.cancel();
            return None;
        }

        self.keep_partial.store(true, Ordering::Release);
        let partial = self.partial.lock().clone();
        self.cancel();

        let partial = partial.filter(|p| p.written > 0)?;
        Some(ResumeData {
            request: self.current_request(),
            partial_path: partial.path,
            bytes_written: partial.written,
            expected_total: partial.expected,
            etag: partial.etag,
        })
    }
}

impl ReqwestTask {
    /// Spawn the transfer the first time the task is resumed or cancelled
    fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let (Some(this), Some(shared)) = (self.this.upgrade(), self.shared.upgrade()) else {
            return;
        };
        shared.runtime.spawn(this.run());
    }

    async fn run(self: Arc<Self>) {
        let result = if self.cancel.is_cancelled() {
            Err(SessionError::Cancelled)
        } else {
            tokio::select! {
                result = self.perform() => result,
                _ = self.cancel.cancelled() => Err(SessionError::Cancelled),
            }
        };
        self.finish(result.err()).await;
    }

    async fn finish(&self, error: Option<SessionError>) {
        let state = match &error {
            None => TaskState::Completed,
            Some(SessionError::Cancelled) => TaskState::Cancelled,
            Some(_) => TaskState::Failed,
        };
        *self.state.lock() = state;

        if error.is_some() && !self.keep_partial.load(Ordering::Acquire) {
            let partial = self.partial.lock().take();
            if let Some(partial) = partial {
                let _ = tokio::fs::remove_file(&partial.path).await;
            }
        }

        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.tasks.write().remove(&self.id);
        match &error {
            None => debug!("Backend task {} finished", self.id),
            Some(e) => debug!("Backend task {} ended: {}", self.id, e),
        }

        if let Some(delegate) = shared.delegate() {
            delegate.did_complete(self, error);
        }
        shared.finish_invalidation();
    }

    async fn wait_while_paused(&self) {
        let mut was_paused = false;
        while self.paused.load(Ordering::Acquire) {
            if !was_paused {
                info!("Task {} paused, waiting to resume", self.id);
                was_paused = true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if was_paused {
            info!("Task {} resumed", self.id);
        }
    }

    fn context(&self) -> Result<(Arc<BackendShared>, Arc<dyn SessionDelegate>), SessionError> {
        let shared = self.shared.upgrade().ok_or(SessionError::SessionInvalidated)?;
        let delegate = shared.delegate().ok_or(SessionError::SessionInvalidated)?;
        Ok((shared, delegate))
    }

    async fn perform(&self) -> Result<(), SessionError> {
        let (shared, delegate) = self.context()?;
        let resume = match &self.source {
            TaskSource::ResumedDownload(resume) => Some(resume.clone()),
            _ => None,
        };

        let mut request = self.original_request.clone();
        let mut redirects = 0u32;
        let mut auth_failures = 0u32;

        loop {
            self.wait_while_paused().await;
            *self.current_request.lock() = request.clone();

            let builder = self.build(&shared, &delegate, &request, resume.as_ref()).await?;
            let reply = match builder.send().await {
                Ok(reply) => reply,
                Err(e) => {
                    let host = request.host().unwrap_or_default();
                    if request.url.scheme() == "https" && shared.gate.was_rejected(host) {
                        return Err(SessionError::TrustRejected {
                            host: host.to_string(),
                        });
                    }
                    return Err(e.into());
                }
            };

            let response = convert_response(&reply);

            if response.is_redirect() {
                if let Some(next) = redirected_request(&request, &response)? {
                    redirects += 1;
                    if redirects > shared.config.max_redirects {
                        return Err(TransportError::new(
                            TransportErrorKind::Redirect,
                            format!("more than {} redirects", shared.config.max_redirects),
                        )
                        .into());
                    }
                    if let Some(next) = delegate.will_perform_redirect(self, &response, next) {
                        debug!("Task {} redirected to {}", self.id, next.url);
                        request = next;
                        continue;
                    }
                }
            }

            if response.status == 401 && auth_failures == 0 {
                let challenge = basic_challenge(&request, &response, auth_failures);
                match delegate.did_receive_challenge(Some(self), &challenge) {
                    ChallengeDisposition::UseCredential(Credential::Basic { user, password }) => {
                        let token = STANDARD.encode(format!("{}:{}", user, password));
                        request.set_header("Authorization", format!("Basic {}", token));
                        auth_failures += 1;
                        continue;
                    }
                    ChallengeDisposition::CancelChallenge => return Err(SessionError::Cancelled),
                    _ => {}
                }
            }

            *self.response.lock() = Some(response.clone());
            if delegate.did_receive_response(self, &response) == ResponseDisposition::Cancel {
                return Err(SessionError::Cancelled);
            }

            return match self.kind {
                TaskKind::Download => {
                    self.receive_download(&shared, &delegate, reply, &response, resume.as_ref())
                        .await
                }
                _ => self.receive_data(&shared, &delegate, reply, &response).await,
            };
        }
    }

    async fn build(
        &self,
        shared: &BackendShared,
        delegate: &Arc<dyn SessionDelegate>,
        request: &Request,
        resume: Option<&ResumeData>,
    ) -> Result<reqwest::RequestBuilder, SessionError> {
        let mut builder = shared
            .client
            .request(convert_method(request.method), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = request.timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }

        if let Some(resume) = resume {
            builder = builder.header("Range", format!("bytes={}-", resume.bytes_written));
            if let Some(etag) = &resume.etag {
                builder = builder.header("If-Range", etag.as_str());
            }
        }

        let body = match &self.source {
            TaskSource::Upload(UploadBody::Data(data)) => {
                let total = data.len() as u64;
                let stream: BodyStream =
                    futures::stream::once(futures::future::ready(Ok(data.clone()))).boxed();
                Some((stream, Some(total)))
            }
            TaskSource::Upload(UploadBody::File(path)) => {
                let file = tokio::fs::File::open(path).await?;
                let total = file.metadata().await?.len();
                Some((ReaderStream::new(file).boxed(), Some(total)))
            }
            TaskSource::Upload(UploadBody::Stream) => {
                let stream = delegate.need_new_body_stream(self).ok_or_else(|| {
                    SessionError::InvalidRequest("no body stream provided for upload".to_string())
                })?;
                let total = request
                    .header("content-length")
                    .and_then(|v| v.trim().parse().ok());
                Some((stream, total))
            }
            _ => None,
        };

        match body {
            Some((stream, total)) => {
                if let (Some(total), None) = (total, request.header("content-length")) {
                    builder = builder.header("Content-Length", total.to_string());
                }
                builder = builder.body(self.observed_body(delegate.clone(), stream, total));
            }
            None => {
                if let Some(body) = &request.body {
                    builder = builder.body(body.clone());
                }
            }
        }
        Ok(builder)
    }

    /// Body that reports send progress as reqwest consumes it
    fn observed_body(
        &self,
        delegate: Arc<dyn SessionDelegate>,
        stream: BodyStream,
        total: Option<u64>,
    ) -> reqwest::Body {
        let task = self.this.clone();
        let expected = total.map(|t| t as i64).unwrap_or(TRANSFER_SIZE_UNKNOWN);
        let mut sent: i64 = 0;

        let observed = stream.inspect(move |chunk| {
            if let (Ok(bytes), Some(task)) = (chunk, task.upgrade()) {
                let len = bytes.len() as i64;
                sent += len;
                delegate.did_send_body_data(&*task, len, sent, expected);
            }
        });
        reqwest::Body::wrap_stream(observed)
    }

    async fn receive_data(
        &self,
        shared: &BackendShared,
        delegate: &Arc<dyn SessionDelegate>,
        reply: reqwest::Response,
        response: &Response,
    ) -> Result<(), SessionError> {
        let cacheable = self.current_request().method == HttpMethod::Get && response.is_success();
        let mut cached = BytesMut::new();
        let mut stream = reply.bytes_stream();

        while let Some(chunk) = stream.next().await {
            self.wait_while_paused().await;
            let chunk = chunk?;
            if cacheable {
                cached.extend_from_slice(&chunk);
            }
            delegate.did_receive_data(self, &chunk);
        }

        if cacheable {
            let proposed = CachedResponse {
                response: response.clone(),
                data: cached.freeze(),
            };
            if let Some(stored) = delegate.will_cache_response(self, proposed) {
                shared
                    .cache
                    .lock()
                    .insert(stored.response.url.clone(), stored);
            }
        }
        Ok(())
    }

    async fn receive_download(
        &self,
        shared: &BackendShared,
        delegate: &Arc<dyn SessionDelegate>,
        reply: reqwest::Response,
        response: &Response,
        resume: Option<&ResumeData>,
    ) -> Result<(), SessionError> {
        let etag = response.header("etag").map(str::to_string);
        let resumed = resume.filter(|_| response.status == 206);

        let (path, mut written, expected) = match resumed {
            Some(resume) => {
                let expected = content_range_total(response)
                    .or(resume.expected_total)
                    .or_else(|| {
                        response
                            .expected_content_length()
                            .map(|len| len + resume.bytes_written)
                    });
                info!(
                    "Task {} resuming download at byte {}",
                    self.id, resume.bytes_written
                );
                delegate.did_resume_at_offset(
                    self,
                    resume.bytes_written as i64,
                    expected.map(|t| t as i64).unwrap_or(TRANSFER_SIZE_UNKNOWN),
                );
                (resume.partial_path.clone(), resume.bytes_written, expected)
            }
            None => {
                if let Some(stale) = resume {
                    // Server ignored the range; start over
                    let _ = tokio::fs::remove_file(&stale.partial_path).await;
                }
                tokio::fs::create_dir_all(&shared.config.download_dir).await?;
                let path = shared
                    .config
                    .download_dir
                    .join(format!("{}.download", Uuid::new_v4()));
                (path, 0, response.expected_content_length())
            }
        };

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(written > 0)
            .truncate(written == 0)
            .open(&path)
            .await?;

        *self.partial.lock() = Some(PartialDownload {
            path: path.clone(),
            written,
            expected,
            etag: etag.clone(),
        });

        let expected_i64 = expected.map(|t| t as i64).unwrap_or(TRANSFER_SIZE_UNKNOWN);
        let mut stream = reply.bytes_stream();
        while let Some(chunk) = stream.next().await {
            self.wait_while_paused().await;
            let chunk: Bytes = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;

            if let Some(partial) = self.partial.lock().as_mut() {
                partial.written = written;
            }
            delegate.did_write_data(self, chunk.len() as i64, written as i64, expected_i64);
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        info!("Task {} downloaded {} bytes", self.id, written);
        *self.partial.lock() = None;

        if !delegate.did_finish_downloading(self, &path) {
            let _ = tokio::fs::remove_file(&path).await;
        }
        Ok(())
    }
}

// ============================================================================
// Conversions
// ============================================================================

fn convert_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

fn convert_response(reply: &reqwest::Response) -> Response {
    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in reply.headers() {
        let Ok(value) = value.to_str() else {
            continue;
        };
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    Response {
        url: reply.url().clone(),
        status: reply.status().as_u16(),
        headers,
    }
}

/// Follow-up request for a redirect response, if it names a location
fn redirected_request(
    request: &Request,
    response: &Response,
) -> Result<Option<Request>, SessionError> {
    let Some(location) = response.header("location") else {
        return Ok(None);
    };
    let url = request
        .url
        .join(location)
        .map_err(|e| SessionError::InvalidRequest(format!("bad redirect location: {}", e)))?;

    let mut next = request.clone();
    let rewrites_to_get = response.status == 303
        || (matches!(response.status, 301 | 302) && request.method == HttpMethod::Post);
    if rewrites_to_get {
        next.method = HttpMethod::Get;
        next.body = None;
        next.headers
            .retain(|k, _| !k.eq_ignore_ascii_case("content-type") && !k.eq_ignore_ascii_case("content-length"));
    }
    if url.host_str() != request.url.host_str() {
        next.headers.retain(|k, _| !k.eq_ignore_ascii_case("authorization"));
    }
    next.url = url;
    Ok(Some(next))
}

fn basic_challenge(request: &Request, response: &Response, failures: u32) -> AuthChallenge {
    let realm = response.header("www-authenticate").and_then(|value| {
        value
            .split("realm=")
            .nth(1)
            .map(|s| s.split(',').next().unwrap_or(s).trim_matches('"').to_string())
    });

    AuthChallenge {
        protection_space: ProtectionSpace {
            host: request.host().unwrap_or_default().to_string(),
            port: request.url.port_or_known_default().unwrap_or(80),
            scheme: request.url.scheme().to_string(),
            realm,
            method: AuthenticationMethod::HttpBasic,
        },
        server_trust: None,
        previous_failure_count: failures,
        failure_response: Some(response.clone()),
    }
}

/// Total size from `Content-Range: bytes start-end/total`
fn content_range_total(response: &Response) -> Option<u64> {
    response
        .header("content-range")
        .and_then(|range| range.rsplit('/').next())
        .filter(|total| *total != "*")
        .and_then(|total| total.trim().parse().ok())
}
