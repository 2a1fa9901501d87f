//! Task delegate - the per-task record kept for a task's whole lifetime
//!
//! Holds the task's progress trackers, its completion callback, its handler
//! overrides, the serializer captured at creation and the buffered body.

use crate::backend::SessionTask;
use crate::engine::{DownloadDestination, Progress, TaskOverrides};
use crate::error::SessionError;
use crate::serializer::{ResponseSerializer, Serialized};
use bytes::{Bytes, BytesMut};
use netsession_types::{expected_total, Response, ResponseObject, TaskId, TaskKind};
use parking_lot::Mutex;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a completion callback receives
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task: TaskId,
    pub response: Option<Response>,
    /// Raw body buffered for data and upload tasks
    pub data: Bytes,
    /// Serialized object, present even when serialization reported an error
    pub serialized: Option<ResponseObject>,
    /// The value handed to the caller: a transport error wins over a serialization error
    pub result: Result<ResponseObject, SessionError>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error(&self) -> Option<&SessionError> {
        self.result.as_ref().err()
    }
}

pub type CompletionHandler = Box<dyn FnOnce(TaskOutcome) + Send + 'static>;

pub struct TaskDelegate {
    task: Arc<dyn SessionTask>,
    upload_progress: Progress,
    download_progress: Progress,
    completion: Mutex<Option<CompletionHandler>>,
    pub(crate) overrides: TaskOverrides,
    serializer: Arc<dyn ResponseSerializer>,
    data: Mutex<BytesMut>,
    pub(crate) destination: Option<DownloadDestination>,
    download_file: Mutex<Option<PathBuf>>,
}

impl TaskDelegate {
    pub(crate) fn new(
        task: Arc<dyn SessionTask>,
        overrides: TaskOverrides,
        serializer: Arc<dyn ResponseSerializer>,
        destination: Option<DownloadDestination>,
        completion: Option<CompletionHandler>,
    ) -> Self {
        let delegate = Self {
            task,
            upload_progress: Progress::new(),
            download_progress: Progress::new(),
            completion: Mutex::new(completion),
            overrides,
            serializer,
            data: Mutex::new(BytesMut::new()),
            destination,
            download_file: Mutex::new(None),
        };
        delegate.wire_progress_controls();
        delegate
    }

    /// Cancelling or pausing either progress controls the task itself
    fn wire_progress_controls(&self) {
        for progress in [&self.upload_progress, &self.download_progress] {
            let task = Arc::downgrade(&self.task);
            progress.set_cancellation_handler(move || {
                if let Some(task) = task.upgrade() {
                    task.cancel();
                }
            });
            let task = Arc::downgrade(&self.task);
            progress.set_pausing_handler(move || {
                if let Some(task) = task.upgrade() {
                    task.suspend();
                }
            });
            let task = Arc::downgrade(&self.task);
            progress.set_resuming_handler(move || {
                if let Some(task) = task.upgrade() {
                    task.resume();
                }
            });
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id()
    }

    pub fn task(&self) -> &Arc<dyn SessionTask> {
        &self.task
    }

    pub fn upload_progress(&self) -> &Progress {
        &self.upload_progress
    }

    pub fn download_progress(&self) -> &Progress {
        &self.download_progress
    }

    pub fn serializer_name(&self) -> String {
        self.serializer.name().to_string()
    }

    // ========================================================================
    // Event handling
    // ========================================================================

    pub(crate) fn did_receive_data(&self, data: &Bytes) {
        let expected = self
            .task
            .response()
            .and_then(|r| r.expected_content_length());

        if self.task.kind() != TaskKind::Download {
            self.data.lock().extend_from_slice(data);
        }
        self.download_progress.advance(data.len() as u64, expected);
    }

    pub(crate) fn did_send_body_data(&self, total_bytes_sent: i64, total_bytes_expected: i64) {
        self.upload_progress.advance_to(
            total_bytes_sent.max(0) as u64,
            expected_total(total_bytes_expected),
        );
    }

    pub(crate) fn did_write_data(&self, total_bytes_written: i64, total_bytes_expected: i64) {
        self.download_progress.advance_to(
            total_bytes_written.max(0) as u64,
            expected_total(total_bytes_expected),
        );
    }

    pub(crate) fn did_resume_at_offset(&self, offset: i64, total_bytes_expected: i64) {
        self.download_progress
            .advance_to(offset.max(0) as u64, expected_total(total_bytes_expected));
    }

    pub(crate) fn set_download_file(&self, path: PathBuf) {
        *self.download_file.lock() = Some(path);
    }

    pub fn download_file(&self) -> Option<PathBuf> {
        self.download_file.lock().clone()
    }

    pub(crate) fn take_completion(&self) -> Option<CompletionHandler> {
        self.completion.lock().take()
    }

    /// Serialize the buffered body and settle the caller-visible result
    ///
    /// Serialization runs even when the transport failed so the partial
    /// object can still be reported.
    pub(crate) fn finish(&self, error: Option<SessionError>) -> TaskOutcome {
        let data = std::mem::take(&mut *self.data.lock()).freeze();
        let response = self.task.response();

        let serialized = match self.download_file() {
            Some(path) => Serialized::ok(ResponseObject::File(path)),
            None => self.serializer.serialize(response.as_ref(), &data),
        };

        let result = match (error, serialized.error) {
            (Some(transport), _) => Err(transport),
            (None, Some(serialization)) => Err(SessionError::Serialization(serialization)),
            (None, None) => Ok(serialized
                .object
                .clone()
                .unwrap_or(ResponseObject::Empty)),
        };

        TaskOutcome {
            task: self.task.id(),
            response,
            data,
            serialized: serialized.object,
            result,
        }
    }
}

impl fmt::Debug for TaskDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDelegate")
            .field("task", &self.task.id())
            .field("upload_progress", &self.upload_progress)
            .field("download_progress", &self.download_progress)
            .field("serializer", &self.serializer.name())
            .finish()
    }
}
