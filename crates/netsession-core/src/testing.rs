//! In-memory backend for driving delegate events deterministically in tests

use crate::backend::{SessionBackend, SessionDelegate, SessionTask, TaskSource};
use crate::error::SessionError;
use netsession_types::{Request, Response, ResumeData, TaskId, TaskKind, TaskState};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use url::Url;

pub(crate) struct MockTask {
    id: TaskId,
    kind: TaskKind,
    request: Request,
    state: Mutex<TaskState>,
    response: Mutex<Option<Response>>,
    resume_data: Mutex<Option<ResumeData>>,
    delegate: Option<Weak<dyn SessionDelegate>>,
}

impl MockTask {
    /// A task not attached to any session
    pub fn detached(id: TaskId, kind: TaskKind) -> Arc<dyn SessionTask> {
        Arc::new(Self::new(id, kind, test_request(), None))
    }

    fn new(
        id: TaskId,
        kind: TaskKind,
        request: Request,
        delegate: Option<Weak<dyn SessionDelegate>>,
    ) -> Self {
        Self {
            id,
            kind,
            request,
            state: Mutex::new(TaskState::Created),
            response: Mutex::new(None),
            resume_data: Mutex::new(None),
            delegate,
        }
    }

    pub fn set_response(&self, response: Response) {
        *self.response.lock() = Some(response);
    }

    pub fn set_resume_data(&self, data: ResumeData) {
        *self.resume_data.lock() = Some(data);
    }

    fn set_state(&self, state: TaskState) -> bool {
        let mut current = self.state.lock();
        if current.is_terminal() {
            return false;
        }
        *current = state;
        true
    }
}

impl SessionTask for MockTask {
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
        self.request.clone()
    }

    fn response(&self) -> Option<Response> {
        self.response.lock().clone()
    }

    fn resume(&self) {
        self.set_state(TaskState::Running);
    }

    fn suspend(&self) {
        self.set_state(TaskState::Suspended);
    }

    /// Cancelling completes the task synchronously, as a real session would shortly after
    fn cancel(&self) {
        if !self.set_state(TaskState::Cancelled) {
            return;
        }
        if let Some(delegate) = self.delegate.as_ref().and_then(|d| d.upgrade()) {
            delegate.did_complete(self, Some(SessionError::Cancelled));
        }
    }

    fn cancel_producing_resume_data(&self) -> Option<ResumeData> {
        let data = self.resume_data.lock().take();
        self.cancel();
        data
    }
}

#[derive(Default)]
pub(crate) struct MockBackend {
    delegate: Mutex<Option<Weak<dyn SessionDelegate>>>,
    tasks: Mutex<BTreeMap<TaskId, Arc<MockTask>>>,
    next_id: AtomicU64,
    invalidated: AtomicBool,
    invalidation_reported: AtomicBool,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delegate(&self) -> Arc<dyn SessionDelegate> {
        self.delegate
            .lock()
            .as_ref()
            .and_then(|d| d.upgrade())
            .expect("backend is bound to a live session")
    }

    pub fn task(&self, id: TaskId) -> Arc<MockTask> {
        self.tasks.lock().get(&id).cloned().expect("task exists")
    }

    /// Deliver the terminal event and drop the task from the active list
    pub fn complete(&self, id: TaskId, error: Option<SessionError>) {
        let task = self.task(id);
        let state = if error.is_some() {
            TaskState::Failed
        } else {
            TaskState::Completed
        };
        task.set_state(state);
        self.tasks.lock().remove(&id);
        self.delegate().did_complete(&*task, error);
        self.finish_invalidation();
    }

    fn finish_invalidation(&self) {
        if self.invalidated.load(Ordering::Acquire)
            && self.active_tasks().is_empty()
            && !self.invalidation_reported.swap(true, Ordering::AcqRel)
        {
            self.delegate().did_become_invalid(None);
        }
    }
}

impl SessionBackend for MockBackend {
    fn bind(&self, delegate: Weak<dyn SessionDelegate>) {
        *self.delegate.lock() = Some(delegate);
    }

    fn create_task(
        &self,
        request: Request,
        source: TaskSource,
    ) -> Result<Arc<dyn SessionTask>, SessionError> {
        if self.invalidated.load(Ordering::Acquire) {
            return Err(SessionError::SessionInvalidated);
        }
        let id = TaskId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let task = Arc::new(MockTask::new(
            id,
            source.kind(),
            request,
            self.delegate.lock().clone(),
        ));
        self.tasks.lock().insert(id, task.clone());
        Ok(task)
    }

    fn active_tasks(&self) -> Vec<Arc<dyn SessionTask>> {
        self.tasks
            .lock()
            .values()
            .filter(|t| !t.state().is_terminal())
            .map(|t| t.clone() as Arc<dyn SessionTask>)
            .collect()
    }

    fn invalidate(&self, cancel_pending: bool) {
        self.invalidated.store(true, Ordering::Release);
        if cancel_pending {
            for task in self.active_tasks() {
                self.complete(task.id(), Some(SessionError::Cancelled));
            }
        }
        self.finish_invalidation();
    }
}

pub(crate) fn test_request() -> Request {
    Request::get(Url::parse("https://example.com/resource").expect("valid url"))
}
