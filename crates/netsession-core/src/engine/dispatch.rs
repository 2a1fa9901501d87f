//! Completion dispatch
//!
//! Completion callbacks never run on the thread delivering the terminal
//! event; they are scheduled on an explicit [`CompletionContext`] and tracked
//! so callers can wait for every scheduled callback to finish.

use crate::error::SessionError;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;

/// A scheduled unit of work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where completion callbacks run
#[derive(Clone)]
pub enum CompletionContext {
    /// As a task on a tokio runtime (the default: the runtime the session was built on)
    Runtime(Handle),
    /// On the runtime's blocking pool, for callbacks that do blocking work
    Blocking(Handle),
    /// Through a caller-provided executor, e.g. a UI main loop
    Custom(Arc<dyn Fn(Job) + Send + Sync>),
}

impl CompletionContext {
    /// The runtime the caller is running on
    pub fn current() -> Result<Self, SessionError> {
        Handle::try_current()
            .map(CompletionContext::Runtime)
            .map_err(|e| {
                SessionError::InvalidConfiguration(format!(
                    "no tokio runtime for completion callbacks: {}",
                    e
                ))
            })
    }

    pub fn custom(executor: impl Fn(Job) + Send + Sync + 'static) -> Self {
        CompletionContext::Custom(Arc::new(executor))
    }

    /// Schedule `job`, counting it in `tracker` until it has run
    pub(crate) fn dispatch(&self, tracker: &TaskTracker, job: Job) {
        match self {
            CompletionContext::Runtime(handle) => {
                tracker.spawn_on(async move { job() }, handle);
            }
            CompletionContext::Blocking(handle) => {
                tracker.spawn_blocking_on(job, handle);
            }
            CompletionContext::Custom(executor) => {
                let token = tracker.token();
                executor(Box::new(move || {
                    job();
                    drop(token);
                }));
            }
        }
    }
}

impl fmt::Debug for CompletionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionContext::Runtime(_) => f.write_str("CompletionContext::Runtime"),
            CompletionContext::Blocking(_) => f.write_str("CompletionContext::Blocking"),
            CompletionContext::Custom(_) => f.write_str("CompletionContext::Custom"),
        }
    }
}

/// Wait for every job tracked so far, then accept new ones again
pub(crate) async fn drain(tracker: &TaskTracker) {
    tracker.close();
    tracker.wait().await;
    tracker.reopen();
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_runtime_context_runs_jobs() {
        let tracker = TaskTracker::new();
        let context = CompletionContext::current().unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let count = count.clone();
            context.dispatch(&tracker, Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }

        drain(&tracker).await;
        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert!(!tracker.is_closed());
    }

    #[tokio::test]
    async fn test_custom_context_is_tracked_until_run() {
        let queue: Arc<Mutex<Vec<Job>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = queue.clone();
        let context = CompletionContext::custom(move |job| sink.lock().push(job));
        let tracker = TaskTracker::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let r = ran.clone();
        context.dispatch(&tracker, Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(tracker.len(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        for job in queue.lock().drain(..) {
            job();
        }
        drain(&tracker).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_runtime_is_a_configuration_error() {
        assert!(matches!(
            CompletionContext::current(),
            Err(SessionError::InvalidConfiguration(_))
        ));
    }
}
