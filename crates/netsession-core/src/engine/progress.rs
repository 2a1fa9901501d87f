//! Progress tracker - per-task observable transfer counters
//!
//! Updated from the task's event stream, read from any thread. The completed
//! count never decreases and a total is only recorded once the transport
//! reports a definite (positive) size.

use netsession_types::ProgressSnapshot;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;

/// Change observer for a [`Progress`]
pub type ProgressObserver = Arc<dyn Fn(ProgressSnapshot) + Send + Sync>;

type ControlHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ProgressState {
    completed: u64,
    total: Option<u64>,
    cancelled: bool,
    paused: bool,
}

#[derive(Default)]
struct ControlHandlers {
    cancel: Option<ControlHandler>,
    pause: Option<ControlHandler>,
    resume: Option<ControlHandler>,
}

#[derive(Default)]
struct ProgressInner {
    state: Mutex<ProgressState>,
    observers: RwLock<Vec<ProgressObserver>>,
    handlers: Mutex<ControlHandlers>,
}

/// Transfer progress of one direction (upload or download) of one task
///
/// Cloning yields another handle to the same counters.
#[derive(Clone, Default)]
pub struct Progress {
    inner: Arc<ProgressInner>,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` completed units, updating the total if a definite one is reported
    pub fn advance(&self, delta: u64, new_total: Option<u64>) {
        let snapshot = {
            let mut state = self.inner.state.lock();
            state.completed = state.completed.saturating_add(delta);
            Self::apply_total(&mut state, new_total);
            Self::snapshot_of(&state)
        };
        self.notify(snapshot);
    }

    /// Move the completed count to an absolute value; smaller values are ignored
    pub fn advance_to(&self, completed: u64, new_total: Option<u64>) {
        let snapshot = {
            let mut state = self.inner.state.lock();
            state.completed = state.completed.max(completed);
            Self::apply_total(&mut state, new_total);
            Self::snapshot_of(&state)
        };
        self.notify(snapshot);
    }

    fn apply_total(state: &mut ProgressState, new_total: Option<u64>) {
        if let Some(total) = new_total.filter(|t| *t > 0) {
            state.total = Some(total);
        }
        // Keep completed <= total once the total is known
        if let Some(total) = state.total {
            if state.completed > total {
                state.total = Some(state.completed);
            }
        }
    }

    fn snapshot_of(state: &ProgressState) -> ProgressSnapshot {
        ProgressSnapshot {
            completed: state.completed,
            total: state.total,
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        Self::snapshot_of(&self.inner.state.lock())
    }

    pub fn completed(&self) -> u64 {
        self.inner.state.lock().completed
    }

    pub fn total(&self) -> Option<u64> {
        self.inner.state.lock().total
    }

    pub fn fraction_completed(&self) -> f64 {
        self.snapshot().fraction_completed()
    }

    /// Subscribe to changes; observers run on the updating thread, in update order
    pub fn observe(&self, observer: impl Fn(ProgressSnapshot) + Send + Sync + 'static) {
        self.inner.observers.write().push(Arc::new(observer));
    }

    fn notify(&self, snapshot: ProgressSnapshot) {
        let observers: Vec<ProgressObserver> = self.inner.observers.read().clone();
        for observer in observers {
            observer(snapshot);
        }
    }

    // ========================================================================
    // Control
    // ========================================================================

    pub(crate) fn set_cancellation_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner.handlers.lock().cancel = Some(Arc::new(handler));
    }

    pub(crate) fn set_pausing_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner.handlers.lock().pause = Some(Arc::new(handler));
    }

    pub(crate) fn set_resuming_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner.handlers.lock().resume = Some(Arc::new(handler));
    }

    /// Cancel the task this progress belongs to
    pub fn cancel(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
        }
        let handler = self.inner.handlers.lock().cancel.clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    pub fn pause(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.cancelled || state.paused {
                return;
            }
            state.paused = true;
        }
        let handler = self.inner.handlers.lock().pause.clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    pub fn resume(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.cancelled || !state.paused {
                return;
            }
            state.paused = false;
        }
        let handler = self.inner.handlers.lock().resume.clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().cancelled
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    /// Whether two handles share the same counters
    pub fn ptr_eq(&self, other: &Progress) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("Progress")
            .field("completed", &snapshot.completed)
            .field("total", &snapshot.total)
            .finish()
    }
}
