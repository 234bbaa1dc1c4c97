//! Exactly-once completion per invocation.
//!
//! Every completion entry point (explicit callback, handler return value,
//! forced error) funnels into one [`CompletionCell`]; the first call wins and
//! all later calls are silently dropped. A completion that wins while the
//! deferral flag is set is parked in a single-slot mailbox and reported only
//! once the [`TaskTracker`] drains.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::Notify;

use crate::errors::ReportableError;

/// Terminal outcome of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Error(ReportableError),
}

const PENDING: u8 = 0;
const COMPLETING: u8 = 1;
const COMPLETED: u8 = 2;

#[derive(Debug)]
pub struct CompletionOutcome {
    pub outcome: Outcome,
    /// Deferral flag snapshot taken at the winning call.
    pub deferred: bool,
}

/// `PENDING -> COMPLETING -> COMPLETED`; the CAS on the first transition is
/// what makes "first call wins" race-safe.
pub struct CompletionCell {
    state: AtomicU8,
    outcome: Mutex<Option<CompletionOutcome>>,
}

impl CompletionCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(PENDING),
            outcome: Mutex::new(None),
        }
    }

    /// Returns `true` for the winning call; later calls are dropped.
    pub fn complete(&self, outcome: Outcome, deferred: bool) -> bool {
        if self
            .state
            .compare_exchange(PENDING, COMPLETING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let mut slot = self
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(CompletionOutcome { outcome, deferred });
        true
    }

    pub fn take(&self) -> Option<CompletionOutcome> {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn finish(&self) {
        self.state.store(COMPLETED, Ordering::SeqCst);
    }

    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::SeqCst) == PENDING
    }
}

impl Default for CompletionCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler-facing completion handle for buffered dispatch.
#[derive(Clone)]
pub struct Completion {
    cell: Arc<CompletionCell>,
    deferral: Arc<AtomicBool>,
}

impl Completion {
    pub(crate) fn new(cell: Arc<CompletionCell>, deferral: Arc<AtomicBool>) -> Self {
        Self { cell, deferral }
    }

    pub fn succeed(&self, value: Value) -> bool {
        self.callback(None, Some(value))
    }

    pub fn fail(&self, error: ReportableError) -> bool {
        self.callback(Some(error), None)
    }

    pub fn done(&self, error: Option<ReportableError>, value: Option<Value>) -> bool {
        self.callback(error, value)
    }

    /// Raw two-argument form. `error == None` completes with a result.
    pub fn callback(&self, error: Option<ReportableError>, value: Option<Value>) -> bool {
        let outcome = match error {
            None => Outcome::Result(value.unwrap_or(Value::Null)),
            Some(err) => Outcome::Error(err),
        };
        let deferred = self.deferral.load(Ordering::SeqCst);
        self.cell.complete(outcome, deferred)
    }
}

/// Outstanding background work, tracked explicitly: handlers register work
/// through RAII guards and the runner awaits `wait_idle` before firing a
/// deferred report.
pub struct TaskTracker {
    outstanding: AtomicUsize,
    idle: Notify,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn enter(self: &Arc<Self>) -> TaskGuard {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        TaskGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Resolves once no background work remains. The permit is armed before
    /// the counter check to avoid losing a wakeup from a guard dropped in
    /// between.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TaskGuard {
    tracker: Arc<TaskTracker>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.tracker.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

/// A report waiting for the tracker to drain.
#[derive(Debug)]
pub struct PendingReport {
    pub request_id: String,
    pub outcome: Outcome,
}

/// Single-slot mailbox: registering replaces any previously registered
/// report, so at most one deferred report is ever pending.
#[derive(Default)]
pub struct DeferredSlot {
    slot: Mutex<Option<PendingReport>>,
}

impl DeferredSlot {
    pub fn register(&self, report: PendingReport) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(report);
    }

    pub fn take(&self) -> Option<PendingReport> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// First unhandled background failure, kept until the runner terminates the
/// process with the background exit code.
#[derive(Clone, Default)]
pub struct BackgroundFailures {
    slot: Arc<Mutex<Option<ReportableError>>>,
}

impl BackgroundFailures {
    pub fn record(&self, error: ReportableError) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub fn take(&self) -> Option<ReportableError> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
