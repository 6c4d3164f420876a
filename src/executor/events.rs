//! Engine events, emitted best-effort to an optional listener.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

/// Events describing the progress of one run.
#[derive(Clone, Debug, Serialize)]
pub enum ExecutionEvent {
    BlockStarted {
        block_id: String,
        block_type: String,
    },
    BlockCompleted {
        block_id: String,
        duration_ms: u64,
    },
    BlockFailed {
        block_id: String,
        error: String,
    },
    BranchSelected {
        block_id: String,
        target: String,
    },
    LoopIterationCompleted {
        container_id: String,
        iteration: u32,
    },
    ParallelBranchCompleted {
        container_id: String,
        branch_index: u32,
    },
    RunCompleted {
        execution_id: String,
        had_failures: bool,
    },
    RunSuspended {
        execution_id: String,
        block_id: String,
        reason: String,
    },
    RunCancelled {
        execution_id: String,
    },
}

/// Sender wrapper for engine events, with an atomic active flag so emission
/// can be cheaply skipped when no listener is attached.
#[derive(Clone)]
pub struct EventEmitter {
    tx: Option<mpsc::Sender<ExecutionEvent>>,
    active: Arc<AtomicBool>,
}

impl EventEmitter {
    pub fn new(tx: mpsc::Sender<ExecutionEvent>) -> Self {
        EventEmitter {
            tx: Some(tx),
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    /// An emitter with no listener; every emit is a no-op.
    pub fn disabled() -> Self {
        EventEmitter {
            tx: None,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    #[inline(always)]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    pub async fn emit(&self, event: ExecutionEvent) {
        if self.is_active() {
            if let Some(tx) = &self.tx {
                let _ = tx.send(event).await;
            }
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::disabled()
    }
}
