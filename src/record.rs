//! The per-request record linked into a [`crate::queue::Queue`].
//!
//! Owned by the worker that created it (`RequestRecord` itself never moves
//! once inserted), but reference-counted: the Queue's list holds a clone so
//! cancellers and sequencing-wait peers can reach `running` without needing
//! the worker to still be alive in any particular state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::control_block::{AioCb, Opcode};
use crate::notifier::Notifier;

pub const RUNNING: i32 = 1;
pub const EXITED: i32 = 0;
pub const CANCEL_PENDING: i32 = -1;

pub struct RequestRecord {
    pub opcode: Opcode,
    pub cb: Arc<AioCb>,

    /// {1 = active, 0 = exited, -1 = cancel pending}. The only field other
    /// threads may read without holding the owning Queue's mutex.
    pub running: Notifier,

    /// Set by [`crate::cancel::cancel`] alongside the `running` CAS; polled
    /// by the worker's I/O loop so a blocked worker can unwind even though
    /// Rust threads have no `pthread_cancel` equivalent.
    pub cancel_requested: AtomicBool,

    pub owner: std::thread::ThreadId,
}

impl RequestRecord {
    pub fn new(opcode: Opcode, cb: Arc<AioCb>) -> Arc<Self> {
        Arc::new(RequestRecord {
            opcode,
            cb,
            running: Notifier::new(RUNNING),
            cancel_requested: AtomicBool::new(false),
            owner: std::thread::current().id(),
        })
    }

    pub fn is_write_like(&self) -> bool {
        matches!(self.opcode, Opcode::Write)
    }

    pub fn request_cancel(&self) -> bool {
        match self.running.compare_exchange(RUNNING, CANCEL_PENDING) {
            Ok(_) => {
                self.cancel_requested.store(true, Ordering::Release);
                true
            }
            Err(_) => false,
        }
    }

    pub fn wait_for_exit(&self) {
        self.running.wait_while(CANCEL_PENDING);
    }
}
