//! Process-global state: the descriptor map, the global completion wait
//! word, and the cached worker stack size.
//!
//! A single `AioRuntime` is created lazily the first time any entry point
//! touches it, mirroring the `lazy_static!` singletons the teacher uses for
//! process-wide state (`pbs-fuse-loop`'s `LOOPDEV_REGEX`).

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::map::DescriptorMap;
use crate::notifier::Notifier;

pub struct AioRuntime {
    pub map: DescriptorMap,
    /// Global wait word woken on every completion (§4.D.6.d); backs a
    /// hypothetical `lio_listio`/`aio_suspend`-style "wait for any" caller.
    pub global_wait: Notifier,
    stack_size: AtomicUsize,
}

impl AioRuntime {
    fn new() -> Self {
        AioRuntime {
            map: DescriptorMap::new(),
            global_wait: Notifier::new(0),
            stack_size: AtomicUsize::new(0),
        }
    }

    /// Worker stack size, discovered once from `sysconf(_SC_SIGSTKSZ)`
    /// (§4.A, §4.J) and cached thereafter.
    pub fn worker_stack_size(&self) -> usize {
        let cached = self.stack_size.load(Ordering::Relaxed);
        if cached != 0 {
            return cached;
        }
        let probed = unsafe { libc::sysconf(libc::_SC_SIGSTKSZ) };
        let size = if probed > 0 {
            probed as usize
        } else {
            libc::SIGSTKSZ
        };
        self.stack_size.store(size, Ordering::Relaxed);
        size
    }

    pub fn wake_global_wait(&self) {
        self.global_wait.swap_and_wake(0);
    }

    #[cfg(test)]
    pub(crate) fn for_test() -> Self {
        AioRuntime::new()
    }
}

lazy_static::lazy_static! {
    pub static ref RUNTIME: AioRuntime = AioRuntime::new();
}

pub fn runtime() -> &'static AioRuntime {
    &RUNTIME
}
