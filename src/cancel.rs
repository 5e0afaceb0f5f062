//! Cancel / close hook (component F): targets one or all requests on a
//! descriptor, forces worker unwind, and waits for cleanup publication.
//!
//! Every step here runs with signals blocked (`with_signals_blocked`, shared
//! with the map's own structural-mutation paths), since this code must be
//! safe to invoke from the descriptor-close path the design calls out as
//! async-signal-restricted.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use libc::ECANCELED;

use crate::control_block::AioCb;
use crate::error::{AioError, AioResult};
use crate::map::with_signals_blocked;
use crate::queue::Queue;
use crate::record::{RequestRecord, EXITED};
use crate::runtime::runtime;

/// `aio_cancel`'s three-valued outcome plus the synchronous-error case,
/// which this crate represents as `Err` instead of a sentinel `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    Canceled = 0,
    NotCanceled = 1,
    AllDone = 2,
}

/// Cancel one request (`cb = Some(_)`) or every outstanding request
/// (`cb = None`) on `fd`.
pub fn cancel(fd: RawFd, cb: Option<&Arc<AioCb>>) -> AioResult<CancelResult> {
    if let Some(cb) = cb {
        if cb.fd() != fd {
            return Err(AioError::InvalidArgument);
        }
    }

    with_signals_blocked(|| {
        let queue = match runtime().map.lookup(fd, false) {
            Ok(Some(queue)) => queue,
            Ok(None) => return Ok(CancelResult::AllDone),
            Err(_) => return Err(AioError::BadDescriptor),
        };

        let result = cancel_on_queue(&queue, cb);
        runtime().map.unref(&queue);
        result
    })
}

/// The descriptor-close integration (§4.F): a single call, made just before
/// `close(2)`, that is a no-op unless at least one queue is live anywhere in
/// the process.
pub fn cancel_on_close(fd: RawFd) {
    if runtime().map.fd_count.load(std::sync::atomic::Ordering::Relaxed) == 0 {
        return;
    }
    if let Err(err) = cancel(fd, None) {
        log::warn!("aio: cancel-on-close for fd {fd} failed: {err}");
    }
}

fn cancel_on_queue(queue: &Arc<Queue>, cb: Option<&Arc<AioCb>>) -> AioResult<CancelResult> {
    let targets: Vec<Arc<RequestRecord>> = queue
        .snapshot_records()
        .into_iter()
        .filter(|record| cb.map_or(true, |cb| Arc::ptr_eq(&record.cb, cb)))
        .collect();

    let mut saw_target = false;
    let mut saw_canceled = false;
    let mut saw_survivor = false;

    for record in &targets {
        if record.running.load() == EXITED {
            // Already published completion (may still be briefly linked,
            // see §9's ordering note); not something we drove to cancel.
            continue;
        }
        saw_target = true;

        // Either we flip it to cancel-pending ourselves, or a concurrent
        // canceller already did; either way wait for the same outcome.
        record.request_cancel();
        record.wait_for_exit();

        if record.cb.error() == ECANCELED {
            saw_canceled = true;
        } else {
            saw_survivor = true;
        }
    }

    Ok(if !saw_target {
        CancelResult::AllDone
    } else if saw_survivor {
        CancelResult::NotCanceled
    } else if saw_canceled {
        CancelResult::Canceled
    } else {
        CancelResult::AllDone
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_block::Notify;
    use crate::submit::submit_read;
    use crate::test_support::scratch_file;
    use nix::unistd::pipe;
    use std::os::unix::io::{AsRawFd, FromRawFd};

    #[test]
    fn cancel_on_closed_fd_is_all_done() {
        let file = scratch_file(b"");
        let fd = file.as_raw_fd();
        assert_eq!(cancel(fd, None).unwrap(), CancelResult::AllDone);
    }

    #[test]
    fn cancel_rejects_mismatched_descriptor() {
        let a = scratch_file(b"x");
        let b = scratch_file(b"y");

        let mut buf = [0u8; 1];
        let cb = unsafe { AioCb::read(a.as_raw_fd(), buf.as_mut_ptr(), 1, 0, Notify::None) };
        submit_read(&cb).unwrap();
        cb.wait();

        assert_eq!(
            cancel(b.as_raw_fd(), Some(&cb)),
            Err(AioError::InvalidArgument)
        );
    }

    #[test]
    fn cancel_pending_read_on_empty_pipe() {
        crate::test_support::init_test_logging();
        let (read_fd, write_fd) = pipe().unwrap();
        // Keep the write end open so the read blocks instead of seeing EOF.
        let _write_end = unsafe { std::fs::File::from_raw_fd(write_fd) };

        let mut buf = [0u8; 16];
        let cb = unsafe { AioCb::read(read_fd, buf.as_mut_ptr(), buf.len(), 0, Notify::None) };
        submit_read(&cb).unwrap();

        // Give the worker a moment to register and start polling.
        std::thread::sleep(std::time::Duration::from_millis(50));

        let result = cancel(read_fd, Some(&cb)).unwrap();
        assert_eq!(result, CancelResult::Canceled);

        cb.wait();
        assert_eq!(cb.error(), ECANCELED);
        assert_eq!(cb.result(), -1);

        unsafe { libc::close(read_fd) };
    }
}
