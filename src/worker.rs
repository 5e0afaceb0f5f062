//! The worker body (component D): the hardest part of the crate.
//!
//! Each outstanding request gets its own detached OS thread. The thread
//! registers its [`RequestRecord`] with the [`Queue`], waits for the
//! sequencing rule, performs the syscall, and then runs the cleanup
//! protocol exactly once, however it got there.
//!
//! Rust threads have no `pthread_cancel` equivalent, so "forced unwind
//! triggered by cancellation" (the phrase the design uses for the
//! C implementation's escape hatch) is implemented the way the design's own
//! notes suggest for platforms without cancellable blocking I/O: a per-record
//! atomic flag, checked between bounded `poll()` waits on the target
//! descriptor, so a blocked worker can always notice a cancellation request
//! without the submitting application's `read()`/`write()` semantics on the
//! descriptor ever changing (we never flip `O_NONBLOCK` on the caller's own
//! descriptor).

use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd::Whence;

use crate::control_block::{AioCb, Notify, Opcode};
use crate::error::AioError;
use crate::notifier::Notifier;
use crate::queue::Queue;
use crate::record::{RequestRecord, EXITED};
use crate::runtime::runtime;

/// How long a sequencing-oblivious I/O wait blocks between checks of the
/// per-record cancel flag.
const CANCEL_POLL_MS: i32 = 100;

/// A scopeguard-style "run this once, on any exit path" helper. Every
/// worker installs one immediately after registering its record (§4.D.2);
/// it fires whether the body below returns normally, returns early on
/// cancellation, or unwinds via a panic.
struct CleanupGuard<F: FnOnce()> {
    action: Option<F>,
}

impl<F: FnOnce()> CleanupGuard<F> {
    fn new(action: F) -> Self {
        CleanupGuard {
            action: Some(action),
        }
    }
}

impl<F: FnOnce()> Drop for CleanupGuard<F> {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

/// Submitter-side half of §4.E: create a detached worker thread for `cb` and
/// block on the registration handshake. `queue`'s ref count has already been
/// bumped by [`crate::map::DescriptorMap::lookup`]; on failure the caller is
/// responsible for `unref`-ing it back out.
pub(crate) fn spawn_worker(
    cb: Arc<AioCb>,
    queue: Arc<Queue>,
    opcode: Opcode,
) -> Result<(), AioError> {
    let registered = Arc::new(Notifier::new(0));
    let registered_for_worker = registered.clone();
    // §4.E step 3 / §6: a user callback may supply its own thread attributes,
    // used verbatim instead of the runtime default.
    let stack_size = match &cb.notify {
        Notify::Callback {
            attr: crate::control_block::ThreadAttr {
                stack_size: Some(size),
            },
            ..
        } => *size,
        _ => runtime().worker_stack_size(),
    };

    let spawned = thread::Builder::new()
        .name("aio-worker".into())
        .stack_size(stack_size)
        .spawn(move || worker_main(cb, queue, opcode, registered_for_worker));

    match spawned {
        Ok(handle) => {
            // Detached: we never join it. The registration handshake below
            // is the only synchronization the submitter needs.
            drop(handle);
        }
        Err(err) => {
            log::warn!("aio: failed to spawn worker thread: {err}");
            return Err(AioError::ResourceExhausted);
        }
    }

    // Retry on spurious wakeups is implicit: wait_while only returns once the
    // value has actually left its stale state.
    registered.wait_while(0);
    Ok(())
}

fn worker_main(cb: Arc<AioCb>, queue: Arc<Queue>, opcode: Opcode, registered: Arc<Notifier>) {
    let record = RequestRecord::new(opcode, cb.clone());
    log::debug!(
        "aio: worker for fd {} opcode {:?} starting (record on thread {:?})",
        cb.fd(),
        opcode,
        record.owner
    );

    let (seekable, append) = queue.register_and_wait(
        &record,
        probe_descriptor,
        move || {
            registered.swap_and_wake(1);
        },
    );

    // Outcome slot shared (same thread only, never sent) between the I/O
    // dispatch below and the cleanup closure armed next: whatever is in
    // here when the guard drops is what gets published.
    let outcome = Rc::new(Cell::new((-1i64, Errno::ECANCELED as i32)));
    let outcome_for_cleanup = outcome.clone();
    let cb_for_cleanup = cb.clone();
    let record_for_cleanup = record.clone();
    let queue_for_cleanup = queue.clone();

    let _cleanup = CleanupGuard::new(move || {
        let (ret, err) = outcome_for_cleanup.get();
        complete_request(&cb_for_cleanup, &record_for_cleanup, &queue_for_cleanup, ret, err);
    });

    let (ret, err) = dispatch_io(&cb, &record, seekable, append);
    outcome.set((ret, err));

    // Falling off the end of the function drops `_cleanup`, which publishes
    // the outcome above exactly once, regardless of how we got here.
}

/// Probe a descriptor's seekability and append mode on first use (§4.D.1).
/// `append` is additionally forced for non-seekable descriptors so writes
/// use `write()` rather than `pwrite()`, matching the original rationale:
/// there is no valid offset to seek a pipe or socket to.
fn probe_descriptor(fd: RawFd) -> (bool, bool) {
    let seekable = nix::unistd::lseek(fd, 0, Whence::SeekCur).is_ok();
    let append = match fcntl(fd, FcntlArg::F_GETFL) {
        Ok(flags) => flags & libc::O_APPEND != 0,
        Err(err) => {
            log::warn!("aio: F_GETFL on fd {fd} failed: {err}");
            false
        }
    };
    (seekable, append)
}

/// Phase 5: perform the actual syscall, or report `ECANCELED` if a cancel
/// request is observed first. Returns `(ret, err)` exactly as they are
/// published to the control block.
fn dispatch_io(cb: &AioCb, record: &RequestRecord, seekable: bool, append: bool) -> (i64, i32) {
    if record.cancel_requested.load(Ordering::Acquire) {
        return (-1, Errno::ECANCELED as i32);
    }

    let fd = cb.fd();
    let result = match record.opcode {
        Opcode::Read => {
            if !wait_cancelable(fd, PollFlags::POLLIN, record) {
                return (-1, Errno::ECANCELED as i32);
            }
            // SAFETY: the buffer is valid for the request's lifetime and
            // exclusively owned by this worker between registration and
            // cleanup (see RawBuffer's own safety comment).
            let buf = unsafe { cb.buf.as_mut_slice() };
            if seekable {
                nix::sys::uio::pread(fd, buf, cb.offset)
            } else {
                nix::unistd::read(fd, buf)
            }
        }
        Opcode::Write => {
            if !wait_cancelable(fd, PollFlags::POLLOUT, record) {
                return (-1, Errno::ECANCELED as i32);
            }
            // SAFETY: see RawBuffer's safety comment; the caller must not
            // mutate the buffer until completion.
            let buf = unsafe { cb.buf.as_slice() };
            if append {
                nix::unistd::write(fd, buf)
            } else {
                nix::sys::uio::pwrite(fd, buf, cb.offset)
            }
        }
        Opcode::Fsync => nix::unistd::fsync(fd).map(|_| 0isize),
        Opcode::Fdatasync => nix::unistd::fdatasync(fd).map(|_| 0isize),
    };

    match result {
        Ok(n) => (n as i64, 0),
        Err(errno) => {
            log::debug!("aio: fd {fd} opcode {:?} failed: {errno}", record.opcode);
            (-1, errno as i32)
        }
    }
}

/// Block until `fd` is ready for `events`, or a cancel request lands,
/// whichever comes first. `fsync`/`fdatasync` have no poll-able readiness
/// and are not routed through here; those can only be interrupted between
/// requests, never mid-syscall, which matches the "timeouts are not
/// implemented at this layer" note in §5.
fn wait_cancelable(fd: RawFd, events: PollFlags, record: &RequestRecord) -> bool {
    loop {
        if record.cancel_requested.load(Ordering::Acquire) {
            return false;
        }
        let mut fds = [PollFd::new(fd, events)];
        match poll(&mut fds, CANCEL_POLL_MS) {
            Ok(0) => continue,
            Ok(_) => return true,
            Err(Errno::EINTR) => continue,
            // Let the real syscall below surface whatever poll() couldn't.
            Err(_) => return true,
        }
    }
}

/// The cleanup / completion protocol (§4.D.6), run exactly once per request
/// by the [`CleanupGuard`] armed in [`worker_main`]. Publication order
/// matches §5's mutation ordering: result, then `running`, then `err`, then
/// the global wait word, then list unlink + `unref`, then notification.
fn complete_request(cb: &Arc<AioCb>, record: &Arc<RequestRecord>, queue: &Arc<Queue>, ret: i64, err: i32) {
    cb.result.store(ret, Ordering::Release);
    record.running.swap_and_wake(EXITED);
    cb.err.swap_and_wake(err);
    runtime().wake_global_wait();

    queue.unlink_and_broadcast(record);
    runtime().map.unref(queue);

    // Clear cancel-pending before the notification fires so a callback never
    // observes a cancel window.
    record.cancel_requested.store(false, Ordering::Release);
    crate::notify::deliver(cb);

    log::debug!(
        "aio: fd {} opcode {:?} completed ret={ret} err={err}",
        cb.fd(),
        record.opcode
    );
}

#[cfg(test)]
mod tests {
    use crate::control_block::{AioCb, Notify, ThreadAttr};
    use crate::submit::{submit_sync, submit_write};
    use crate::test_support::scratch_file;
    use nix::fcntl::{open, OFlag};
    use nix::sys::stat::Mode;
    use nix::unistd::close;
    use std::os::unix::io::{AsRawFd, RawFd};
    use std::sync::{Arc, Mutex};

    fn open_append(path: &std::path::Path) -> RawFd {
        open(path, OFlag::O_WRONLY | OFlag::O_APPEND, Mode::empty()).unwrap()
    }

    /// §4.E step 3 / §6: a callback notification may carry its own thread
    /// attributes, honored verbatim instead of the runtime default.
    #[test]
    fn callback_fires_with_custom_thread_attr() {
        let file = scratch_file(b"");
        let fd = file.as_raw_fd();

        let seen = Arc::new(Mutex::new(None));
        let seen_for_cb = seen.clone();
        let notify = Notify::Callback {
            func: Arc::new(move |value| {
                *seen_for_cb.lock().unwrap() = Some(value);
            }),
            value: 42,
            attr: ThreadAttr {
                stack_size: Some(256 * 1024),
            },
        };

        let payload = b"callback".to_vec();
        let cb = unsafe { AioCb::write(fd, payload.as_ptr(), payload.len(), 0, notify) };
        submit_write(&cb).unwrap();
        cb.wait();

        assert_eq!(cb.error(), 0);
        assert_eq!(*seen.lock().unwrap(), Some(42));
    }

    #[test]
    fn append_writes_preserve_submission_order() {
        crate::test_support::init_test_logging();

        let dir = std::env::temp_dir();
        let path = dir.join(format!("paio-append-{:?}", std::thread::current().id()));
        std::fs::write(&path, b"").unwrap();
        let fd = open_append(&path);

        let a = b"AAA".to_vec();
        let b = b"BBB".to_vec();
        let cb_a = unsafe { AioCb::write(fd, a.as_ptr(), a.len(), 0, Notify::None) };
        let cb_b = unsafe { AioCb::write(fd, b.as_ptr(), b.len(), 0, Notify::None) };
        submit_write(&cb_a).unwrap();
        submit_write(&cb_b).unwrap();
        cb_a.wait();
        cb_b.wait();
        assert_eq!(cb_a.error(), 0);
        assert_eq!(cb_b.error(), 0);

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, b"AAABBB");

        let _ = close(fd);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn fsync_completes_after_preceding_write() {
        crate::test_support::init_test_logging();

        let file = scratch_file(b"");
        let fd = file.as_raw_fd();

        let payload = b"durable".to_vec();
        let write_cb = unsafe { AioCb::write(fd, payload.as_ptr(), payload.len(), 0, Notify::None) };
        submit_write(&write_cb).unwrap();

        let sync_cb = AioCb::sync(fd, false, Notify::None);
        submit_sync(&sync_cb).unwrap();
        sync_cb.wait();

        // The sequencing rule guarantees the write's completion is published
        // before the fsync's, so by the time we observe the fsync done the
        // write must already be done too.
        assert_eq!(sync_cb.error(), 0);
        assert_eq!(write_cb.error(), 0);
        assert_eq!(write_cb.result(), payload.len() as i64);
    }
}
