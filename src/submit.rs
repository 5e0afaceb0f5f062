//! The submitter (component E): acquires a queue, hands a freshly-built
//! request off to a worker, and blocks until registration completes.
//!
//! These three functions are this crate's equivalent of `aio_read`,
//! `aio_write`, and the `aio_fsync`/`aio_fdatasync` pair — except that
//! unlike the thin C entry stubs (which only stash the CB and kick off the
//! worker via a bare `aio_queue_t` call), the caller here must already hold
//! the `Arc<AioCb>` it constructed via [`AioCb::read`]/[`AioCb::write`]/
//! [`AioCb::sync`].

use std::sync::atomic::Ordering;
use std::sync::Arc;

use libc::EINPROGRESS;
use nix::errno::Errno;

use crate::control_block::{AioCb, Opcode};
use crate::error::{AioError, AioResult};
use crate::runtime::runtime;
use crate::worker::spawn_worker;

/// Submit a read request. `cb` must have been built with [`AioCb::read`].
pub fn submit_read(cb: &Arc<AioCb>) -> AioResult<()> {
    debug_assert_eq!(cb.opcode(), Opcode::Read);
    submit(cb)
}

/// Submit a write request. `cb` must have been built with [`AioCb::write`].
pub fn submit_write(cb: &Arc<AioCb>) -> AioResult<()> {
    debug_assert_eq!(cb.opcode(), Opcode::Write);
    submit(cb)
}

/// Submit a sync request. `cb` must have been built with [`AioCb::sync`];
/// the opcode itself (`fsync` vs `fdatasync`) was fixed by that constructor,
/// matching the `SYNC`/`DSYNC` validation the design assigns to the
/// sync-submit entry point.
pub fn submit_sync(cb: &Arc<AioCb>) -> AioResult<()> {
    debug_assert!(matches!(cb.opcode(), Opcode::Fsync | Opcode::Fdatasync));
    submit(cb)
}

fn submit(cb: &Arc<AioCb>) -> AioResult<()> {
    let rt = runtime();

    let queue = match rt.map.lookup(cb.fd(), true) {
        Ok(Some(queue)) => queue,
        Ok(None) => unreachable!("lookup(create=true) always yields a queue or an error"),
        Err(errno) => {
            let err = submission_error(errno);
            stamp_terminal(cb, &err);
            return Err(err);
        }
    };

    // `EINPROGRESS` from here until the worker's cleanup protocol publishes
    // a final status; the worker now owns the CB's internal state.
    cb.err.store(EINPROGRESS);

    match spawn_worker(cb.clone(), queue.clone(), cb.opcode()) {
        Ok(()) => Ok(()),
        Err(err) => {
            rt.map.unref(&queue);
            stamp_terminal(cb, &err);
            Err(err)
        }
    }
}

/// §4.E step 1: `EAGAIN` on any lookup failure except `EBADF`, which passes
/// through unchanged.
fn submission_error(errno: Errno) -> AioError {
    if errno == Errno::EBADF {
        AioError::BadDescriptor
    } else {
        AioError::ResourceExhausted
    }
}

fn stamp_terminal(cb: &AioCb, err: &AioError) {
    cb.result.store(-1, Ordering::Release);
    cb.err.store(err.errno() as i32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_block::Notify;
    use crate::test_support::scratch_file;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn submit_read_rejects_bad_descriptor() {
        let mut buf = [0u8; 4];
        let cb = unsafe { AioCb::read(-1, buf.as_mut_ptr(), buf.len(), 0, Notify::None) };
        let result = submit_read(&cb);
        assert!(result.is_err());
        assert_eq!(cb.error(), libc::EBADF);
        assert_eq!(cb.result(), -1);
    }

    #[test]
    fn submit_read_completes_with_file_contents() {
        let file = scratch_file(b"HELLO");
        let fd = file.as_raw_fd();

        let mut buf = [0u8; 5];
        let cb = unsafe { AioCb::read(fd, buf.as_mut_ptr(), buf.len(), 0, Notify::None) };
        submit_read(&cb).unwrap();
        cb.wait();

        assert_eq!(cb.error(), 0);
        assert_eq!(cb.result(), 5);
        assert_eq!(&buf, b"HELLO");
    }

    #[test]
    fn submit_write_then_read_back() {
        let file = scratch_file(b"");
        let fd = file.as_raw_fd();

        let payload = b"asynchronous".to_vec();
        let write_cb =
            unsafe { AioCb::write(fd, payload.as_ptr(), payload.len(), 0, Notify::None) };
        submit_write(&write_cb).unwrap();
        write_cb.wait();
        assert_eq!(write_cb.error(), 0);
        assert_eq!(write_cb.result(), payload.len() as i64);

        let mut readback = vec![0u8; payload.len()];
        let read_cb =
            unsafe { AioCb::read(fd, readback.as_mut_ptr(), readback.len(), 0, Notify::None) };
        submit_read(&read_cb).unwrap();
        read_cb.wait();
        assert_eq!(read_cb.error(), 0);
        assert_eq!(readback, payload);
    }

    #[test]
    fn submit_sync_completes() {
        let file = scratch_file(b"");
        let fd = file.as_raw_fd();
        let cb = AioCb::sync(fd, false, Notify::None);
        submit_sync(&cb).unwrap();
        cb.wait();
        assert_eq!(cb.error(), 0);
    }
}
