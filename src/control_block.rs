//! The caller-visible control block (`AioCb`, the `aiocb` equivalent) and
//! the auxiliary types that make up its public fields.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use libc::EINPROGRESS;

use crate::notifier::Notifier;

/// Which syscall a request dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Read,
    Write,
    Fsync,
    Fdatasync,
}

/// Worker thread-creation parameters a `Notify::Callback` may override
/// (§4.E step 3, §6: "If the CB's notification says user callback and
/// supplies its own attributes, those are used verbatim"). `None` fields
/// fall back to the runtime default ([`crate::runtime::AioRuntime::worker_stack_size`]).
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadAttr {
    pub stack_size: Option<usize>,
}

/// How completion should be announced.
#[derive(Clone)]
pub enum Notify {
    /// No notification; the caller polls `error()`/`result()` or blocks on
    /// [`AioCb::wait`].
    None,
    /// Queue a realtime signal carrying `value` with `SI_ASYNCIO`.
    Signal { signo: i32, value: i32 },
    /// Invoke a callback on the worker thread, outside any cancellation
    /// window, with the given payload. `attr` optionally overrides the
    /// worker's thread-creation parameters; `ThreadAttr::default()` means
    /// "use the runtime default".
    Callback {
        func: Arc<dyn Fn(i32) + Send + Sync>,
        value: i32,
        attr: ThreadAttr,
    },
}

impl std::fmt::Debug for Notify {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notify::None => write!(f, "Notify::None"),
            Notify::Signal { signo, value } => {
                write!(f, "Notify::Signal {{ signo: {signo}, value: {value} }}")
            }
            Notify::Callback { value, attr, .. } => {
                write!(f, "Notify::Callback {{ value: {value}, attr: {attr:?}, .. }}")
            }
        }
    }
}

/// A raw `buffer pointer + length` pair that crosses the submitter/worker
/// thread boundary.
///
/// This is the one place in the crate where we step outside of Rust's
/// aliasing rules on purpose: the entire premise of POSIX AIO is that the
/// submitting thread keeps running (and may legitimately keep its own
/// reference to the same bytes) while a second thread performs the I/O.
/// Safety is the caller's responsibility, exactly as it is for the C
/// `aiocb.aio_buf` field: the buffer must stay alive and not be touched by
/// the submitter until the operation completes.
pub(crate) struct RawBuffer {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: see the struct-level comment. The buffer is handed to exactly one
// worker thread, which only touches it between request registration and the
// cleanup protocol; the submitter must not alias it during that window.
unsafe impl Send for RawBuffer {}
unsafe impl Sync for RawBuffer {}

impl RawBuffer {
    /// # Safety
    /// `ptr` must be valid for `len` bytes for the lifetime of the request
    /// (read access for a WRITE request, write access for a READ request).
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Self {
        RawBuffer { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// # Safety
    /// Must only be called by the worker that owns this request, and only
    /// while the request has not yet completed.
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }

    /// # Safety
    /// Must only be called by the worker that owns this request, and only
    /// while the request has not yet completed.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }
}

/// The asynchronous I/O control block.
///
/// Construct with [`AioCb::read`], [`AioCb::write`], or [`AioCb::sync`], then
/// pass a `&Arc<AioCb>` to [`crate::submit_read`]/[`crate::submit_write`]/
/// [`crate::submit_sync`]. After submission, poll [`AioCb::error`] and
/// [`AioCb::result`] (or call [`AioCb::wait`]) to observe completion.
pub struct AioCb {
    pub(crate) fd: RawFd,
    pub(crate) opcode: Opcode,
    pub(crate) buf: RawBuffer,
    pub(crate) offset: i64,
    pub(crate) notify: Notify,

    // Internal, published exactly once by the cleanup protocol.
    pub(crate) err: Notifier,
    pub(crate) result: std::sync::atomic::AtomicI64,
}

impl AioCb {
    fn new(fd: RawFd, opcode: Opcode, buf: RawBuffer, offset: i64, notify: Notify) -> Arc<Self> {
        Arc::new(AioCb {
            fd,
            opcode,
            buf,
            offset,
            notify,
            err: Notifier::new(EINPROGRESS),
            result: std::sync::atomic::AtomicI64::new(-1),
        })
    }

    /// A read request: `buf` is filled from `fd` starting at `offset`.
    ///
    /// # Safety
    /// `buf` must remain valid and must not be accessed by the caller until
    /// the request completes.
    pub unsafe fn read(fd: RawFd, buf: *mut u8, len: usize, offset: i64, notify: Notify) -> Arc<Self> {
        Self::new(fd, Opcode::Read, RawBuffer::new(buf, len), offset, notify)
    }

    /// A write request: bytes from `buf` are written to `fd` starting at
    /// `offset` (ignored for append-mode descriptors, see §4.D.3 of the
    /// design).
    ///
    /// # Safety
    /// `buf` must remain valid and must not be mutated by the caller until
    /// the request completes.
    pub unsafe fn write(fd: RawFd, buf: *const u8, len: usize, offset: i64, notify: Notify) -> Arc<Self> {
        Self::new(
            fd,
            Opcode::Write,
            RawBuffer::new(buf as *mut u8, len),
            offset,
            notify,
        )
    }

    /// A sync request (`fsync` if `datasync` is false, `fdatasync` if true).
    pub fn sync(fd: RawFd, datasync: bool, notify: Notify) -> Arc<Self> {
        let opcode = if datasync {
            Opcode::Fdatasync
        } else {
            Opcode::Fsync
        };
        // SAFETY: zero-length, never dereferenced.
        let buf = unsafe { RawBuffer::new(std::ptr::null_mut(), 0) };
        Self::new(fd, opcode, buf, 0, notify)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// `aio_error()` equivalent: `EINPROGRESS` while outstanding, `0` on
    /// success, the raw errno on failure, `ECANCELED` if cancelled. Masked
    /// to the low 31 bits per the external-interface contract.
    pub fn error(&self) -> i32 {
        self.err.load() & 0x7fff_ffff
    }

    /// `aio_return()` equivalent: only meaningful once `error()` is no
    /// longer `EINPROGRESS`.
    pub fn result(&self) -> i64 {
        self.result.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Block until this request is no longer in progress.
    pub fn wait(&self) {
        self.err.wait_while(EINPROGRESS);
    }
}

impl std::fmt::Debug for AioCb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AioCb")
            .field("fd", &self.fd)
            .field("opcode", &self.opcode)
            .field("offset", &self.offset)
            .field("len", &self.buf.len())
            .field("err", &self.err.load())
            .finish()
    }
}
