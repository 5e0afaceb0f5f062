//! Thread-backed POSIX asynchronous I/O core.
//!
//! Every outstanding request gets its own detached worker thread (see
//! [`worker`]); completion is observed by polling [`control_block::AioCb`],
//! blocking on [`control_block::AioCb::wait`], signal delivery, or a
//! caller-supplied callback. [`cancel::cancel`] targets one or all requests
//! on a descriptor, and [`fork::install_fork_handlers`] keeps the
//! descriptor→queue [`map`] consistent across `fork(2)`.
//!
//! This crate implements the core only: the thin `aio_read`/`aio_write`/
//! `aio_fsync`/`aio_return`/`aio_error` entry stubs, `aio_suspend`, and
//! `lio_listio` are intentionally out of scope (see DESIGN.md) — callers
//! build those on top of [`submit_read`]/[`submit_write`]/[`submit_sync`],
//! [`control_block::AioCb`]'s accessors, and [`cancel::cancel`].

pub mod cancel;
pub mod control_block;
pub mod error;
pub mod fork;
pub mod map;
pub mod notifier;
mod notify;
pub mod queue;
pub mod record;
pub mod runtime;
pub mod submit;
#[cfg(test)]
mod test_support;
pub mod worker;

pub use cancel::{cancel, cancel_on_close, CancelResult};
pub use control_block::{AioCb, Notify, Opcode, ThreadAttr};
pub use error::{AioError, AioResult};
pub use fork::{fork_child, fork_parent, fork_prepare, install_fork_handlers, ForkGuard};
pub use submit::{submit_read, submit_sync, submit_write};
