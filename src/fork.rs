//! Fork hook (component G): keeps the descriptor map consistent across
//! `fork(2)`.
//!
//! `pthread_atfork` has no safe wrapper in `nix` or anywhere else in the
//! ecosystem this crate draws from, so — exactly as `pbs-fuse-loop/loopdev.rs`
//! reaches for raw `nix::ioctl_*!`-generated FFI rather than inventing a safe
//! abstraction where none exists upstream — this module calls the libc
//! function directly and keeps the `unsafe` contained to [`install_fork_handlers`].

use std::sync::RwLockReadGuard;

use crate::map::Level0;
use crate::runtime::{runtime, AioRuntime};

/// The Map's read lock, held between [`fork_prepare`] and whichever of
/// [`fork_parent`]/[`fork_child`] follows it. Opaque on purpose: callers
/// outside this module have no business inspecting the trie it guards.
pub struct ForkGuard<'a>(RwLockReadGuard<'a, Level0>);

/// Pre-fork phase (§4.G): acquire the Map's read lock so no concurrent
/// structural mutation straddles the fork. The returned guard must be handed
/// to [`fork_parent`] (in the parent) or [`fork_child`] (in the child, where
/// it is simply dropped before the reset runs).
pub fn fork_prepare(rt: &AioRuntime) -> ForkGuard<'_> {
    ForkGuard(rt.map.fork_prepare())
}

/// Post-fork-in-parent phase: release the read lock taken in
/// [`fork_prepare`].
pub fn fork_parent(_guard: ForkGuard<'_>) {
    // Dropping releases it.
}

/// Post-fork-in-child phase: the child is single-threaded at this point
/// (`fork()` duplicates only the calling thread), so it is safe to reset the
/// map once `guard` is out of the way.
pub fn fork_child(rt: &AioRuntime, guard: ForkGuard<'_>) {
    drop(guard);
    rt.map.fork_child_reset();
}

// The three `pthread_atfork` callbacks are argument-less `extern "C"` function
// pointers, so unlike the testable functions above they cannot carry a
// borrowed guard across the prepare/parent-or-child boundary as a return
// value; it has to live somewhere with `'static` reach. `runtime()` returns
// `&'static AioRuntime`, so the guard `fork_prepare` hands back here is
// already `RwLockReadGuard<'static, _>` — no lifetime extension needed.
thread_local! {
    static PENDING_GUARD: std::cell::RefCell<Option<ForkGuard<'static>>> =
        const { std::cell::RefCell::new(None) };
}

extern "C" fn atfork_prepare() {
    let guard = fork_prepare(runtime());
    PENDING_GUARD.with(|slot| *slot.borrow_mut() = Some(guard));
}

extern "C" fn atfork_parent() {
    if let Some(guard) = PENDING_GUARD.with(|slot| slot.borrow_mut().take()) {
        fork_parent(guard);
    }
}

extern "C" fn atfork_child() {
    if let Some(guard) = PENDING_GUARD.with(|slot| slot.borrow_mut().take()) {
        fork_child(runtime(), guard);
    } else {
        runtime().map.fork_child_reset();
    }
}

/// Register the three phases above with `pthread_atfork(3)` so every
/// `fork()` in the process (not just ones this crate knows about) keeps the
/// descriptor map consistent.
///
/// # Safety
/// Must be called before any worker threads are spawned and only once per
/// process; `pthread_atfork` itself has no such requirement, but re-
/// registering would run the hooks more than once per fork, which is
/// harmless here (every phase is idempotent) but wasteful.
pub unsafe fn install_fork_handlers() -> anyhow::Result<()> {
    let rc = libc::pthread_atfork(
        Some(atfork_prepare),
        Some(atfork_parent),
        Some(atfork_child),
    );
    if rc == 0 {
        Ok(())
    } else {
        Err(anyhow::Error::from(nix::errno::Errno::from_i32(rc)))
    }
}
