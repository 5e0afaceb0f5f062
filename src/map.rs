//! Sparse lookup from a 32-bit file descriptor to its [`Queue`], with a
//! readers-writer discipline around structural mutation.
//!
//! The descriptor is split into four slices exactly as described in the
//! design: the top slice covers only the top half of the positive `i32`
//! range (128 possible values, since bit 31 is the sign bit and a valid
//! descriptor is never negative), the remaining three are full 256-wide
//! byte slices. Each level is allocated lazily.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::signal::{SigSet, SigmaskHow};

use crate::queue::Queue;
use std::sync::Arc;

const LEVEL0_WIDTH: usize = 128;
const LEVEL_WIDTH: usize = 256;

struct Level3 {
    slots: Vec<Option<Arc<Queue>>>,
}

impl Level3 {
    fn new() -> Self {
        Level3 {
            slots: (0..LEVEL_WIDTH).map(|_| None).collect(),
        }
    }
}

struct Level2 {
    slots: Vec<Option<Box<Level3>>>,
}

impl Level2 {
    fn new() -> Self {
        Level2 {
            slots: (0..LEVEL_WIDTH).map(|_| None).collect(),
        }
    }
}

struct Level1 {
    slots: Vec<Option<Box<Level2>>>,
}

impl Level1 {
    fn new() -> Self {
        Level1 {
            slots: (0..LEVEL_WIDTH).map(|_| None).collect(),
        }
    }
}

pub(crate) struct Level0 {
    slots: Vec<Option<Box<Level1>>>,
}

impl Level0 {
    fn new() -> Self {
        Level0 {
            slots: (0..LEVEL0_WIDTH).map(|_| None).collect(),
        }
    }
}

fn indices(fd: RawFd) -> (usize, usize, usize, usize) {
    let fd = fd as u32;
    (
        (fd >> 24) as usize & (LEVEL0_WIDTH - 1),
        (fd >> 16) as usize & 0xFF,
        (fd >> 8) as usize & 0xFF,
        fd as usize & 0xFF,
    )
}

/// Sparse descriptor → queue table (component A).
pub struct DescriptorMap {
    root: RwLock<Level0>,
    /// Number of descriptors with a live queue; mirrors the number of
    /// non-null leaves.
    pub fd_count: AtomicUsize,
}

/// Blocks every signal on the calling thread for the duration of `f`,
/// restoring the previous mask afterwards. Used around every structural
/// mutation of the map, since the map is also consulted from the
/// descriptor-close path, which must be async-signal-safe.
pub(crate) fn with_signals_blocked<T>(f: impl FnOnce() -> T) -> T {
    match SigSet::all().thread_swap_mask(SigmaskHow::SIG_SETMASK) {
        Ok(previous) => {
            let result = f();
            if let Err(err) = previous.thread_set_mask() {
                log::warn!("failed to restore signal mask: {err}");
            }
            result
        }
        Err(err) => {
            log::warn!("failed to block signals around map mutation: {err}");
            f()
        }
    }
}

impl DescriptorMap {
    pub fn new() -> Self {
        DescriptorMap {
            root: RwLock::new(Level0::new()),
            fd_count: AtomicUsize::new(0),
        }
    }

    /// `lookup(fd, create)` (§4.A). Returns `Ok(None)` when `create` is
    /// false and no queue exists yet.
    pub fn lookup(&self, fd: RawFd, create: bool) -> Result<Option<Arc<Queue>>, Errno> {
        if fd < 0 {
            return Err(Errno::EBADF);
        }
        let (i0, i1, i2, i3) = indices(fd);

        {
            let root = self.root.read().unwrap();
            if let Some(queue) = navigate(&root, i0, i1, i2, i3) {
                // Bumping the ref count while still holding the map's read
                // lock is this crate's equivalent of "acquire the Queue
                // mutex while still holding the read lock": destruction
                // requires the write lock, which cannot run concurrently
                // with any held read lock, so ref_count > 0 here guarantees
                // the queue survives past the point we release the read
                // lock below.
                queue.inc_ref();
                return Ok(Some(queue));
            }
        }

        if !create {
            return Ok(None);
        }

        // Lightweight validity probe before allocating anything.
        fcntl(fd, FcntlArg::F_GETFD).map_err(|_| Errno::EBADF)?;

        with_signals_blocked(|| {
            let mut root = self.root.write().unwrap();
            if let Some(queue) = navigate(&root, i0, i1, i2, i3) {
                queue.inc_ref();
                return Ok(Some(queue));
            }

            let l1 = root.slots[i0].get_or_insert_with(|| Box::new(Level1::new()));
            let l2 = l1.slots[i1].get_or_insert_with(|| Box::new(Level2::new()));
            let l3 = l2.slots[i2].get_or_insert_with(|| Box::new(Level3::new()));
            let queue = Queue::new(fd);
            queue.inc_ref();
            l3.slots[i3] = Some(queue.clone());
            self.fd_count.fetch_add(1, Ordering::Relaxed);
            log::debug!("aio: created queue for fd {fd}");
            Ok(Some(queue))
        })
    }

    /// `unref(Q)` (§4.B): the two-phase release-and-retry last-reference
    /// check. `Queue::inner`'s mutex must not be held by the caller.
    pub fn unref(&self, queue: &Arc<Queue>) {
        {
            let mut guard = queue.inner.lock().unwrap();
            if guard.ref_count > 1 {
                guard.ref_count -= 1;
                return;
            }
        }

        // Tentative last reference: map write lock must be taken without
        // holding the queue mutex (lock order is map-write -> queue).
        with_signals_blocked(|| {
            let mut root = self.root.write().unwrap();
            let mut guard = queue.inner.lock().unwrap();
            if guard.ref_count > 1 {
                // A new submitter raced us in between; back off.
                guard.ref_count -= 1;
                return;
            }
            guard.ref_count = 0;
            drop(guard);

            let (i0, i1, i2, i3) = indices(queue.fd);
            if let Some(l1) = root.slots.get_mut(i0).and_then(|s| s.as_mut()) {
                if let Some(l2) = l1.slots.get_mut(i1).and_then(|s| s.as_mut()) {
                    if let Some(l3) = l2.slots.get_mut(i2).and_then(|s| s.as_mut()) {
                        if l3.slots.get(i3).and_then(|s| s.as_ref()).is_some() {
                            l3.slots[i3] = None;
                            self.fd_count.fetch_sub(1, Ordering::Relaxed);
                            log::debug!("aio: dropped queue for fd {}", queue.fd);
                        }
                    }
                }
            }
        })
    }

    /// Fork hook, pre-fork phase (§4.G): acquire the read lock so no
    /// concurrent structural mutation can straddle the fork.
    pub(crate) fn fork_prepare(&self) -> RwLockReadGuard<'_, Level0> {
        self.root.read().unwrap()
    }

    /// Fork hook, post-fork-in-child phase (§4.G). Any queues reachable
    /// from the map are deliberately leaked: their mutexes may be in an
    /// indeterminate locked state inherited from whichever thread held them
    /// in the parent at the moment of `fork()`, so this must never touch a
    /// `Queue`'s `Drop` glue.
    pub fn fork_child_reset(&self) {
        self.fd_count.store(0, Ordering::Relaxed);
        match self.root.try_write() {
            Ok(mut guard) => {
                let stale = std::mem::replace(&mut *guard, Level0::new());
                // Deliberately leak: dropping `stale` could lock a Queue's
                // mutex left in an indeterminate state by the parent.
                std::mem::forget(stale);
            }
            Err(_) => {
                log::warn!(
                    "aio: descriptor map lock unavailable after fork outside the cooperative path, \
                     reinitializing in place"
                );
                // SAFETY: we only reach here from the post-fork child, which is
                // single-threaded by construction (fork() duplicates only the
                // calling thread). No other thread can be touching `root`, so
                // it is sound to overwrite its bytes wholesale even though we
                // were unable to prove that by taking the lock normally. The
                // old `Level0` (and everything it reaches: trie levels, queues,
                // their mutexes) is deliberately leaked rather than dropped,
                // since dropping could lock a mutex left in an indeterminate
                // state by whichever parent thread held it at fork() time.
                let root_ptr = &self.root as *const RwLock<Level0> as *mut RwLock<Level0>;
                unsafe {
                    std::ptr::write(root_ptr, RwLock::new(Level0::new()));
                }
            }
        }
    }
}

#[cfg(test)]
impl DescriptorMap {
    /// Non-blocking probe used only by [`crate::fork`]'s tests to confirm a
    /// previously taken read guard was actually released.
    pub(crate) fn try_write_root(&self) -> bool {
        self.root.try_write().is_ok()
    }
}

impl Default for DescriptorMap {
    fn default() -> Self {
        Self::new()
    }
}

fn navigate(root: &Level0, i0: usize, i1: usize, i2: usize, i3: usize) -> Option<Arc<Queue>> {
    root.slots
        .get(i0)?
        .as_ref()?
        .slots
        .get(i1)?
        .as_ref()?
        .slots
        .get(i2)?
        .as_ref()?
        .slots
        .get(i3)?
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn lookup_rejects_negative_fd() {
        let map = DescriptorMap::new();
        assert_eq!(map.lookup(-1, true), Err(Errno::EBADF));
    }

    #[test]
    fn lookup_rejects_closed_fd_without_create() {
        let map = DescriptorMap::new();
        assert_eq!(map.lookup(999_999, false).unwrap(), None);
    }

    #[test]
    fn lookup_creates_then_reuses_the_same_queue() {
        let map = DescriptorMap::new();
        let file = File::open("/dev/null").unwrap();
        let fd = file.as_raw_fd();

        let first = map.lookup(fd, true).unwrap().unwrap();
        assert_eq!(map.fd_count.load(Ordering::Relaxed), 1);
        assert_eq!(first.ref_count(), 1);

        let second = map.lookup(fd, true).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.ref_count(), 2);
        assert_eq!(map.fd_count.load(Ordering::Relaxed), 1);

        map.unref(&first);
        assert_eq!(map.fd_count.load(Ordering::Relaxed), 1);
        map.unref(&second);
        assert_eq!(map.fd_count.load(Ordering::Relaxed), 0);
        assert_eq!(map.lookup(fd, false).unwrap(), None);
    }

    #[test]
    fn distinct_descriptors_get_distinct_queues() {
        let map = DescriptorMap::new();
        let a = File::open("/dev/null").unwrap();
        let b = File::open("/dev/null").unwrap();

        let qa = map.lookup(a.as_raw_fd(), true).unwrap().unwrap();
        let qb = map.lookup(b.as_raw_fd(), true).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&qa, &qb));
        assert_eq!(map.fd_count.load(Ordering::Relaxed), 2);
    }
}
