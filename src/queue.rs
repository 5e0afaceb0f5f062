//! Per-descriptor container of active [`RequestRecord`]s.
//!
//! The list is a `VecDeque` rather than an intrusive pointer chain: records
//! are pushed to the front on registration. The sequencing wait in
//! [`Queue::register_and_wait`] does *not* rescan the live list on every
//! wake-up — it fixes the cohort of already-linked records at insertion time
//! (the "entries older than this one" the original's `next`-walk visits) and
//! waits only on that cohort, so a later arrival can never become something
//! an earlier waiter blocks on (see DESIGN.md).

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex};

use crate::control_block::Opcode;
use crate::record::{RequestRecord, EXITED};

pub(crate) struct QueueInner {
    pub seekable: bool,
    pub append: bool,
    pub init: bool,
    pub ref_count: usize,
    pub list: VecDeque<Arc<RequestRecord>>,
}

/// One per descriptor that currently has, or recently had, active requests.
pub struct Queue {
    pub fd: RawFd,
    pub(crate) inner: Mutex<QueueInner>,
    pub(crate) condvar: Condvar,
}

impl Queue {
    pub fn new(fd: RawFd) -> Arc<Self> {
        Arc::new(Queue {
            fd,
            inner: Mutex::new(QueueInner {
                seekable: false,
                append: false,
                init: false,
                ref_count: 0,
                list: VecDeque::new(),
            }),
            condvar: Condvar::new(),
        })
    }

    /// Bump the reference count. Called by the Map while still holding its
    /// read (or write) lock, and by the Submitter immediately after lookup.
    pub fn inc_ref(&self) {
        self.inner.lock().unwrap().ref_count += 1;
    }

    pub fn ref_count(&self) -> usize {
        self.inner.lock().unwrap().ref_count
    }

    /// Registration handshake (§4.D.1) plus the sequencing wait (§4.D.3),
    /// run as a single critical section exactly as the original worker body
    /// does: link the record at the head, lazily probe seekability/append
    /// mode, post the submitter's registration semaphore, then block until
    /// every WRITE that was *already on the queue before this record joined
    /// it* has exited (only required for WRITE-with-append, FSYNC,
    /// FDATASYNC).
    ///
    /// The cohort checked here is fixed once, at insertion time: it is the
    /// snapshot of records linked immediately before `record` is pushed to
    /// the front. A record that arrives *after* `record` is never added to
    /// that cohort, even though it remains linked (and visible in a live
    /// scan of `guard.list`) while this wait is still blocked — two
    /// append-writes queued behind the same in-flight write must each wait
    /// only on strictly older writes, never on each other, or they deadlock
    /// waiting on one another's unlink.
    ///
    /// `probe_init` is only invoked the first time any request lands on this
    /// queue; it performs the `lseek`/`fcntl` probes described in §4.A.
    /// `on_registered` runs exactly once, after linking and before any
    /// sequencing wait, so the submitter can be woken as early as possible.
    pub fn register_and_wait(
        &self,
        record: &Arc<RequestRecord>,
        probe_init: impl FnOnce(RawFd) -> (bool, bool),
        on_registered: impl FnOnce(),
    ) -> (bool, bool) {
        let mut guard = self.inner.lock().unwrap();

        // Fixed cohort: every record linked strictly before this one. Later
        // arrivals are appended to `guard.list` after this point but must
        // never be waited on by `record`.
        let cohort: Vec<Arc<RequestRecord>> = guard.list.iter().cloned().collect();

        guard.list.push_front(record.clone());

        if !guard.init {
            let (seekable, append) = probe_init(self.fd);
            guard.seekable = seekable;
            guard.append = append || !seekable;
            guard.init = true;
        }

        let (seekable, append) = (guard.seekable, guard.append);

        on_registered();

        let needs_sequencing = match record.opcode {
            Opcode::Read => false,
            Opcode::Write => append,
            Opcode::Fsync | Opcode::Fdatasync => true,
        };

        if needs_sequencing {
            loop {
                let blocked = cohort
                    .iter()
                    .any(|other| other.is_write_like() && other.running.load() != EXITED);
                if !blocked {
                    break;
                }
                guard = self.condvar.wait(guard).unwrap();
            }
        }

        (seekable, append)
    }

    /// Unlink `record` and wake any sequencing waiters (§4.D.6.e).
    pub fn unlink_and_broadcast(&self, record: &Arc<RequestRecord>) {
        let mut guard = self.inner.lock().unwrap();
        guard.list.retain(|other| !Arc::ptr_eq(other, record));
        self.condvar.notify_all();
    }

    /// Snapshot of the currently linked records, for cancellation.
    pub fn snapshot_records(&self) -> Vec<Arc<RequestRecord>> {
        self.inner.lock().unwrap().list.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_block::{AioCb, Notify};
    use crate::record::RequestRecord;
    use std::os::unix::io::RawFd;
    use std::time::Duration;

    fn dummy_cb() -> Arc<AioCb> {
        // Zero-length write: never dispatched in this test, just needed to
        // build a RequestRecord.
        AioCb::sync(-1 as RawFd, false, Notify::None)
    }

    /// Three append-writes queued back to back, the scenario the sequencing
    /// rule is supposed to serialize: A is oldest, B waits on A, C (newest)
    /// waits on both. Before this fix, once A exited and B woke up it would
    /// rescan the live list, see C (a strictly newer arrival) still linked
    /// and write-like, and wait on it — while C's own cohort correctly
    /// contains B, so B and C would deadlock waiting on each other. With the
    /// cohort fixed at insertion time, B's wait set never includes C, so B
    /// (and then C) drain in submission order with no rescan-induced cycle.
    #[test]
    fn later_append_write_never_blocks_an_earlier_one() {
        // `Queue::new` already returns an `Arc<Queue>`.
        let queue = Queue::new(-1 as RawFd);
        let a = RequestRecord::new(Opcode::Write, dummy_cb());
        let b = RequestRecord::new(Opcode::Write, dummy_cb());
        let c = RequestRecord::new(Opcode::Write, dummy_cb());

        // A registers first: append-mode, no one ahead of it, so it proceeds
        // without blocking in register_and_wait.
        queue.register_and_wait(&a, |_| (true, true), || {});

        // B registers next; A is still linked and write-like, so B's own
        // call to register_and_wait would block forever if run on this
        // thread. Drive it on a background thread instead.
        let (qb, bb) = (queue.clone(), b.clone());
        let b_thread = std::thread::spawn(move || {
            qb.register_and_wait(&bb, |_| (true, true), || {});
        });

        // Give B a moment to link and start waiting before C registers, so
        // C's cohort snapshot includes both A and B.
        std::thread::sleep(Duration::from_millis(50));

        let (qc, cc) = (queue.clone(), c.clone());
        let c_thread = std::thread::spawn(move || {
            qc.register_and_wait(&cc, |_| (true, true), || {});
        });
        std::thread::sleep(Duration::from_millis(50));

        // A exits: unlink + broadcast wakes sequencing waiters. Only B's
        // cohort contained A, so only B should be able to finish; confirm it
        // does within a bounded wait instead of hanging forever.
        a.running.swap_and_wake(crate::record::EXITED);
        queue.unlink_and_broadcast(&a);

        b_thread.join().unwrap();
        // C is still correctly waiting on B at this point.
        assert!(!c_thread.is_finished());

        b.running.swap_and_wake(crate::record::EXITED);
        queue.unlink_and_broadcast(&b);
        c_thread.join().unwrap();
    }
}
