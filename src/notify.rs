//! Completion notification delivery — the last step of the cleanup protocol
//! (§4.D.6.f): either do nothing, queue a realtime signal, or invoke a
//! caller-supplied callback.

use crate::control_block::{AioCb, Notify};

pub(crate) fn deliver(cb: &AioCb) {
    match &cb.notify {
        Notify::None => {}
        Notify::Signal { signo, value } => deliver_signal(*signo, *value),
        Notify::Callback { func, value, .. } => func(*value),
    }
}

/// Queue a realtime signal carrying `value` via `sigqueue(2)`, which the
/// kernel delivers with `si_pid`/`si_uid` set to this process's own identity
/// (the submitter, since everything here runs in one address space) and
/// `si_value` set to `value`.
///
/// Deviation from the design: the original describes `si_code ==
/// SI_ASYNCIO`. `libc::sigqueue` always produces `SI_QUEUE`; reproducing
/// `SI_ASYNCIO` exactly would require hand-constructing a `siginfo_t` against
/// the kernel's internal `_sifields._rt` union layout, which `libc` does not
/// expose safely. We take the portable signal/payload/identity semantics
/// `sigqueue` gives us and accept the differing `si_code` (see DESIGN.md).
fn deliver_signal(signo: i32, value: i32) {
    let sigval = libc::sigval { sival_int: value };
    let rc = unsafe { libc::sigqueue(libc::getpid(), signo, sigval) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        log::warn!("aio: failed to queue completion signal {signo}: {err}");
    }
}

#[cfg(test)]
mod tests {
    use crate::control_block::{AioCb, Notify};
    use crate::submit::submit_write;
    use crate::test_support::scratch_file;
    use nix::sys::signal::{SigSet, Signal};
    use nix::sys::signalfd::SignalFd;
    use std::os::unix::io::AsRawFd;

    /// Blocks the signal on the calling thread and reads it back through a
    /// `signalfd`, the same mechanism `pbs-fuse-loop`'s sibling
    /// `src/tools/signalfd.rs` uses to turn queued signals into something
    /// synchronously observable instead of racing a process-wide handler.
    #[test]
    fn signal_notification_carries_payload() {
        const VALUE: i32 = 0x5a5a;
        let signal = Signal::SIGRTMIN();

        let mut mask = SigSet::empty();
        mask.add(signal);
        mask.thread_block().unwrap();
        let mut signal_fd = SignalFd::new(&mask).unwrap();

        let file = scratch_file(b"");
        let fd = file.as_raw_fd();
        let payload = b"x".to_vec();
        let cb = unsafe {
            AioCb::write(
                fd,
                payload.as_ptr(),
                payload.len(),
                0,
                Notify::Signal {
                    signo: signal as i32,
                    value: VALUE,
                },
            )
        };
        submit_write(&cb).unwrap();
        cb.wait();
        assert_eq!(cb.error(), 0);

        let info = signal_fd.read_signal().unwrap().expect("signal queued");
        assert_eq!(info.ssi_signo as i32, signal as i32);
        assert_eq!(info.ssi_int, VALUE as u32);
    }
}
