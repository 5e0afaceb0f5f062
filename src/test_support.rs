//! Test-only helpers shared by the `#[cfg(test)]` modules throughout this
//! crate. Not part of the public surface.

#![cfg(test)]

use std::fs::File;
use std::io::Write;
use std::os::unix::io::FromRawFd;

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;

/// Route `log` records to stdout for the duration of a single test binary.
/// Harmless to call more than once; only the first call wins.
pub(crate) fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// An unnamed regular file (`O_TMPFILE`, never linked into any directory)
/// seeded with `contents`, for tests that need a real seekable descriptor
/// without leaving anything behind on disk.
pub(crate) fn scratch_file(contents: &[u8]) -> File {
    let fd = open(
        "/tmp",
        OFlag::O_TMPFILE | OFlag::O_RDWR,
        Mode::S_IRUSR | Mode::S_IWUSR,
    )
    .expect("O_TMPFILE scratch file");
    // SAFETY: `open` just handed us a freshly-opened, uniquely-owned fd.
    let mut file = unsafe { File::from_raw_fd(fd) };
    if !contents.is_empty() {
        file.write_all(contents).expect("seed scratch file");
    }
    file
}
