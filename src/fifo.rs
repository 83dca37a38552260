//! Named-pipe helpers.
//!
//! Thin wrappers over `nix` that keep the blocking semantics of FIFO
//! `open` explicit at call sites. Blocking opens rendezvous with the
//! peer; the non-blocking write open is used where "peer gone" must
//! surface as an error (`ENXIO`) instead of a hang.

use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use crate::Result;

/// Creates a FIFO at `path` with mode `0666`, replacing any previous one.
pub fn create(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    mkfifo(path, Mode::from_bits_truncate(0o666))?;
    Ok(())
}

/// Removes a FIFO, ignoring a missing file.
pub fn remove(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Opens the read end, blocking until a writer shows up.
pub fn open_read(path: &Path) -> Result<File> {
    let fd = open(path, OFlag::O_RDONLY, Mode::empty())?;
    Ok(File::from(fd))
}

/// Opens the write end, blocking until a reader shows up.
pub fn open_write(path: &Path) -> Result<File> {
    let fd = open(path, OFlag::O_WRONLY, Mode::empty())?;
    Ok(File::from(fd))
}

/// Opens the write end without blocking.
///
/// Fails with `ENXIO` when no reader has the FIFO open, which is how
/// "the peer is gone" is detected.
pub fn try_open_write(path: &Path) -> Result<File> {
    let fd = open(path, OFlag::O_WRONLY | OFlag::O_NONBLOCK, Mode::empty())?;
    Ok(File::from(fd))
}

/// Opens the read end as a raw descriptor, without EINTR retries.
///
/// The hostess uses this for the rendezvous FIFO: a signal must be able
/// to interrupt the blocking open, and `std` would transparently retry.
pub fn open_read_raw(path: &Path) -> nix::Result<OwnedFd> {
    open(path, OFlag::O_RDONLY, Mode::empty())
}

/// Reads exactly `buf.len()` bytes from a raw descriptor.
///
/// Returns `Ok(false)` on end-of-file before the first byte, an error
/// on a short record, and propagates `EINTR` to the caller so a pending
/// signal can be handled between records.
pub fn read_record(fd: &OwnedFd, buf: &mut [u8]) -> nix::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match nix::unistd::read(fd, &mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(Errno::EBADMSG),
            Ok(n) => filled += n,
            // A signal between records is a normal wake-up; mid-record
            // it would tear the fixed-length framing, so keep reading.
            Err(Errno::EINTR) if filled == 0 => return Err(Errno::EINTR),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
