use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Linux eventfd used as a coalescing, pollable wakeup counter
///
/// Any number of [`EventFd::signal`] calls before the consumer calls
/// [`EventFd::reset`] collapse into a single readable edge.
#[derive(Debug)]
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    pub fn new() -> io::Result<Self> {
        // SAFETY: eventfd has no memory preconditions; the result is checked below.
        let raw = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `raw` is a freshly created descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self { fd })
    }

    /// Make the descriptor readable. Idempotent until the next reset.
    pub fn signal(&self) -> io::Result<()> {
        let value: u64 = 1;
        // SAFETY: writes exactly 8 bytes from a valid u64.
        let written = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                (&value as *const u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if written < 0 {
            let err = io::Error::last_os_error();
            // counter saturated: already signalled
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Consume pending signals. Returns whether the descriptor was signalled.
    pub fn reset(&self) -> io::Result<bool> {
        let mut value: u64 = 0;
        // SAFETY: reads exactly 8 bytes into a valid u64.
        let read = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                (&mut value as *mut u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if read < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(value > 0)
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for EventFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
