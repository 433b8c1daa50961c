use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    TimedOut,
}

/// Absolute deadline for a relative timeout
///
/// A timeout too large to represent as an `Instant` means no deadline.
pub(crate) fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|timeout| Instant::now().checked_add(timeout))
}

/// How a caller waits for a descriptor to become readable
///
/// The client only ever hands out raw descriptors; a cooperative scheduler
/// plugs in here to park its task instead of the OS thread.
pub trait WaitStrategy: Send + Sync {
    /// Wait until `fd` is readable or `timeout` (None = forever) elapses
    fn wait_readable(&self, fd: RawFd, timeout: Option<Duration>) -> io::Result<WaitOutcome>;
}

/// Default strategy: block the calling thread in `poll(2)`
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockingWait;

impl WaitStrategy for BlockingWait {
    fn wait_readable(&self, fd: RawFd, timeout: Option<Duration>) -> io::Result<WaitOutcome> {
        let deadline = deadline_after(timeout);
        loop {
            let timeout_ms: libc::c_int = match deadline {
                None => -1,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    // round up so sub-millisecond remainders still wait
                    let millis = remaining.as_micros().div_ceil(1000);
                    millis.min(libc::c_int::MAX as u128) as libc::c_int
                }
            };

            let mut pollfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            // SAFETY: `pollfd` is a valid single-element array for the call's duration.
            let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if rc > 0 {
                if pollfd.revents & libc::POLLNVAL != 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "descriptor is not open",
                    ));
                }
                return Ok(WaitOutcome::Ready);
            }
            return Ok(WaitOutcome::TimedOut);
        }
    }
}

/// Strategy backed by a closure, for schedulers with their own readiness primitive
pub struct FnWait<F>(F);

impl<F> FnWait<F>
where
    F: Fn(RawFd, Option<Duration>) -> io::Result<WaitOutcome> + Send + Sync,
{
    pub fn new(wait: F) -> Self {
        Self(wait)
    }
}

impl<F> WaitStrategy for FnWait<F>
where
    F: Fn(RawFd, Option<Duration>) -> io::Result<WaitOutcome> + Send + Sync,
{
    fn wait_readable(&self, fd: RawFd, timeout: Option<Duration>) -> io::Result<WaitOutcome> {
        (self.0)(fd, timeout)
    }
}

impl<F> std::fmt::Debug for FnWait<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnWait")
    }
}
