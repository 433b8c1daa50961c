use super::eventfd::EventFd;
use super::wait::{deadline_after, WaitOutcome, WaitStrategy};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error)]
pub enum PendingError {
    #[error("timed out waiting for completion")]
    TimedOut,
    /// The completing side went away without a value
    #[error("completion abandoned")]
    Abandoned,
    #[error("wait failed: {0}")]
    Wait(#[from] io::Error),
}

/// Create a linked completer/pending pair sharing one eventfd
pub fn completion<T>() -> io::Result<(Completer<T>, Pending<T>)> {
    let event = Arc::new(EventFd::new()?);
    let (sender, receiver) = oneshot::channel();
    Ok((
        Completer {
            sender: Some(sender),
            event: Arc::clone(&event),
        },
        Pending { receiver, event },
    ))
}

/// Engine side of a single asynchronous result
///
/// Signals the eventfd exactly once: on `complete`, or on drop if never completed.
#[derive(Debug)]
pub struct Completer<T> {
    sender: Option<oneshot::Sender<T>>,
    event: Arc<EventFd>,
}

impl<T> Completer<T> {
    pub fn complete(mut self, value: T) {
        if let Some(sender) = self.sender.take() {
            // receiver gone means the caller timed out; nothing to report
            let _ = sender.send(value);
        }
        self.notify();
    }

    /// Whether the waiting side has given up
    pub fn is_abandoned(&self) -> bool {
        self.sender.as_ref().map_or(true, oneshot::Sender::is_closed)
    }

    fn notify(&self) {
        if let Err(e) = self.event.signal() {
            tracing::warn!(error = %e, "failed to signal completion eventfd");
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if self.sender.take().is_some() {
            self.notify();
        }
    }
}

/// Caller side of a single asynchronous result
#[derive(Debug)]
pub struct Pending<T> {
    receiver: oneshot::Receiver<T>,
    event: Arc<EventFd>,
}

impl<T> Pending<T> {
    /// Descriptor that becomes readable when the result is available
    pub fn raw_fd(&self) -> RawFd {
        self.event.as_raw_fd()
    }

    /// Take the result if it is already available
    pub fn try_take(&mut self) -> Result<Option<T>, PendingError> {
        match self.receiver.try_recv() {
            Ok(value) => Ok(Some(value)),
            Err(oneshot::error::TryRecvError::Empty) => Ok(None),
            Err(oneshot::error::TryRecvError::Closed) => Err(PendingError::Abandoned),
        }
    }

    /// Wait for the result through `strategy`
    pub fn wait(
        mut self,
        strategy: &dyn WaitStrategy,
        timeout: Option<Duration>,
    ) -> Result<T, PendingError> {
        let deadline = deadline_after(timeout);
        loop {
            if let Some(value) = self.try_take()? {
                return Ok(value);
            }
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining == Some(Duration::ZERO) {
                return Err(PendingError::TimedOut);
            }
            if strategy.wait_readable(self.event.as_raw_fd(), remaining)? == WaitOutcome::Ready {
                self.event.reset()?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BlockingWait;

    #[test]
    fn test_complete_before_wait() {
        let (completer, pending) = completion::<u32>().unwrap();
        completer.complete(7);
        assert_eq!(pending.wait(&BlockingWait, None).unwrap(), 7);
    }

    #[test]
    fn test_complete_from_other_thread() {
        let (completer, pending) = completion::<&'static str>().unwrap();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            completer.complete("done");
        });
        assert_eq!(
            pending
                .wait(&BlockingWait, Some(Duration::from_secs(5)))
                .unwrap(),
            "done"
        );
        handle.join().unwrap();
    }

    #[test]
    fn test_dropped_completer_wakes_waiter() {
        let (completer, pending) = completion::<u32>().unwrap();
        drop(completer);
        assert!(matches!(
            pending.wait(&BlockingWait, Some(Duration::from_secs(5))),
            Err(PendingError::Abandoned)
        ));
    }

    #[test]
    fn test_timeout_leaves_completer_usable() {
        let (completer, pending) = completion::<u32>().unwrap();
        assert!(matches!(
            pending.wait(&BlockingWait, Some(Duration::from_millis(10))),
            Err(PendingError::TimedOut)
        ));
        assert!(completer.is_abandoned());
        // completing after the caller left must not panic
        completer.complete(1);
    }

    #[test]
    fn test_maximum_timeout_waits_for_completion() {
        let (completer, pending) = completion::<u32>().unwrap();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            completer.complete(9);
        });
        assert_eq!(pending.wait(&BlockingWait, Some(Duration::MAX)).unwrap(), 9);
        handle.join().unwrap();
    }

    #[test]
    fn test_raw_fd_readable_after_completion() {
        let (completer, mut pending) = completion::<u8>().unwrap();
        assert_eq!(pending.try_take().unwrap(), None);
        completer.complete(3);
        assert_eq!(
            BlockingWait
                .wait_readable(pending.raw_fd(), Some(Duration::ZERO))
                .unwrap(),
            WaitOutcome::Ready
        );
        assert_eq!(pending.try_take().unwrap(), Some(3));
    }
}
