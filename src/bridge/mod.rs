//! Notification bridge between the I/O engine thread and callers
//!
//! The engine never calls back into caller code to report completion. It signals
//! an eventfd; callers wait on that descriptor through a [`WaitStrategy`]. The
//! default [`BlockingWait`] parks the OS thread in `poll(2)`, while a cooperative
//! scheduler supplies its own strategy (for example via [`FnWait`]) and parks only
//! the current task.
//!
//! Each pending operation gets its own eventfd, so one completion is observed by
//! exactly one waiter.

mod completion;
mod eventfd;
mod wait;

pub use completion::{completion, Completer, Pending, PendingError};
pub use eventfd::EventFd;
pub(crate) use wait::deadline_after;
pub use wait::{BlockingWait, FnWait, WaitOutcome, WaitStrategy};
