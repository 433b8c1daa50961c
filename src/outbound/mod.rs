//! Outbound pipeline: caller-side buffer and engine-side write queue

pub mod buffer;
pub mod writer;

pub use buffer::{FrameKind, OutboundBuffer, OutboundFrame};
pub use writer::{WriteQueue, WriteReport, WriteTarget};
