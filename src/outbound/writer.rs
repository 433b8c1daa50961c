use super::buffer::{FrameKind, OutboundFrame};
use crate::transport::SocketTransport;
use bytes::Bytes;
use std::collections::VecDeque;
use std::io::{self, IoSlice};

/// Slices handed to one gather write
const MAX_IOV: usize = 128;

const PING: &[u8] = b"PING\r\n";

/// Anything that accepts non-blocking gather writes (`Ok(0)` = would block)
pub trait WriteTarget {
    fn try_write_vectored(&self, slices: &[IoSlice<'_>]) -> io::Result<usize>;
}

impl WriteTarget for SocketTransport {
    fn try_write_vectored(&self, slices: &[IoSlice<'_>]) -> io::Result<usize> {
        SocketTransport::try_write_vectored(self, slices)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Drained from the outbound buffer; counts against the byte ceiling
    Buffered(FrameKind),
    /// Resent from the replay log after a reconnect
    Replay,
    Ping,
    /// Engine-generated protocol traffic (PONG, resubscriptions)
    Internal,
}

#[derive(Debug)]
struct Staged {
    seq: u64,
    origin: Origin,
    bytes: Bytes,
}

/// Result of one [`WriteQueue::write_to`] call
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteReport {
    pub bytes_written: usize,
    /// Bytes to hand back to the outbound buffer's accounting
    pub released: usize,
    pub pings_written: usize,
    pub messages_written: u64,
    pub message_bytes_written: u64,
}

/// Engine-owned write side of one logical connection
///
/// Frames move buffer -> staged -> socket. Publish frames that reach the socket
/// stay in the replay log until a PONG covers their sequence number, and all of
/// them are resent on the next connection. A frame interrupted by a disconnect
/// is resent whole.
#[derive(Debug, Default)]
pub struct WriteQueue {
    staged: VecDeque<Staged>,
    /// Bytes of the front staged frame already written
    head_offset: usize,
    replay: VecDeque<OutboundFrame>,
    replay_bytes: usize,
    highest_staged_seq: u64,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage frames drained from the outbound buffer
    pub fn stage_buffered(&mut self, frames: &mut VecDeque<OutboundFrame>) {
        for frame in frames.drain(..) {
            self.highest_staged_seq = self.highest_staged_seq.max(frame.seq);
            self.staged.push_back(Staged {
                seq: frame.seq,
                origin: Origin::Buffered(frame.kind),
                bytes: frame.bytes,
            });
        }
    }

    /// Append a PING; returns the highest sequence number it acknowledges
    pub fn stage_ping(&mut self) -> u64 {
        self.staged.push_back(Staged {
            seq: 0,
            origin: Origin::Ping,
            bytes: Bytes::from_static(PING),
        });
        self.highest_staged_seq
    }

    pub fn stage_internal(&mut self, bytes: Bytes) {
        self.staged.push_back(Staged {
            seq: 0,
            origin: Origin::Internal,
            bytes,
        });
    }

    pub fn highest_staged_seq(&self) -> u64 {
        self.highest_staged_seq
    }

    pub fn has_pending(&self) -> bool {
        !self.staged.is_empty()
    }

    pub fn staged_frames(&self) -> usize {
        self.staged.len()
    }

    pub fn replay_bytes(&self) -> usize {
        self.replay_bytes
    }

    /// Write as much as the target accepts without blocking
    ///
    /// An error after some progress is deferred so the progress is reported;
    /// the next call hits the error again with nothing written.
    pub fn write_to<W: WriteTarget>(&mut self, target: &W) -> io::Result<WriteReport> {
        let mut report = WriteReport::default();
        while !self.staged.is_empty() {
            let result = {
                let mut slices = Vec::with_capacity(self.staged.len().min(MAX_IOV));
                for (index, frame) in self.staged.iter().take(MAX_IOV).enumerate() {
                    let start = if index == 0 { self.head_offset } else { 0 };
                    slices.push(IoSlice::new(&frame.bytes[start..]));
                }
                target.try_write_vectored(&slices)
            };
            let written = match result {
                Ok(written) => written,
                Err(e) if report.bytes_written == 0 => return Err(e),
                Err(_) => break,
            };
            if written == 0 {
                break;
            }
            report.bytes_written += written;
            self.advance(written, &mut report);
        }
        Ok(report)
    }

    fn advance(&mut self, mut written: usize, report: &mut WriteReport) {
        while written > 0 {
            let Some(front) = self.staged.front() else {
                break;
            };
            let remaining = front.bytes.len() - self.head_offset;
            if written < remaining {
                self.head_offset += written;
                return;
            }
            written -= remaining;
            self.head_offset = 0;
            if let Some(frame) = self.staged.pop_front() {
                self.complete(frame, report);
            }
        }
        // zero-length frames at the head are complete as soon as they are reached
        while self.head_offset == 0
            && self.staged.front().is_some_and(|frame| frame.bytes.is_empty())
        {
            if let Some(frame) = self.staged.pop_front() {
                self.complete(frame, report);
            }
        }
    }

    fn complete(&mut self, frame: Staged, report: &mut WriteReport) {
        let len = frame.bytes.len();
        match frame.origin {
            Origin::Buffered(FrameKind::Publish) => {
                report.released += len;
                report.messages_written += 1;
                report.message_bytes_written += len as u64;
                self.retain(frame.seq, frame.bytes);
            }
            Origin::Buffered(FrameKind::Control) => report.released += len,
            Origin::Replay => self.retain(frame.seq, frame.bytes),
            Origin::Ping => report.pings_written += 1,
            Origin::Internal => {}
        }
    }

    fn retain(&mut self, seq: u64, bytes: Bytes) {
        self.replay_bytes += bytes.len();
        self.replay.push_back(OutboundFrame {
            seq,
            kind: FrameKind::Publish,
            bytes,
        });
    }

    /// Drop replay entries acknowledged by a PONG covering `covers`
    pub fn acknowledge(&mut self, covers: u64) {
        while self.replay.front().is_some_and(|frame| frame.seq <= covers) {
            if let Some(frame) = self.replay.pop_front() {
                self.replay_bytes -= frame.len();
            }
        }
    }

    /// Forget connection-scoped traffic after the socket died
    ///
    /// Pings and internal frames are dropped, buffered control frames too (they
    /// are regenerated from the subscription table). Returns bytes to release.
    pub fn on_disconnect(&mut self) -> usize {
        self.head_offset = 0;
        let mut released = 0;
        self.staged.retain(|frame| match frame.origin {
            Origin::Buffered(FrameKind::Publish) | Origin::Replay => true,
            Origin::Buffered(FrameKind::Control) => {
                released += frame.bytes.len();
                false
            }
            Origin::Ping | Origin::Internal => false,
        });
        released
    }

    /// Order the write stream of a fresh connection
    ///
    /// Resubscriptions go first, then every logged frame the old connection
    /// never had acknowledged, then whatever was staged but never written.
    /// Returns the number of frames replayed.
    pub fn prepare_reconnect(&mut self, resubscriptions: Vec<Bytes>) -> usize {
        let replayed = self.replay.len();
        let mut front: VecDeque<Staged> = resubscriptions
            .into_iter()
            .map(|bytes| Staged {
                seq: 0,
                origin: Origin::Internal,
                bytes,
            })
            .chain(self.replay.drain(..).map(|frame| Staged {
                seq: frame.seq,
                origin: Origin::Replay,
                bytes: frame.bytes,
            }))
            .collect();
        self.replay_bytes = 0;
        front.extend(self.staged.drain(..));
        self.staged = front;
        replayed
    }

    /// Discard everything; returns bytes to release
    pub fn clear(&mut self) -> usize {
        let released = self
            .staged
            .iter()
            .filter(|frame| matches!(frame.origin, Origin::Buffered(_)))
            .map(|frame| frame.bytes.len())
            .sum();
        self.staged.clear();
        self.head_offset = 0;
        self.replay.clear();
        self.replay_bytes = 0;
        released
    }
}
