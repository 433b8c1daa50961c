use crate::config::BackpressurePolicy;
use crate::error::{ClientError, ClientResult};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use tokio::sync::Notify;

/// What a frame carries, which decides whether it is replayed after a reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// PUB / HPUB: retained for replay until acknowledged
    Publish,
    /// SUB / UNSUB: regenerated from the subscription table, never replayed
    Control,
}

/// One encoded frame with its enqueue position
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub seq: u64,
    pub kind: FrameKind,
    pub bytes: Bytes,
}

impl OutboundFrame {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Default)]
struct BufferState {
    frames: VecDeque<OutboundFrame>,
    /// Bytes enqueued and not yet accepted by the socket (queued + staged)
    accounted: usize,
    next_seq: u64,
    closed: bool,
}

/// Frames produced by caller threads, waiting for the engine
///
/// Sequence numbers are assigned under the lock, so they are the wire order.
/// Byte accounting covers a frame from `enqueue` until the engine reports the
/// socket accepted it through [`OutboundBuffer::release`].
#[derive(Debug)]
pub struct OutboundBuffer {
    state: Mutex<BufferState>,
    space: Condvar,
    wake: Notify,
    ceiling: usize,
    policy: BackpressurePolicy,
}

impl OutboundBuffer {
    pub fn new(ceiling: usize, policy: BackpressurePolicy) -> Self {
        Self {
            state: Mutex::new(BufferState {
                next_seq: 1,
                ..Default::default()
            }),
            space: Condvar::new(),
            wake: Notify::new(),
            ceiling,
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock()
    }

    /// Append a frame and return its sequence number
    ///
    /// Publish frames are subject to the byte ceiling. A frame is always admitted
    /// into an empty buffer, so a single frame larger than the ceiling cannot
    /// deadlock its producer.
    pub fn enqueue(&self, kind: FrameKind, bytes: Bytes) -> ClientResult<u64> {
        let len = bytes.len();
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(ClientError::Closed);
            }
            let fits = kind == FrameKind::Control
                || state.accounted == 0
                || state.accounted + len <= self.ceiling;
            if fits {
                break;
            }
            match self.policy {
                BackpressurePolicy::FailFast => {
                    return Err(ClientError::BufferFull {
                        queued: state.accounted,
                        ceiling: self.ceiling,
                    })
                }
                BackpressurePolicy::Block => self.space.wait(&mut state),
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.accounted += len;
        let was_empty = state.frames.is_empty();
        state.frames.push_back(OutboundFrame { seq, kind, bytes });
        drop(state);

        if was_empty {
            self.wake.notify_one();
        }
        Ok(seq)
    }

    /// Move frames into `out` until `max_bytes` is reached (at least one frame)
    pub fn drain_into(&self, out: &mut VecDeque<OutboundFrame>, max_bytes: usize) -> usize {
        let mut state = self.lock();
        let mut taken = 0;
        while let Some(front) = state.frames.front() {
            if taken > 0 && taken + front.len() > max_bytes {
                break;
            }
            taken += front.len();
            if let Some(frame) = state.frames.pop_front() {
                out.push_back(frame);
            }
        }
        taken
    }

    /// Return accounted bytes after the socket accepted them
    pub fn release(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let mut state = self.lock();
        state.accounted = state.accounted.saturating_sub(bytes);
        drop(state);
        self.space.notify_all();
    }

    /// Sequence number of the most recently enqueued frame (0 if none)
    pub fn last_seq(&self) -> u64 {
        self.lock().next_seq - 1
    }

    pub fn accounted_bytes(&self) -> usize {
        self.lock().accounted
    }

    pub fn queued_frames(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Refuse further frames and wake every blocked producer
    pub fn close(&self) {
        self.lock().closed = true;
        self.space.notify_all();
        self.wake.notify_one();
    }

    /// Resolves when a producer added work to an empty buffer
    pub async fn notified(&self) {
        self.wake.notified().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn frame(len: usize) -> Bytes {
        Bytes::from(vec![b'x'; len])
    }

    #[test]
    fn test_sequence_numbers_follow_enqueue_order() {
        let buffer = OutboundBuffer::new(1024, BackpressurePolicy::Block);
        assert_eq!(buffer.last_seq(), 0);
        let first = buffer.enqueue(FrameKind::Publish, frame(10)).unwrap();
        let second = buffer.enqueue(FrameKind::Control, frame(5)).unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(buffer.last_seq(), 2);

        let mut out = VecDeque::new();
        buffer.drain_into(&mut out, usize::MAX);
        let seqs: Vec<u64> = out.iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn test_drain_respects_max_bytes_but_takes_one() {
        let buffer = OutboundBuffer::new(1 << 20, BackpressurePolicy::Block);
        for _ in 0..4 {
            buffer.enqueue(FrameKind::Publish, frame(100)).unwrap();
        }
        let mut out = VecDeque::new();
        assert_eq!(buffer.drain_into(&mut out, 250), 200);
        assert_eq!(out.len(), 2);
        assert_eq!(buffer.drain_into(&mut out, 10), 100);
        assert_eq!(out.len(), 3);
        assert_eq!(buffer.queued_frames(), 1);
    }

    #[test]
    fn test_accounting_holds_until_release() {
        let buffer = OutboundBuffer::new(1000, BackpressurePolicy::FailFast);
        buffer.enqueue(FrameKind::Publish, frame(600)).unwrap();
        let mut out = VecDeque::new();
        buffer.drain_into(&mut out, usize::MAX);
        // drained but not written: still counts against the ceiling
        assert_eq!(buffer.accounted_bytes(), 600);
        assert!(matches!(
            buffer.enqueue(FrameKind::Publish, frame(600)),
            Err(ClientError::BufferFull {
                queued: 600,
                ceiling: 1000
            })
        ));
        buffer.release(600);
        assert!(buffer.enqueue(FrameKind::Publish, frame(600)).is_ok());
    }

    #[test]
    fn test_fail_fast_never_grows_past_ceiling() {
        let ceiling = 1024 * 1024;
        let buffer = OutboundBuffer::new(ceiling, BackpressurePolicy::FailFast);
        let mut accepted = 0usize;
        let mut rejected = 0usize;
        for _ in 0..200 {
            match buffer.enqueue(FrameKind::Publish, frame(10 * 1024)) {
                Ok(_) => accepted += 10 * 1024,
                Err(ClientError::BufferFull { .. }) => rejected += 1,
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert!(accepted <= ceiling);
        assert!(rejected > 0);
        assert_eq!(buffer.accounted_bytes(), accepted);
    }

    #[test]
    fn test_oversized_frame_admitted_into_empty_buffer() {
        let buffer = OutboundBuffer::new(100, BackpressurePolicy::FailFast);
        assert!(buffer.enqueue(FrameKind::Publish, frame(500)).is_ok());
        assert!(buffer.enqueue(FrameKind::Publish, frame(1)).is_err());
    }

    #[test]
    fn test_control_frames_bypass_ceiling() {
        let buffer = OutboundBuffer::new(100, BackpressurePolicy::FailFast);
        buffer.enqueue(FrameKind::Publish, frame(100)).unwrap();
        assert!(buffer.enqueue(FrameKind::Control, frame(20)).is_ok());
    }

    #[test]
    fn test_blocked_producer_resumes_after_release() {
        let buffer = Arc::new(OutboundBuffer::new(100, BackpressurePolicy::Block));
        buffer.enqueue(FrameKind::Publish, frame(100)).unwrap();

        let producer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || buffer.enqueue(FrameKind::Publish, frame(50)))
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        buffer.release(100);
        assert_eq!(producer.join().unwrap().unwrap(), 2);
    }

    #[test]
    fn test_close_wakes_blocked_producer() {
        let buffer = Arc::new(OutboundBuffer::new(10, BackpressurePolicy::Block));
        buffer.enqueue(FrameKind::Publish, frame(10)).unwrap();

        let producer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || buffer.enqueue(FrameKind::Publish, frame(10)))
        };
        std::thread::sleep(Duration::from_millis(30));
        buffer.close();
        assert!(matches!(producer.join().unwrap(), Err(ClientError::Closed)));
        assert!(buffer.is_closed());
    }

    #[tokio::test]
    async fn test_enqueue_into_empty_buffer_wakes_engine() {
        let buffer = Arc::new(OutboundBuffer::new(1024, BackpressurePolicy::Block));
        let waiter = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.notified().await })
        };
        tokio::task::yield_now().await;
        buffer.enqueue(FrameKind::Publish, frame(1)).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
