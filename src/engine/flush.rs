//! Flush correlation
//!
//! Every PING the engine stages is recorded as a [`PingMark`] carrying the
//! highest sequence number written before it. The server answers PINGs in
//! order, so each PONG pops the oldest mark, and every pending flush whose
//! target is at or below that mark's position is resolved.

use crate::bridge::Completer;
use crate::error::{ClientError, ClientResult};
use std::collections::VecDeque;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingMark {
    /// Highest frame sequence number ahead of the PING in the write stream
    pub covers: u64,
    /// When the PING reached the socket; `None` while still staged
    pub written_at: Option<Instant>,
}

#[derive(Debug)]
struct PendingFlush {
    target: u64,
    completer: Completer<ClientResult<()>>,
}

#[derive(Debug, Default)]
pub struct FlushTracker {
    pending: Vec<PendingFlush>,
    marks: VecDeque<PingMark>,
    highest_marked: u64,
}

impl FlushTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, target: u64, completer: Completer<ClientResult<()>>) {
        self.pending.push(PendingFlush { target, completer });
    }

    /// Whether a flush target is staged but not yet covered by any PING
    pub fn needs_ping(&self, highest_staged: u64) -> bool {
        self.pending
            .iter()
            .any(|flush| flush.target > self.highest_marked && flush.target <= highest_staged)
    }

    /// Record a PING that was just staged behind frame `covers`
    pub fn ping_staged(&mut self, covers: u64) {
        self.highest_marked = self.highest_marked.max(covers);
        self.marks.push_back(PingMark {
            covers,
            written_at: None,
        });
    }

    /// Stamp the oldest `count` unwritten marks as written
    pub fn pings_written(&mut self, count: usize, now: Instant) {
        self.marks
            .iter_mut()
            .filter(|mark| mark.written_at.is_none())
            .take(count)
            .for_each(|mark| mark.written_at = Some(now));
    }

    /// Match a PONG against the oldest outstanding PING
    pub fn on_pong(&mut self) -> Option<u64> {
        self.marks.pop_front().map(|mark| mark.covers)
    }

    /// Resolve every flush with target <= `covers`; returns how many resolved
    pub fn resolve_upto(&mut self, covers: u64) -> usize {
        let (done, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|flush| flush.target <= covers);
        self.pending = waiting;
        let resolved = done.len();
        for flush in done {
            flush.completer.complete(Ok(()));
        }
        resolved
    }

    /// Forget flushes whose callers stopped waiting
    ///
    /// Their frames were already enqueued and still go out.
    pub fn prune_abandoned(&mut self) -> usize {
        let before = self.pending.len();
        self.pending.retain(|flush| !flush.completer.is_abandoned());
        before - self.pending.len()
    }

    pub fn outstanding_pings(&self) -> usize {
        self.marks.len()
    }

    /// Send time of the oldest PING still waiting for its PONG
    pub fn oldest_unanswered(&self) -> Option<Instant> {
        self.marks.front().and_then(|mark| mark.written_at)
    }

    /// PINGs die with the socket; flushes wait for the next connection
    pub fn on_disconnect(&mut self, acked: u64) {
        self.marks.clear();
        self.highest_marked = acked;
    }

    pub fn fail_all(&mut self, error: &ClientError) {
        for flush in self.pending.drain(..) {
            flush.completer.complete(Err(error.clone()));
        }
        self.marks.clear();
    }
}
