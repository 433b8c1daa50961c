//! Routing of decoded server operations

use super::{Engine, SessionEnd};
use crate::error::{sanitize_error_message, ClientError};
use crate::protocol::{Message, ServerOp};
use crate::subscription::DeliveryOutcome;
use bytes::Bytes;
use tracing::{debug, trace, warn};

const PONG: &[u8] = b"PONG\r\n";

/// What a `-ERR` received on an established connection means for it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServerErrorAction {
    /// Denied publish or subscribe; the connection stays up
    Record,
    /// Credentials rejected; retrying cannot help
    Fatal,
    /// The server is closing the connection
    Reconnect,
}

pub(crate) fn classify_server_error(reason: &str) -> ServerErrorAction {
    let reason = reason.to_ascii_lowercase();
    if reason.contains("permissions violation") {
        ServerErrorAction::Record
    } else if reason.contains("authorization violation")
        || reason.contains("authentication expired")
    {
        ServerErrorAction::Fatal
    } else {
        ServerErrorAction::Reconnect
    }
}

impl Engine {
    /// Decode and handle every complete frame in the read buffer
    pub(super) fn process_frames(&mut self) -> Option<SessionEnd> {
        loop {
            match self.decoder.next_frame() {
                Ok(Some(op)) => {
                    if let Some(end) = self.handle_server_op(op) {
                        return Some(end);
                    }
                }
                Ok(None) => return None,
                Err(e) => {
                    warn!(error = %e, "malformed frame from server");
                    return Some(SessionEnd::Fatal(ClientError::from(e)));
                }
            }
        }
    }

    fn handle_server_op(&mut self, op: ServerOp) -> Option<SessionEnd> {
        match op {
            ServerOp::Msg {
                subject,
                sid,
                reply,
                headers,
                status,
                description,
                payload,
            } => {
                self.shared.statistics.message_received(payload.len());
                let message = Message {
                    subject,
                    reply,
                    payload,
                    headers,
                    status,
                    description,
                    sid,
                };
                match self.shared.subscriptions.deliver(message) {
                    DeliveryOutcome::Delivered => {}
                    DeliveryOutcome::Dropped => {
                        self.shared.statistics.message_dropped();
                        debug!(sid, "subscription queue full, message dropped");
                    }
                    DeliveryOutcome::Unknown => trace!(sid, "message for inactive subscription"),
                }
            }
            ServerOp::Ping => self.writer.stage_internal(Bytes::from_static(PONG)),
            ServerOp::Pong => {
                self.shared.statistics.pong_received();
                if let Some(covers) = self.flushes.on_pong() {
                    self.shared.acknowledge(covers);
                    self.writer.acknowledge(covers);
                    self.flushes.prune_abandoned();
                    let resolved = self.flushes.resolve_upto(covers);
                    if resolved > 0 {
                        trace!(covers, resolved, "flushes acknowledged");
                    }
                }
            }
            ServerOp::Ok => {}
            ServerOp::Info(info) => {
                debug!(max_payload = info.max_payload, "server sent updated INFO");
                self.decoder.set_max_payload(info.max_payload);
                self.shared.set_server_info(*info);
            }
            ServerOp::Err(reason) => {
                self.shared.statistics.server_error(&reason);
                let sanitized = sanitize_error_message(&reason);
                match classify_server_error(&reason) {
                    ServerErrorAction::Record => {
                        warn!(reason = %sanitized, "server denied an operation");
                        self.shared.state.notify();
                    }
                    ServerErrorAction::Fatal => {
                        return Some(SessionEnd::Fatal(ClientError::connection(reason)));
                    }
                    ServerErrorAction::Reconnect => {
                        return Some(SessionEnd::Lost(format!("server error: {sanitized}")));
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_server_error() {
        assert_eq!(
            classify_server_error("Permissions Violation for Publish to \"secret\""),
            ServerErrorAction::Record
        );
        assert_eq!(
            classify_server_error("Authorization Violation"),
            ServerErrorAction::Fatal
        );
        assert_eq!(
            classify_server_error("User Authentication Expired"),
            ServerErrorAction::Fatal
        );
        assert_eq!(
            classify_server_error("Stale Connection"),
            ServerErrorAction::Reconnect
        );
        assert_eq!(
            classify_server_error("Maximum Payload Violation"),
            ServerErrorAction::Reconnect
        );
    }
}
