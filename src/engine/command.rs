use crate::bridge::Completer;
use crate::error::ClientResult;

/// Requests from caller threads to the engine
///
/// Frames never travel through this channel; they go through the outbound
/// buffer so their sequence numbers match wire order.
#[derive(Debug)]
pub enum Command {
    /// Resolve once every frame up to `target` is acknowledged by a PONG
    Flush {
        target: u64,
        completer: Completer<ClientResult<()>>,
    },
    Close,
}
