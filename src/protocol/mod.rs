//! NATS wire protocol: payload types, framing codec and subject rules

pub mod codec;
pub mod messages;
pub mod subject;

pub use codec::{ClientOp, CodecError, Decoded, ServerOp, StreamDecoder};
pub use messages::{ConnectInfo, HeaderMap, Message, ServerInfo};
pub use subject::{subject_matches, SubjectError};
