//! Wire codec for the NATS text protocol
//!
//! Frames are CRLF-terminated control lines, optionally followed by a payload of
//! an announced length and another CRLF. Both directions are covered so the same
//! codec drives the client engine and the in-process test server.
//!
//! Decoding is resumable: [`StreamDecoder`] keeps the unconsumed residue between
//! reads, and a frame split across any number of reads decodes exactly like the
//! same bytes delivered in one chunk.

use super::messages::{ConnectInfo, HeaderMap, ServerInfo};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::marker::PhantomData;
use thiserror::Error;

/// Longest control line accepted before the frame is rejected
pub const MAX_CONTROL_LINE: usize = 4096;

const CRLF: &[u8] = b"\r\n";

/// Codec failures. Every variant is a protocol violation on the connection.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CodecError {
    #[error("unknown protocol operation: {0}")]
    UnknownOp(String),
    #[error("malformed {op} arguments: {line}")]
    MalformedArgs { op: &'static str, line: String },
    #[error("invalid decimal field: {0}")]
    InvalidNumber(String),
    #[error("payload of {size} bytes exceeds negotiated maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("payload not terminated by CRLF")]
    MissingTerminator,
    #[error("control line exceeds {0} bytes")]
    ControlLineTooLong(usize),
    #[error("invalid JSON body: {0}")]
    InvalidJson(String),
    #[error("control line is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid header block: {0}")]
    InvalidHeaders(String),
}

/// Outcome of a single decode attempt
#[derive(Debug, PartialEq)]
pub enum Decoded<T> {
    /// A complete frame and the number of bytes it occupied
    Frame(T, usize),
    NeedMoreData,
}

/// Operations sent by a client
#[derive(Debug, Clone, PartialEq)]
pub enum ClientOp {
    Connect(Box<ConnectInfo>),
    Pub {
        subject: String,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        payload: Bytes,
    },
    Sub {
        subject: String,
        queue_group: Option<String>,
        sid: u64,
    },
    Unsub {
        sid: u64,
        max: Option<u64>,
    },
    Ping,
    Pong,
}

/// Operations sent by a server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerOp {
    Info(Box<ServerInfo>),
    Msg {
        subject: String,
        sid: u64,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        status: Option<u16>,
        description: Option<String>,
        payload: Bytes,
    },
    Ping,
    Pong,
    Ok,
    Err(String),
}

/// A frame type that can be decoded from a byte prefix
pub trait Frame: Sized {
    fn decode(buf: &[u8], max_payload: usize) -> Result<Decoded<Self>, CodecError>;
}

impl Frame for ServerOp {
    fn decode(buf: &[u8], max_payload: usize) -> Result<Decoded<Self>, CodecError> {
        decode_server_op(buf, max_payload)
    }
}

impl Frame for ClientOp {
    fn decode(buf: &[u8], max_payload: usize) -> Result<Decoded<Self>, CodecError> {
        decode_client_op(buf, max_payload)
    }
}

/// Resumable decoder holding the residue of partial reads
#[derive(Debug)]
pub struct StreamDecoder<F: Frame> {
    buffer: BytesMut,
    max_payload: usize,
    _frame: PhantomData<F>,
}

impl<F: Frame> StreamDecoder<F> {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            max_payload,
            _frame: PhantomData,
        }
    }

    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload;
    }

    /// Append freshly read bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Direct access for `read_buf`-style reads into the residue
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    pub fn residual_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Decode the next complete frame, if one is buffered
    pub fn next_frame(&mut self) -> Result<Option<F>, CodecError> {
        match F::decode(&self.buffer, self.max_payload)? {
            Decoded::Frame(frame, consumed) => {
                self.buffer.advance(consumed);
                Ok(Some(frame))
            }
            Decoded::NeedMoreData => Ok(None),
        }
    }
}

// ----- encoding -----

fn put_decimal(buf: &mut BytesMut, mut value: u64) {
    let mut digits = [0u8; 20];
    let mut pos = digits.len();
    loop {
        pos -= 1;
        digits[pos] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    buf.put_slice(&digits[pos..]);
}

/// Encode `PUB` or `HPUB` straight from borrowed parts (publish hot path)
pub fn encode_pub(
    buf: &mut BytesMut,
    subject: &str,
    reply: Option<&str>,
    headers: Option<&HeaderMap>,
    payload: &[u8],
) {
    let header_block = headers.map(HeaderMap::to_block);
    let header_len = header_block.as_ref().map_or(0, Vec::len);
    buf.reserve(subject.len() + reply.map_or(0, str::len) + header_len + payload.len() + 32);

    if header_block.is_some() {
        buf.put_slice(b"HPUB ");
    } else {
        buf.put_slice(b"PUB ");
    }
    buf.put_slice(subject.as_bytes());
    buf.put_u8(b' ');
    if let Some(reply) = reply {
        buf.put_slice(reply.as_bytes());
        buf.put_u8(b' ');
    }
    if let Some(block) = &header_block {
        put_decimal(buf, block.len() as u64);
        buf.put_u8(b' ');
        put_decimal(buf, (block.len() + payload.len()) as u64);
        buf.put_slice(CRLF);
        buf.put_slice(block);
    } else {
        put_decimal(buf, payload.len() as u64);
        buf.put_slice(CRLF);
    }
    buf.put_slice(payload);
    buf.put_slice(CRLF);
}

pub fn encode_sub(buf: &mut BytesMut, subject: &str, queue_group: Option<&str>, sid: u64) {
    buf.put_slice(b"SUB ");
    buf.put_slice(subject.as_bytes());
    buf.put_u8(b' ');
    if let Some(queue) = queue_group {
        buf.put_slice(queue.as_bytes());
        buf.put_u8(b' ');
    }
    put_decimal(buf, sid);
    buf.put_slice(CRLF);
}

pub fn encode_unsub(buf: &mut BytesMut, sid: u64, max: Option<u64>) {
    buf.put_slice(b"UNSUB ");
    put_decimal(buf, sid);
    if let Some(max) = max {
        buf.put_u8(b' ');
        put_decimal(buf, max);
    }
    buf.put_slice(CRLF);
}

impl ClientOp {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        match self {
            ClientOp::Connect(info) => {
                let json = serde_json::to_vec(info.as_ref())
                    .map_err(|e| CodecError::InvalidJson(e.to_string()))?;
                buf.put_slice(b"CONNECT ");
                buf.put_slice(&json);
                buf.put_slice(CRLF);
            }
            ClientOp::Pub {
                subject,
                reply,
                headers,
                payload,
            } => encode_pub(buf, subject, reply.as_deref(), headers.as_ref(), payload),
            ClientOp::Sub {
                subject,
                queue_group,
                sid,
            } => encode_sub(buf, subject, queue_group.as_deref(), *sid),
            ClientOp::Unsub { sid, max } => encode_unsub(buf, *sid, *max),
            ClientOp::Ping => buf.put_slice(b"PING\r\n"),
            ClientOp::Pong => buf.put_slice(b"PONG\r\n"),
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

impl ServerOp {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        match self {
            ServerOp::Info(info) => {
                let json = serde_json::to_vec(info.as_ref())
                    .map_err(|e| CodecError::InvalidJson(e.to_string()))?;
                buf.put_slice(b"INFO ");
                buf.put_slice(&json);
                buf.put_slice(CRLF);
            }
            ServerOp::Msg {
                subject,
                sid,
                reply,
                headers,
                status,
                description,
                payload,
            } => {
                let header_block = match (headers, status) {
                    (None, None) => None,
                    _ => Some(status_header_block(
                        headers.as_ref(),
                        *status,
                        description.as_deref(),
                    )),
                };
                let op: &[u8] = if header_block.is_some() { b"HMSG " } else { b"MSG " };
                buf.put_slice(op);
                buf.put_slice(subject.as_bytes());
                buf.put_u8(b' ');
                put_decimal(buf, *sid);
                buf.put_u8(b' ');
                if let Some(reply) = reply {
                    buf.put_slice(reply.as_bytes());
                    buf.put_u8(b' ');
                }
                if let Some(block) = &header_block {
                    put_decimal(buf, block.len() as u64);
                    buf.put_u8(b' ');
                    put_decimal(buf, (block.len() + payload.len()) as u64);
                    buf.put_slice(CRLF);
                    buf.put_slice(block);
                } else {
                    put_decimal(buf, payload.len() as u64);
                    buf.put_slice(CRLF);
                }
                buf.put_slice(payload);
                buf.put_slice(CRLF);
            }
            ServerOp::Ping => buf.put_slice(b"PING\r\n"),
            ServerOp::Pong => buf.put_slice(b"PONG\r\n"),
            ServerOp::Ok => buf.put_slice(b"+OK\r\n"),
            ServerOp::Err(reason) => {
                buf.put_slice(b"-ERR '");
                buf.put_slice(reason.as_bytes());
                buf.put_slice(b"'\r\n");
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

fn status_header_block(
    headers: Option<&HeaderMap>,
    status: Option<u16>,
    description: Option<&str>,
) -> Vec<u8> {
    let block = headers.cloned().unwrap_or_default().to_block();
    match status {
        None => block,
        Some(code) => {
            let mut line = format!("NATS/1.0 {code}");
            if let Some(desc) = description {
                line.push(' ');
                line.push_str(desc);
            }
            let mut out = line.into_bytes();
            out.extend_from_slice(&block[super::messages::HEADER_VERSION_LINE.len()..]);
            out
        }
    }
}

// ----- decoding -----

struct ControlLine<'a> {
    op: String,
    args: Vec<&'a str>,
    raw: &'a str,
    /// Bytes occupied by the control line including CRLF
    len: usize,
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == CRLF)
}

fn read_control_line(buf: &[u8]) -> Result<Option<ControlLine<'_>>, CodecError> {
    let end = match find_crlf(buf) {
        Some(end) => end,
        None if buf.len() > MAX_CONTROL_LINE => {
            return Err(CodecError::ControlLineTooLong(MAX_CONTROL_LINE))
        }
        None => return Ok(None),
    };
    if end > MAX_CONTROL_LINE {
        return Err(CodecError::ControlLineTooLong(MAX_CONTROL_LINE));
    }

    let raw = std::str::from_utf8(&buf[..end]).map_err(|_| CodecError::InvalidUtf8)?;
    let mut parts = raw.split_ascii_whitespace();
    let op = parts.next().unwrap_or_default().to_ascii_uppercase();
    Ok(Some(ControlLine {
        op,
        args: parts.collect(),
        raw,
        len: end + 2,
    }))
}

/// Parse an ASCII-decimal field; no sign, no whitespace
pub fn parse_decimal(field: &str) -> Result<u64, CodecError> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CodecError::InvalidNumber(field.to_string()));
    }
    field
        .parse::<u64>()
        .map_err(|_| CodecError::InvalidNumber(field.to_string()))
}

fn parse_size(field: &str) -> Result<usize, CodecError> {
    usize::try_from(parse_decimal(field)?).map_err(|_| CodecError::InvalidNumber(field.to_string()))
}

/// Payload following a control line: `Some((payload, total_frame_len))` when complete
fn read_payload(
    buf: &[u8],
    line_len: usize,
    size: usize,
    max_payload: usize,
) -> Result<Option<(&[u8], usize)>, CodecError> {
    if size > max_payload {
        return Err(CodecError::PayloadTooLarge {
            size,
            max: max_payload,
        });
    }
    let total = line_len + size + 2;
    if buf.len() < total {
        return Ok(None);
    }
    if &buf[line_len + size..total] != CRLF {
        return Err(CodecError::MissingTerminator);
    }
    Ok(Some((&buf[line_len..line_len + size], total)))
}

fn json_body<'a>(raw: &'a str, op: &str) -> &'a str {
    raw.get(op.len()..).unwrap_or_default().trim()
}

fn split_headers(
    body: &[u8],
    header_len: usize,
) -> Result<(HeaderMap, Option<u16>, Option<String>, Bytes), CodecError> {
    let (headers, status, description) =
        HeaderMap::parse_block(&body[..header_len]).map_err(CodecError::InvalidHeaders)?;
    Ok((
        headers,
        status,
        description,
        Bytes::copy_from_slice(&body[header_len..]),
    ))
}

/// Decode one server operation from the front of `buf`
pub fn decode_server_op(buf: &[u8], max_payload: usize) -> Result<Decoded<ServerOp>, CodecError> {
    let Some(line) = read_control_line(buf)? else {
        return Ok(Decoded::NeedMoreData);
    };

    let malformed = |op: &'static str| CodecError::MalformedArgs {
        op,
        line: line.raw.to_string(),
    };

    match line.op.as_str() {
        "MSG" => {
            let (subject, sid, reply, size) = match line.args.as_slice() {
                [subject, sid, size] => (*subject, *sid, None, *size),
                [subject, sid, reply, size] => (*subject, *sid, Some(*reply), *size),
                _ => return Err(malformed("MSG")),
            };
            let sid = parse_decimal(sid)?;
            let size = parse_size(size)?;
            match read_payload(buf, line.len, size, max_payload)? {
                Some((payload, total)) => Ok(Decoded::Frame(
                    ServerOp::Msg {
                        subject: subject.to_string(),
                        sid,
                        reply: reply.map(str::to_string),
                        headers: None,
                        status: None,
                        description: None,
                        payload: Bytes::copy_from_slice(payload),
                    },
                    total,
                )),
                None => Ok(Decoded::NeedMoreData),
            }
        }
        "HMSG" => {
            let (subject, sid, reply, header_len, size) = match line.args.as_slice() {
                [subject, sid, hdr, size] => (*subject, *sid, None, *hdr, *size),
                [subject, sid, reply, hdr, size] => (*subject, *sid, Some(*reply), *hdr, *size),
                _ => return Err(malformed("HMSG")),
            };
            let sid = parse_decimal(sid)?;
            let header_len = parse_size(header_len)?;
            let size = parse_size(size)?;
            if header_len > size {
                return Err(malformed("HMSG"));
            }
            match read_payload(buf, line.len, size, max_payload)? {
                Some((body, total)) => {
                    let (headers, status, description, payload) = split_headers(body, header_len)?;
                    Ok(Decoded::Frame(
                        ServerOp::Msg {
                            subject: subject.to_string(),
                            sid,
                            reply: reply.map(str::to_string),
                            headers: Some(headers),
                            status,
                            description,
                            payload,
                        },
                        total,
                    ))
                }
                None => Ok(Decoded::NeedMoreData),
            }
        }
        "PING" => Ok(Decoded::Frame(ServerOp::Ping, line.len)),
        "PONG" => Ok(Decoded::Frame(ServerOp::Pong, line.len)),
        "+OK" => Ok(Decoded::Frame(ServerOp::Ok, line.len)),
        "-ERR" => {
            let reason = json_body(line.raw, "-ERR")
                .trim_matches('\'')
                .to_string();
            Ok(Decoded::Frame(ServerOp::Err(reason), line.len))
        }
        "INFO" => {
            let info: ServerInfo = serde_json::from_str(json_body(line.raw, "INFO"))
                .map_err(|e| CodecError::InvalidJson(e.to_string()))?;
            Ok(Decoded::Frame(ServerOp::Info(Box::new(info)), line.len))
        }
        other => Err(CodecError::UnknownOp(other.to_string())),
    }
}

/// Decode one client operation from the front of `buf`
pub fn decode_client_op(buf: &[u8], max_payload: usize) -> Result<Decoded<ClientOp>, CodecError> {
    let Some(line) = read_control_line(buf)? else {
        return Ok(Decoded::NeedMoreData);
    };

    let malformed = |op: &'static str| CodecError::MalformedArgs {
        op,
        line: line.raw.to_string(),
    };

    match line.op.as_str() {
        "PUB" => {
            let (subject, reply, size) = match line.args.as_slice() {
                [subject, size] => (*subject, None, *size),
                [subject, reply, size] => (*subject, Some(*reply), *size),
                _ => return Err(malformed("PUB")),
            };
            let size = parse_size(size)?;
            match read_payload(buf, line.len, size, max_payload)? {
                Some((payload, total)) => Ok(Decoded::Frame(
                    ClientOp::Pub {
                        subject: subject.to_string(),
                        reply: reply.map(str::to_string),
                        headers: None,
                        payload: Bytes::copy_from_slice(payload),
                    },
                    total,
                )),
                None => Ok(Decoded::NeedMoreData),
            }
        }
        "HPUB" => {
            let (subject, reply, header_len, size) = match line.args.as_slice() {
                [subject, hdr, size] => (*subject, None, *hdr, *size),
                [subject, reply, hdr, size] => (*subject, Some(*reply), *hdr, *size),
                _ => return Err(malformed("HPUB")),
            };
            let header_len = parse_size(header_len)?;
            let size = parse_size(size)?;
            if header_len > size {
                return Err(malformed("HPUB"));
            }
            match read_payload(buf, line.len, size, max_payload)? {
                Some((body, total)) => {
                    let (headers, _, _, payload) = split_headers(body, header_len)?;
                    Ok(Decoded::Frame(
                        ClientOp::Pub {
                            subject: subject.to_string(),
                            reply: reply.map(str::to_string),
                            headers: Some(headers),
                            payload,
                        },
                        total,
                    ))
                }
                None => Ok(Decoded::NeedMoreData),
            }
        }
        "SUB" => {
            let (subject, queue_group, sid) = match line.args.as_slice() {
                [subject, sid] => (*subject, None, *sid),
                [subject, queue, sid] => (*subject, Some(*queue), *sid),
                _ => return Err(malformed("SUB")),
            };
            Ok(Decoded::Frame(
                ClientOp::Sub {
                    subject: subject.to_string(),
                    queue_group: queue_group.map(str::to_string),
                    sid: parse_decimal(sid)?,
                },
                line.len,
            ))
        }
        "UNSUB" => {
            let (sid, max) = match line.args.as_slice() {
                [sid] => (parse_decimal(sid)?, None),
                [sid, max] => (parse_decimal(sid)?, Some(parse_decimal(max)?)),
                _ => return Err(malformed("UNSUB")),
            };
            Ok(Decoded::Frame(ClientOp::Unsub { sid, max }, line.len))
        }
        "CONNECT" => {
            let info: ConnectInfo = serde_json::from_str(json_body(line.raw, "CONNECT"))
                .map_err(|e| CodecError::InvalidJson(e.to_string()))?;
            Ok(Decoded::Frame(ClientOp::Connect(Box::new(info)), line.len))
        }
        "PING" => Ok(Decoded::Frame(ClientOp::Ping, line.len)),
        "PONG" => Ok(Decoded::Frame(ClientOp::Pong, line.len)),
        other => Err(CodecError::UnknownOp(other.to_string())),
    }
}
