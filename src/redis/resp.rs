/// RESP framing: request encoding and a streaming reply decoder
///
/// The decoder is a resumable cursor over one reply. It never buffers a bulk
/// payload; payload bytes are handed back as soon as they arrive, and only
/// header lines are accumulated across chunk boundaries.
use super::redirect::{RedirectParser, RedirectType};
use crate::error::GatewayError;
use bytes::{BufMut, Bytes, BytesMut};

/// RESP data types
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple String (+OK\r\n)
    SimpleString(String),
    /// Error (-ERR message\r\n)
    Error(String),
    /// Integer (:123\r\n)
    Integer(i64),
    /// Bulk String ($5\r\nhello\r\n), `None` is the nil bulk
    BulkString(Option<Bytes>),
    /// Array (*2\r\n...), `None` is the nil array
    Array(Option<Vec<RespValue>>),
}

/// RESP encoder for writing Redis protocol messages
pub struct RespEncoder;

impl RespEncoder {
    pub fn encode(value: &RespValue) -> Bytes {
        let mut buf = BytesMut::new();
        Self::encode_into(&mut buf, value);
        buf.freeze()
    }

    pub fn encode_into(buf: &mut BytesMut, value: &RespValue) {
        match value {
            RespValue::SimpleString(s) => Self::put_line(buf, b'+', s.as_bytes()),
            RespValue::Error(s) => Self::put_line(buf, b'-', s.as_bytes()),
            RespValue::Integer(n) => Self::put_line(buf, b':', n.to_string().as_bytes()),
            RespValue::BulkString(Some(data)) => Self::put_bulk(buf, data),
            RespValue::BulkString(None) => buf.put_slice(b"$-1\r\n"),
            RespValue::Array(Some(elements)) => {
                Self::put_line(buf, b'*', elements.len().to_string().as_bytes());
                for element in elements {
                    Self::encode_into(buf, element);
                }
            }
            RespValue::Array(None) => buf.put_slice(b"*-1\r\n"),
        }
    }

    /// Encode a command as a multi-bulk array of its parts
    pub fn encode_command<'a, I>(parts: I) -> Bytes
    where
        I: IntoIterator<Item = &'a [u8]>,
        I::IntoIter: ExactSizeIterator,
    {
        let parts = parts.into_iter();
        let mut buf = BytesMut::with_capacity(16 + parts.len() * 16);
        Self::put_line(&mut buf, b'*', parts.len().to_string().as_bytes());
        for part in parts {
            Self::put_bulk(&mut buf, part);
        }
        buf.freeze()
    }

    /// Create a Redis command from command name and arguments
    pub fn create_command(command: &str, args: &[&str]) -> RespValue {
        let mut elements = vec![RespValue::BulkString(Some(Bytes::copy_from_slice(
            command.as_bytes(),
        )))];
        for arg in args {
            elements.push(RespValue::BulkString(Some(Bytes::copy_from_slice(
                arg.as_bytes(),
            ))));
        }
        RespValue::Array(Some(elements))
    }

    fn put_line(buf: &mut BytesMut, tag: u8, body: &[u8]) {
        buf.put_u8(tag);
        buf.put_slice(body);
        buf.put_slice(b"\r\n");
    }

    fn put_bulk(buf: &mut BytesMut, data: &[u8]) {
        Self::put_line(buf, b'$', data.len().to_string().as_bytes());
        buf.put_slice(data);
        buf.put_slice(b"\r\n");
    }
}

/// Framing errors while decoding a reply
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RespError {
    #[error("Unknown reply type byte 0x{0:02x}")]
    UnknownType(u8),
    #[error("Header line not terminated by CRLF")]
    MissingCrlf,
    #[error("Invalid length: {0}")]
    InvalidLength(String),
    #[error("Invalid integer reply: {0}")]
    InvalidInteger(String),
    #[error("Header line longer than {0} bytes")]
    LineTooLong(usize),
    #[error("Reply nested deeper than {0} levels")]
    TooDeep(usize),
    #[error("{0} unexpected bytes after a complete reply")]
    TrailingData(usize),
}

impl From<RespError> for GatewayError {
    fn from(e: RespError) -> Self {
        GatewayError::desync(e.to_string())
    }
}

/// Top-level shape of a reply, known once its first line is decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Status,
    Integer,
    Bulk,
    Array,
    Nil,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyHead {
    pub kind: ReplyKind,
    /// Total body length when the first line determines it
    pub content_length: Option<u64>,
}

/// Output produced while decoding, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emit {
    Head(ReplyHead),
    Body(Bytes),
}

/// Where decoding stands after a `feed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    NeedMore,
    Complete,
    Redirect(RedirectType),
    /// The node answered with an application error
    Error(String),
}

#[derive(Debug)]
pub struct Feed {
    /// Bytes of the chunk that belonged to this reply
    pub consumed: usize,
    pub status: FeedStatus,
    pub emitted: Vec<Emit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    /// Accumulating a type-tagged line
    Header,
    Bulk { remaining: u64 },
    Crlf { matched: u8 },
}

/// Resumable parse cursor
#[derive(Debug, Clone)]
pub struct DecoderState {
    consumed: u64,
    pending: Pending,
    /// Elements still expected by each open array, innermost last
    frames: Vec<u64>,
    outcome: Option<FeedStatus>,
}

impl DecoderState {
    fn new() -> Self {
        Self {
            consumed: 0,
            pending: Pending::Header,
            frames: Vec::new(),
            outcome: None,
        }
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn is_done(&self) -> bool {
        self.outcome.is_some()
    }
}

pub const MAX_LINE: usize = 64 * 1024;
pub const MAX_DEPTH: usize = 32;

/// Streaming decoder for exactly one reply
#[derive(Debug)]
pub struct ReplyDecoder {
    state: DecoderState,
    line: BytesMut,
}

impl Default for ReplyDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyDecoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::new(),
            line: BytesMut::with_capacity(64),
        }
    }

    pub fn state(&self) -> &DecoderState {
        &self.state
    }

    /// Feed the next chunk received from the node.
    ///
    /// Decoding stops at the end of the reply; `consumed` tells how much of
    /// the chunk that was. A chunk may end anywhere, including inside a
    /// length prefix or a payload.
    pub fn feed(&mut self, chunk: &Bytes) -> Result<Feed, RespError> {
        let mut emitted = Vec::new();

        if self.state.is_done() {
            return Err(RespError::TrailingData(chunk.len()));
        }

        let mut pos = 0;
        while pos < chunk.len() && !self.state.is_done() {
            match self.state.pending {
                Pending::Header => {
                    let rest = &chunk[pos..];
                    match rest.iter().position(|&b| b == b'\n') {
                        Some(i) => {
                            self.line.extend_from_slice(&rest[..=i]);
                            pos += i + 1;
                            let line = self.line.split().freeze();
                            self.on_line(line, &mut emitted)?;
                        }
                        None => {
                            self.line.extend_from_slice(rest);
                            pos = chunk.len();
                        }
                    }
                    if self.line.len() > MAX_LINE {
                        return Err(RespError::LineTooLong(MAX_LINE));
                    }
                }
                Pending::Bulk { remaining } => {
                    let available = (chunk.len() - pos) as u64;
                    let n = remaining.min(available) as usize;
                    emitted.push(Emit::Body(chunk.slice(pos..pos + n)));
                    pos += n;
                    let remaining = remaining - n as u64;
                    self.state.pending = if remaining == 0 {
                        Pending::Crlf { matched: 0 }
                    } else {
                        Pending::Bulk { remaining }
                    };
                }
                Pending::Crlf { matched } => {
                    if chunk[pos] != b"\r\n"[matched as usize] {
                        return Err(RespError::MissingCrlf);
                    }
                    pos += 1;
                    if matched == 0 {
                        self.state.pending = Pending::Crlf { matched: 1 };
                    } else {
                        self.state.pending = Pending::Header;
                        if !self.state.frames.is_empty() {
                            emitted.push(Emit::Body(Bytes::from_static(b"\n")));
                        }
                        self.element_done();
                    }
                }
            }
        }

        self.state.consumed += pos as u64;
        Ok(Feed {
            consumed: pos,
            status: self.state.outcome.clone().unwrap_or(FeedStatus::NeedMore),
            emitted,
        })
    }

    fn on_line(&mut self, line: Bytes, emitted: &mut Vec<Emit>) -> Result<(), RespError> {
        let len = line.len();
        if len < 3 || line[len - 2] != b'\r' {
            return Err(RespError::MissingCrlf);
        }
        let tag = line[0];
        let body = line.slice(1..len - 2);
        let top_level = self.state.frames.is_empty();

        match tag {
            b'-' if top_level => {
                let status = match RedirectParser::parse_redirect_bytes(&body) {
                    Some(redirect) => FeedStatus::Redirect(redirect),
                    None => FeedStatus::Error(String::from_utf8_lossy(&body).into_owned()),
                };
                self.state.outcome = Some(status);
            }
            b'+' | b':' | b'-' => {
                if tag == b':' && btoi::btoi::<i64>(&body).is_err() {
                    return Err(RespError::InvalidInteger(
                        String::from_utf8_lossy(&body).into_owned(),
                    ));
                }
                if top_level {
                    let kind = if tag == b':' {
                        ReplyKind::Integer
                    } else {
                        ReplyKind::Status
                    };
                    emitted.push(Emit::Head(ReplyHead {
                        kind,
                        content_length: Some(body.len() as u64),
                    }));
                    emitted.push(Emit::Body(body));
                } else {
                    emitted.push(Emit::Body(body));
                    emitted.push(Emit::Body(Bytes::from_static(b"\n")));
                }
                self.element_done();
            }
            b'$' => match Self::parse_length(&body)? {
                None => self.nil(top_level, emitted),
                Some(n) => {
                    if top_level {
                        emitted.push(Emit::Head(ReplyHead {
                            kind: ReplyKind::Bulk,
                            content_length: Some(n),
                        }));
                    }
                    self.state.pending = if n == 0 {
                        Pending::Crlf { matched: 0 }
                    } else {
                        Pending::Bulk { remaining: n }
                    };
                }
            },
            b'*' => match Self::parse_length(&body)? {
                None => self.nil(top_level, emitted),
                Some(n) => {
                    if top_level {
                        emitted.push(Emit::Head(ReplyHead {
                            kind: ReplyKind::Array,
                            content_length: None,
                        }));
                    }
                    if n == 0 {
                        self.element_done();
                    } else {
                        if self.state.frames.len() >= MAX_DEPTH {
                            return Err(RespError::TooDeep(MAX_DEPTH));
                        }
                        self.state.frames.push(n);
                    }
                }
            },
            other => return Err(RespError::UnknownType(other)),
        }
        Ok(())
    }

    /// Nil at the top is its own reply kind; inside an array it is an empty line
    fn nil(&mut self, top_level: bool, emitted: &mut Vec<Emit>) {
        if top_level {
            emitted.push(Emit::Head(ReplyHead {
                kind: ReplyKind::Nil,
                content_length: Some(0),
            }));
        } else {
            emitted.push(Emit::Body(Bytes::from_static(b"\n")));
        }
        self.element_done();
    }

    /// One element finished; close every array it completes
    fn element_done(&mut self) {
        loop {
            match self.state.frames.last_mut() {
                None => {
                    self.state.outcome = Some(FeedStatus::Complete);
                    return;
                }
                Some(remaining) => {
                    *remaining -= 1;
                    if *remaining > 0 {
                        return;
                    }
                    self.state.frames.pop();
                }
            }
        }
    }

    /// `None` for the nil length -1
    fn parse_length(body: &[u8]) -> Result<Option<u64>, RespError> {
        match btoi::btoi::<i64>(body) {
            Ok(-1) => Ok(None),
            Ok(n) if n >= 0 => Ok(Some(n as u64)),
            _ => Err(RespError::InvalidLength(
                String::from_utf8_lossy(body).into_owned(),
            )),
        }
    }
}

/// Decode one reply from a complete buffer into its head and concatenated body
pub fn decode_complete(data: &[u8]) -> Result<(FeedStatus, Option<ReplyHead>, Bytes), RespError> {
    let mut decoder = ReplyDecoder::new();
    let feed = decoder.feed(&Bytes::copy_from_slice(data))?;
    if feed.consumed != data.len() {
        return Err(RespError::TrailingData(data.len() - feed.consumed));
    }
    let (head, body) = collect(feed.emitted);
    Ok((feed.status, head, body))
}

/// Fold emitted items into the head and the body bytes
pub fn collect(emitted: Vec<Emit>) -> (Option<ReplyHead>, Bytes) {
    let mut head = None;
    let mut body = BytesMut::new();
    for item in emitted {
        match item {
            Emit::Head(h) => head = Some(h),
            Emit::Body(b) => body.extend_from_slice(&b),
        }
    }
    (head, body.freeze())
}
