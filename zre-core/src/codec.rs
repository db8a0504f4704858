//! Binary codec for the data protocol (HELLO..PING_OK) and the LOG side channel.
//!
//! Frame 1 layout: `signature[2 BE] | type[1] | version[1] | fields...`.
//! WHISPER and SHOUT carry their payload as a second frame.

use std::collections::BTreeMap;

use crate::protocol::{
    Frame, LogEvent, LogLevel, LogMessage, MessageKind, ZreMessage, DATA_SIGNATURE,
    LOG_SIGNATURE, PROTOCOL_VERSION,
};
use crate::wire::MAX_FRAME_LEN;

/// Type id of the only log protocol message.
const LOG_MESSAGE_ID: u8 = 1;

/// Error encoding a message.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("string field is {0} bytes, limit is 65535")]
    StringTooLong(usize),
    #[error("header key {0:?} contains '='")]
    HeaderKey(String),
    #[error("frame is {0} bytes, limit is 16 MiB")]
    FrameTooLarge(usize),
}

/// Error decoding a message. `Signature` means the frame belongs to another
/// protocol and should be skipped quietly.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("no frames")]
    Empty,
    #[error("signature mismatch: {0:#06x}")]
    Signature(u16),
    #[error("unknown message id {0}")]
    UnknownId(u8),
    #[error("unsupported version {0}")]
    Version(u8),
    #[error("truncated frame")]
    Truncated,
    #[error("invalid utf-8 in string field")]
    Utf8,
    #[error("malformed header entry {0:?}")]
    Header(String),
    #[error("missing content frame for {0}")]
    MissingContent(MessageKind),
    #[error("unknown log {field} code {code}")]
    LogCode { field: &'static str, code: u8 },
}

/// Encode a data message into its wire frames.
pub fn encode(msg: &ZreMessage) -> Result<Vec<Frame>, EncodeError> {
    let mut w = Writer::new(DATA_SIGNATURE, msg.kind().id());
    w.put_u8(PROTOCOL_VERSION);
    w.put_u16(msg.sequence());
    let content = match msg {
        ZreMessage::Hello {
            endpoint,
            groups,
            status,
            name,
            headers,
            ..
        } => {
            w.put_string(endpoint)?;
            w.put_strings(groups)?;
            w.put_u8(*status);
            w.put_string(name)?;
            w.put_headers(headers)?;
            None
        }
        ZreMessage::Whisper { content, .. } => Some(content),
        ZreMessage::Shout { group, content, .. } => {
            w.put_string(group)?;
            Some(content)
        }
        ZreMessage::Join { group, status, .. } | ZreMessage::Leave { group, status, .. } => {
            w.put_string(group)?;
            w.put_u8(*status);
            None
        }
        ZreMessage::Ping { .. } | ZreMessage::PingOk { .. } => None,
    };
    let mut frames = vec![w.finish()];
    if let Some(content) = content {
        frames.push(content.clone());
    }
    if let Some(frame) = frames.iter().find(|f| f.len() > MAX_FRAME_LEN as usize) {
        return Err(EncodeError::FrameTooLarge(frame.len()));
    }
    Ok(frames)
}

/// Decode a data message from its frames.
pub fn decode(frames: &[Frame]) -> Result<ZreMessage, DecodeError> {
    let (first, rest) = frames.split_first().ok_or(DecodeError::Empty)?;
    let mut r = Reader::new(first);
    let signature = r.get_u16()?;
    if signature != DATA_SIGNATURE {
        return Err(DecodeError::Signature(signature));
    }
    let id = r.get_u8()?;
    let kind = MessageKind::from_id(id).ok_or(DecodeError::UnknownId(id))?;
    let version = r.get_u8()?;
    if version != PROTOCOL_VERSION {
        return Err(DecodeError::Version(version));
    }
    let sequence = r.get_u16()?;
    let content = || {
        rest.first()
            .cloned()
            .ok_or(DecodeError::MissingContent(kind))
    };
    let msg = match kind {
        MessageKind::Hello => ZreMessage::Hello {
            sequence,
            endpoint: r.get_string()?,
            groups: r.get_strings()?,
            status: r.get_u8()?,
            name: r.get_string()?,
            headers: r.get_headers()?,
        },
        MessageKind::Whisper => ZreMessage::Whisper {
            sequence,
            content: content()?,
        },
        MessageKind::Shout => ZreMessage::Shout {
            sequence,
            group: r.get_string()?,
            content: content()?,
        },
        MessageKind::Join => ZreMessage::Join {
            sequence,
            group: r.get_string()?,
            status: r.get_u8()?,
        },
        MessageKind::Leave => ZreMessage::Leave {
            sequence,
            group: r.get_string()?,
            status: r.get_u8()?,
        },
        MessageKind::Ping => ZreMessage::Ping { sequence },
        MessageKind::PingOk => ZreMessage::PingOk { sequence },
    };
    Ok(msg)
}

/// Encode a LOG record into a single frame. The log protocol has no version byte.
pub fn encode_log(msg: &LogMessage) -> Result<Frame, EncodeError> {
    let mut w = Writer::new(LOG_SIGNATURE, LOG_MESSAGE_ID);
    w.put_u8(msg.level.code());
    w.put_u8(msg.event.code());
    w.put_u16(msg.node);
    w.put_u16(msg.peer);
    w.put_u64(msg.time);
    w.put_string(&msg.data)?;
    Ok(w.finish())
}

/// Decode a LOG record.
pub fn decode_log(frame: &[u8]) -> Result<LogMessage, DecodeError> {
    let mut r = Reader::new(frame);
    let signature = r.get_u16()?;
    if signature != LOG_SIGNATURE {
        return Err(DecodeError::Signature(signature));
    }
    let id = r.get_u8()?;
    if id != LOG_MESSAGE_ID {
        return Err(DecodeError::UnknownId(id));
    }
    let level = r.get_u8()?;
    let level = LogLevel::from_code(level).ok_or(DecodeError::LogCode {
        field: "level",
        code: level,
    })?;
    let event = r.get_u8()?;
    let event = LogEvent::from_code(event).ok_or(DecodeError::LogCode {
        field: "event",
        code: event,
    })?;
    Ok(LogMessage {
        level,
        event,
        node: r.get_u16()?,
        peer: r.get_u16()?,
        time: r.get_u64()?,
        data: r.get_string()?,
    })
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new(signature: u16, id: u8) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&signature.to_be_bytes());
        buf.push(id);
        Writer { buf }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_string(&mut self, s: &str) -> Result<(), EncodeError> {
        let len = u16::try_from(s.len()).map_err(|_| EncodeError::StringTooLong(s.len()))?;
        self.put_u16(len);
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }

    fn put_strings(&mut self, items: &[String]) -> Result<(), EncodeError> {
        self.put_u32(items.len() as u32);
        for s in items {
            self.put_string(s)?;
        }
        Ok(())
    }

    fn put_headers(&mut self, headers: &BTreeMap<String, String>) -> Result<(), EncodeError> {
        self.put_u32(headers.len() as u32);
        for (k, v) in headers {
            if k.contains('=') {
                return Err(EncodeError::HeaderKey(k.clone()));
            }
            self.put_string(&format!("{}={}", k, v))?;
        }
        Ok(())
    }

    fn finish(self) -> Frame {
        self.buf
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::Truncated)?;
        let out = self.buf.get(self.pos..end).ok_or(DecodeError::Truncated)?;
        self.pos = end;
        Ok(out)
    }

    fn get_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn get_u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn get_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_u64(&mut self) -> Result<u64, DecodeError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(b))
    }

    fn get_string(&mut self) -> Result<String, DecodeError> {
        let len = self.get_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::Utf8)
    }

    fn get_strings(&mut self) -> Result<Vec<String>, DecodeError> {
        let count = self.get_u32()? as usize;
        // Each entry takes at least its 2-byte length; cap the allocation accordingly.
        let mut out = Vec::with_capacity(count.min(self.remaining() / 2));
        for _ in 0..count {
            out.push(self.get_string()?);
        }
        Ok(out)
    }

    fn get_headers(&mut self) -> Result<BTreeMap<String, String>, DecodeError> {
        let mut out = BTreeMap::new();
        for entry in self.get_strings()? {
            match entry.split_once('=') {
                Some((k, v)) => {
                    out.insert(k.to_string(), v.to_string());
                }
                None => return Err(DecodeError::Header(entry)),
            }
        }
        Ok(out)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}
