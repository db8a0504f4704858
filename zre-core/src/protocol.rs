//! ZRE wire protocol: message types, ids and version constants.

use std::collections::BTreeMap;

/// Data protocol version carried in every data message.
pub const PROTOCOL_VERSION: u8 = 2;

/// Signature prefix shared by the data and log protocols.
pub const SIGNATURE_PREFIX: u16 = 0xAAA0;
/// Signature of the data protocol (`0xAAA0 | 1`).
pub const DATA_SIGNATURE: u16 = SIGNATURE_PREFIX | 1;
/// Signature of the log side-channel protocol (`0xAAA0 | 2`).
pub const LOG_SIGNATURE: u16 = SIGNATURE_PREFIX | 2;

/// A single wire frame. A protocol unit is one frame, or two for WHISPER/SHOUT.
pub type Frame = Vec<u8>;

/// Data channel messages. Sequence numbers are stamped by the sending peer
/// just before transmission; callers construct messages with `sequence: 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZreMessage {
    /// Greet a peer so it can connect back to us. Carries the full presence payload.
    Hello {
        sequence: u16,
        endpoint: String,
        groups: Vec<String>,
        status: u8,
        name: String,
        headers: BTreeMap<String, String>,
    },
    /// Unicast payload to one peer.
    Whisper { sequence: u16, content: Vec<u8> },
    /// Payload to every member of a group.
    Shout {
        sequence: u16,
        group: String,
        content: Vec<u8>,
    },
    Join {
        sequence: u16,
        group: String,
        status: u8,
    },
    Leave {
        sequence: u16,
        group: String,
        status: u8,
    },
    /// Ping a peer that has gone silent.
    Ping { sequence: u16 },
    /// Reply to a peer's ping.
    PingOk { sequence: u16 },
}

/// Wire type id for each data message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Hello,
    Whisper,
    Shout,
    Join,
    Leave,
    Ping,
    PingOk,
}

impl MessageKind {
    pub fn id(self) -> u8 {
        match self {
            MessageKind::Hello => 1,
            MessageKind::Whisper => 2,
            MessageKind::Shout => 3,
            MessageKind::Join => 4,
            MessageKind::Leave => 5,
            MessageKind::Ping => 6,
            MessageKind::PingOk => 7,
        }
    }

    /// Reverse of [`MessageKind::id`]. Ids outside 1..=7 are rejected.
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(MessageKind::Hello),
            2 => Some(MessageKind::Whisper),
            3 => Some(MessageKind::Shout),
            4 => Some(MessageKind::Join),
            5 => Some(MessageKind::Leave),
            6 => Some(MessageKind::Ping),
            7 => Some(MessageKind::PingOk),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Hello => "HELLO",
            MessageKind::Whisper => "WHISPER",
            MessageKind::Shout => "SHOUT",
            MessageKind::Join => "JOIN",
            MessageKind::Leave => "LEAVE",
            MessageKind::Ping => "PING",
            MessageKind::PingOk => "PING_OK",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ZreMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ZreMessage::Hello { .. } => MessageKind::Hello,
            ZreMessage::Whisper { .. } => MessageKind::Whisper,
            ZreMessage::Shout { .. } => MessageKind::Shout,
            ZreMessage::Join { .. } => MessageKind::Join,
            ZreMessage::Leave { .. } => MessageKind::Leave,
            ZreMessage::Ping { .. } => MessageKind::Ping,
            ZreMessage::PingOk { .. } => MessageKind::PingOk,
        }
    }

    pub fn sequence(&self) -> u16 {
        match self {
            ZreMessage::Hello { sequence, .. }
            | ZreMessage::Whisper { sequence, .. }
            | ZreMessage::Shout { sequence, .. }
            | ZreMessage::Join { sequence, .. }
            | ZreMessage::Leave { sequence, .. }
            | ZreMessage::Ping { sequence }
            | ZreMessage::PingOk { sequence } => *sequence,
        }
    }

    /// Return the same message stamped with `seq`.
    pub fn with_sequence(mut self, seq: u16) -> Self {
        match &mut self {
            ZreMessage::Hello { sequence, .. }
            | ZreMessage::Whisper { sequence, .. }
            | ZreMessage::Shout { sequence, .. }
            | ZreMessage::Join { sequence, .. }
            | ZreMessage::Leave { sequence, .. }
            | ZreMessage::Ping { sequence }
            | ZreMessage::PingOk { sequence } => *sequence = seq,
        }
        self
    }
}

/// LOG record severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
}

impl LogLevel {
    pub fn code(self) -> u8 {
        match self {
            LogLevel::Error => 1,
            LogLevel::Warning => 2,
            LogLevel::Info => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(LogLevel::Error),
            2 => Some(LogLevel::Warning),
            3 => Some(LogLevel::Info),
            _ => None,
        }
    }
}

/// LOG record event class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEvent {
    Join,
    Leave,
    Enter,
    Exit,
    Other,
}

impl LogEvent {
    pub fn code(self) -> u8 {
        match self {
            LogEvent::Join => 1,
            LogEvent::Leave => 2,
            LogEvent::Enter => 3,
            LogEvent::Exit => 4,
            LogEvent::Other => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(LogEvent::Join),
            2 => Some(LogEvent::Leave),
            3 => Some(LogEvent::Enter),
            4 => Some(LogEvent::Exit),
            5 => Some(LogEvent::Other),
            _ => None,
        }
    }
}

/// Side-channel telemetry record (log protocol, single type LOG).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub level: LogLevel,
    pub event: LogEvent,
    /// Short hash of the reporting node.
    pub node: u16,
    /// Short hash of the peer concerned, 0 when none.
    pub peer: u16,
    /// Milliseconds since the Unix epoch.
    pub time: u64,
    pub data: String,
}
