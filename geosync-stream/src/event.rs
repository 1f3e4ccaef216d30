//! Connection events and inbound message decoding.

use serde_json::Value;

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Json(Value),
    /// Frame that is not valid JSON, delivered verbatim.
    Text(String),
}

impl StreamMessage {
    /// Try JSON first, fall back to the raw text.
    pub fn parse(text: String) -> Self {
        match serde_json::from_str(&text) {
            Ok(value) => Self::Json(value),
            Err(_) => Self::Text(text),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Json(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected,
    Message(StreamMessage),
    Error {
        message: String,
    },
    Disconnected {
        reason: String,
        /// Close code, when the peer sent one or the client closed.
        code: Option<u16>,
    },
    Reconnecting {
        attempt: u32,
        delay_ms: u64,
    },
}

/// Discriminant used to subscribe to one kind of event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamEventKind {
    Connected,
    Message,
    Error,
    Disconnected,
    Reconnecting,
}

impl StreamEvent {
    pub fn kind(&self) -> StreamEventKind {
        match self {
            Self::Connected => StreamEventKind::Connected,
            Self::Message(_) => StreamEventKind::Message,
            Self::Error { .. } => StreamEventKind::Error,
            Self::Disconnected { .. } => StreamEventKind::Disconnected,
            Self::Reconnecting { .. } => StreamEventKind::Reconnecting,
        }
    }
}

/// Human-readable reason for an RFC 6455 close code.
pub fn close_reason(code: u16) -> &'static str {
    match code {
        1000 => "Normal closure",
        1001 => "Going away",
        1002 => "Protocol error",
        1003 => "Unsupported data",
        1005 => "No status received",
        1006 => "Abnormal closure",
        1007 => "Invalid frame payload data",
        1008 => "Policy violation",
        1009 => "Message too big",
        1010 => "Mandatory extension",
        1011 => "Internal server error",
        1015 => "TLS handshake",
        _ => "Unknown reason",
    }
}
