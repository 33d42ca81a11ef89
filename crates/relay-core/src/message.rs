//! Payload frames and broadcast messages.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ids::ConnectionId;

/// Wire frame type a payload arrived as, so it is relayed unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// UTF-8 text frame.
    Text,
    /// Binary frame.
    Binary,
}

/// An opaque payload. Cloning shares the underlying buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payload {
    kind: FrameKind,
    data: Bytes,
}

impl Payload {
    /// A text payload.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Text,
            data: Bytes::from(text.into()),
        }
    }

    /// A text payload over an existing buffer, without copying. The bytes are
    /// expected to be UTF-8; [`Payload::as_text`] returns `None` otherwise.
    pub fn text_bytes(data: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Text,
            data: data.into(),
        }
    }

    /// A binary payload.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Binary,
            data: data.into(),
        }
    }

    /// Frame type.
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// The payload as text, if it is a text frame holding valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        match self.kind {
            FrameKind::Text => std::str::from_utf8(&self.data).ok(),
            FrameKind::Binary => None,
        }
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload has no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Consume into the underlying buffer.
    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

/// One payload on its way from a sender to every active connection.
///
/// Immutable once built. The origin is informational only: recipients are
/// never filtered by sender, so a sender receives its own messages.
#[derive(Clone, Debug)]
pub struct BroadcastMessage {
    origin: Option<ConnectionId>,
    payload: Payload,
    received_at: DateTime<Utc>,
}

impl BroadcastMessage {
    /// A message with no originating connection (e.g. server-generated).
    pub fn new(payload: Payload) -> Self {
        Self {
            origin: None,
            payload,
            received_at: Utc::now(),
        }
    }

    /// A message received from `origin`.
    pub fn from_connection(origin: ConnectionId, payload: Payload) -> Self {
        Self {
            origin: Some(origin),
            payload,
            received_at: Utc::now(),
        }
    }

    /// Connection the payload was received from.
    pub fn origin(&self) -> Option<&ConnectionId> {
        self.origin.as_ref()
    }

    /// The payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// When the relay received the payload.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// The outbound frame every recipient is handed.
    ///
    /// Built once per broadcast; each recipient gets a clone sharing the same
    /// buffer.
    pub fn to_frame(&self) -> Payload {
        self.payload.clone()
    }
}
