use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Message identifier, unique per topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// JSON extension metadata carried alongside a message body.
///
/// The wire form is a flat JSON object. Known keys are typed; everything
/// else rides along in `extra` untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtHeader {
    /// Marks synthetic canary traffic injected into an ordered stream.
    #[serde(default, skip_serializing_if = "is_false")]
    pub canary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_tag: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl ExtHeader {
    pub fn canary() -> Self {
        Self {
            canary: true,
            ..Self::default()
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|_| Error::InvalidMessage("unencodable ext header"))
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|_| Error::InvalidMessage("malformed ext header"))
    }
}

/// Scheduling metadata for a message parked in the delayed queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedMeta {
    /// Channel the message re-enters once due.
    pub channel: String,
    /// Absolute due time, nanoseconds since the UNIX epoch.
    pub due_ns: u64,
    /// Identity of the message as originally published.
    pub orig_id: MessageId,
    /// Backend offset of the original publication.
    pub orig_offset: u64,
}

/// A message as the channel sees it.
///
/// The payload is immutable once published. Offset, raw size and count
/// index are stamped by the backend log at put time; the channel treats
/// `[offset, offset + raw_size)` as the acknowledgeable range and
/// `cnt_index` as the cumulative message count reached at its end.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub body: Vec<u8>,
    /// Publish timestamp, nanoseconds since the UNIX epoch.
    pub timestamp_ns: u64,
    /// Byte offset of this record in the backend log.
    pub offset: u64,
    /// Stored footprint of this record, framing included.
    pub raw_size: u32,
    /// Cumulative message count at the end of this record.
    pub cnt_index: u64,
    /// Delivery attempts so far; zero until first handed to a consumer.
    pub attempts: u16,
    pub ext: Option<ExtHeader>,
    pub delayed: Option<DelayedMeta>,
}

impl Message {
    pub fn new(id: MessageId, body: Vec<u8>) -> Self {
        Self {
            id,
            body,
            timestamp_ns: 0,
            offset: 0,
            raw_size: 0,
            cnt_index: 0,
            attempts: 0,
            ext: None,
            delayed: None,
        }
    }

    pub fn with_ext(id: MessageId, body: Vec<u8>, ext: ExtHeader) -> Self {
        let mut msg = Self::new(id, body);
        msg.ext = Some(ext);
        msg
    }

    /// End of the acknowledgeable byte range.
    pub fn end_offset(&self) -> u64 {
        self.offset + u64::from(self.raw_size)
    }

    pub fn is_canary(&self) -> bool {
        self.ext.as_ref().map(|ext| ext.canary).unwrap_or(false)
    }
}
