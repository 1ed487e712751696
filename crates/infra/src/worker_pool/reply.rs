//! Worker reply envelope.
//!
//! A worker answers every invocation with exactly one reply: either the
//! produced bytes or a `{name, message}` failure. Process workers write the
//! reply to stdout as one frame:
//!
//! ```text
//! 0x00 <artifact bytes>          success
//! 0x01 <json {name, message}>    transform failure
//! ```
//!
//! Older workers write the artifact bytes untagged and report failures as a
//! JSON `{"error": {"name", "message"}}` document. [`ReplyFraming::Untagged`]
//! decodes that by sniffing the content, which misreads an artifact that
//! happens to be such a JSON document as a failure. Prefer the tagged framing
//! for new workers.

use serde::{Deserialize, Serialize};

pub const TAG_OK: u8 = 0x00;
pub const TAG_ERR: u8 = 0x01;

/// A transform error reported by the worker itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub name: String,
    pub message: String,
}

impl WorkerFailure {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl core::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReply {
    Ok(Vec<u8>),
    Err(WorkerFailure),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ReplyFraming {
    /// One tag byte, then the body.
    #[default]
    Tagged,
    /// Raw artifact bytes, failures detected by content sniffing.
    Untagged,
}

#[derive(Debug, Deserialize)]
struct LegacyErrorDocument {
    error: WorkerFailure,
}

impl WorkerReply {
    pub fn failure(name: impl Into<String>, message: impl Into<String>) -> Self {
        WorkerReply::Err(WorkerFailure::new(name, message))
    }

    /// Encode as a tagged frame.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            WorkerReply::Ok(bytes) => {
                let mut frame = Vec::with_capacity(bytes.len() + 1);
                frame.push(TAG_OK);
                frame.extend_from_slice(bytes);
                frame
            }
            WorkerReply::Err(failure) => {
                let mut frame = vec![TAG_ERR];
                // Serializing two strings cannot fail.
                frame.extend(serde_json::to_vec(failure).unwrap_or_default());
                frame
            }
        }
    }

    /// Decode a frame written by a worker using `framing`.
    pub fn decode(frame: Vec<u8>, framing: ReplyFraming) -> Result<Self, String> {
        match framing {
            ReplyFraming::Tagged => Self::decode_tagged(frame),
            ReplyFraming::Untagged => Ok(Self::decode_untagged(frame)),
        }
    }

    fn decode_tagged(mut frame: Vec<u8>) -> Result<Self, String> {
        let Some(&tag) = frame.first() else {
            return Err("empty worker reply".to_owned());
        };
        let body = frame.split_off(1);
        match tag {
            TAG_OK => Ok(WorkerReply::Ok(body)),
            TAG_ERR => serde_json::from_slice::<WorkerFailure>(&body)
                .map(WorkerReply::Err)
                .map_err(|e| format!("malformed worker failure: {e}")),
            other => Err(format!("unknown worker reply tag: {other:#04x}")),
        }
    }

    fn decode_untagged(body: Vec<u8>) -> Self {
        if body.first() == Some(&b'{') {
            if let Ok(doc) = serde_json::from_slice::<LegacyErrorDocument>(&body) {
                return WorkerReply::Err(doc.error);
            }
        }
        WorkerReply::Ok(body)
    }
}
