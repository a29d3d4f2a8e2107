//! Payload synthesis for producers and sequence extraction for consumers.
//!
//! Every payload carries its producer-local sequence number so consumers can
//! feed the integrity trackers. No payload carries a timestamp: end-to-end
//! latency comes from the broker-assigned publish time.

use crate::config::{SchemaKind, DEFAULT_STRING_PAYLOAD_SIZE};
use crate::utils::random_alphanumeric;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Length of the random `msg` field in json payloads.
const JSON_MSG_LEN: usize = 16;

/// What a producer worker generates for each message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadSpec {
    pub schema: SchemaKind,
    pub message_size: usize,
}

#[derive(Serialize, Deserialize)]
struct JsonPayload {
    seq: u64,
    #[serde(default)]
    msg: String,
}

impl PayloadSpec {
    pub fn new(schema: SchemaKind, message_size: usize) -> Self {
        Self {
            schema,
            message_size,
        }
    }

    /// Builds the payload for sequence number `seq`.
    pub fn generate(&self, seq: u64) -> Bytes {
        match self.schema {
            SchemaKind::String => {
                let header = format!("SEQ:{seq};");
                let size = if self.message_size == 0 {
                    DEFAULT_STRING_PAYLOAD_SIZE
                } else {
                    self.message_size
                };
                let pad = size.saturating_sub(header.len());
                let mut body = String::with_capacity(header.len() + pad);
                body.push_str(&header);
                body.push_str(&random_alphanumeric(pad));
                Bytes::from(body)
            }
            SchemaKind::Json => {
                let body = JsonPayload {
                    seq,
                    msg: random_alphanumeric(JSON_MSG_LEN),
                };
                // Serializing a struct of an integer and a String cannot fail.
                Bytes::from(serde_json::to_vec(&body).unwrap_or_default())
            }
            SchemaKind::Int64 | SchemaKind::Number => Bytes::from(seq.to_string()),
        }
    }
}

/// Recovers the sequence number a producer embedded in `payload`.
///
/// Returns `None` for payloads that do not follow the schema's layout.
pub fn parse_sequence(schema: SchemaKind, payload: &[u8]) -> Option<u64> {
    match schema {
        SchemaKind::String => {
            let rest = payload.strip_prefix(b"SEQ:")?;
            let end = rest.iter().position(|b| *b == b';')?;
            std::str::from_utf8(&rest[..end]).ok()?.parse().ok()
        }
        SchemaKind::Json => serde_json::from_slice::<JsonPayload>(payload)
            .ok()
            .map(|p| p.seq),
        SchemaKind::Int64 | SchemaKind::Number => {
            std::str::from_utf8(payload).ok()?.trim().parse().ok()
        }
    }
}
