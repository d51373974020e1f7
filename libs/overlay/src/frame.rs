//! Wire frames.
//!
//! Frames are newline-delimited JSON objects tagged by `type`:
//!
//! 1. Dialer sends `hello`
//! 2. Acceptor replies `welcome` with the peers it already knows
//! 3. Both sides exchange `message` frames

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::OverlayError;

/// Maximum encoded size of one frame (1 MiB), newline included.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Free-form message body.
pub type Body = serde_json::Map<String, serde_json::Value>;

/// A peer known to the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: String,
    pub public_addr: String,
}

/// One wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Hello {
        peer_id: String,
        public_addr: String,
        #[serde(default)]
        metadata: BTreeMap<String, String>,
    },
    Welcome {
        peer_id: String,
        public_addr: String,
        #[serde(default)]
        metadata: BTreeMap<String, String>,
        #[serde(default)]
        peers: Vec<PeerInfo>,
    },
    Message {
        from: String,
        to: String,
        tag: String,
        #[serde(default)]
        body: Body,
        #[serde(default)]
        relayed: bool,
    },
}

impl Frame {
    /// Encode as one NDJSON line.
    pub fn encode(&self) -> Result<String, OverlayError> {
        let mut line =
            serde_json::to_string(self).map_err(|e| OverlayError::Frame(e.to_string()))?;
        line.push('\n');
        if line.len() > MAX_FRAME_BYTES {
            return Err(OverlayError::Frame(format!(
                "frame of {} bytes exceeds limit of {}",
                line.len(),
                MAX_FRAME_BYTES
            )));
        }
        Ok(line)
    }

    /// Decode one NDJSON line (trailing newline optional).
    pub fn decode(line: &str) -> Result<Self, OverlayError> {
        serde_json::from_str(line.trim_end()).map_err(|e| OverlayError::Frame(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Welcome { .. } => "welcome",
            Frame::Message { .. } => "message",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_frame_wire_shape() {
        let mut body = Body::new();
        body.insert("appid".to_string(), json!("app-1"));

        let frame = Frame::Message {
            from: "sa-1".to_string(),
            to: "lsa".to_string(),
            tag: "MSG_GETSTATE".to_string(),
            body,
            relayed: false,
        };

        let line = frame.encode().unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.contains("\"type\":\"message\""));
        assert!(line.contains("\"tag\":\"MSG_GETSTATE\""));
        assert_eq!(Frame::decode(&line).unwrap(), frame);
    }

    #[test]
    fn test_hello_defaults_missing_metadata() {
        let frame = Frame::decode(r#"{"type":"hello","peer_id":"p","public_addr":"1.2.3.4:1"}"#)
            .unwrap();
        match frame {
            Frame::Hello { metadata, .. } => assert!(metadata.is_empty()),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        assert!(Frame::decode(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn test_encode_rejects_oversized_frame() {
        let mut body = Body::new();
        body.insert("blob".to_string(), json!("x".repeat(MAX_FRAME_BYTES)));
        let frame = Frame::Message {
            from: "a".to_string(),
            to: "b".to_string(),
            tag: "T".to_string(),
            body,
            relayed: false,
        };
        assert!(matches!(frame.encode(), Err(OverlayError::Frame(_))));
    }
}
