//! Transfer protocol message definitions and codec.
//!
//! Every message is a JSON object with a `type` discriminator:
//!
//! ```text
//! {"type":"list",     "files": ["a.txt", ...]}           server -> peer
//! {"type":"download", "file": "a.txt"}                   peer -> server
//! {"type":"file",     "name": "a.txt", "content": "..."} server -> peer
//! ```
//!
//! File contents travel as standard base64 so all three kinds share one text
//! format.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Current contents of the shared directory
    #[serde(rename = "list")]
    Listing {
        /// File names
        files: Vec<String>,
    },

    /// Peer asks for one file
    #[serde(rename = "download")]
    DownloadRequest {
        /// Requested file name
        #[serde(rename = "file")]
        name: String,
    },

    /// Whole file delivered to the requesting peer
    #[serde(rename = "file")]
    FilePayload {
        /// File name
        name: String,
        /// Raw file bytes (base64 on the wire)
        #[serde(rename = "content", with = "base64_content")]
        bytes: Vec<u8>,
    },
}

/// Protocol codec errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Unknown discriminator, missing field or wrong field type
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Message could not be serialized
    #[error("Encode error: {0}")]
    Encode(String),
}

impl Message {
    /// Build a listing message
    pub fn listing<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Message::Listing {
            files: files.into_iter().map(Into::into).collect(),
        }
    }

    /// Build a download request
    pub fn download(name: impl Into<String>) -> Self {
        Message::DownloadRequest { name: name.into() }
    }

    /// Build a file payload
    pub fn payload(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Message::FilePayload {
            name: name.into(),
            bytes,
        }
    }

    /// Encode to the wire text representation
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decode a text frame
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedMessage(e.to_string()))
    }

    /// Decode a binary frame carrying the same JSON text
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::MalformedMessage(e.to_string()))
    }

    /// Get the wire discriminator
    pub fn message_type(&self) -> &'static str {
        match self {
            Message::Listing { .. } => "list",
            Message::DownloadRequest { .. } => "download",
            Message::FilePayload { .. } => "file",
        }
    }
}

mod base64_content {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_listing_wire_format() {
        let msg = Message::listing(["a.txt"]);
        assert_eq!(msg.encode().unwrap(), r#"{"type":"list","files":["a.txt"]}"#);
    }

    #[test]
    fn test_payload_wire_format() {
        let msg = Message::payload("a.txt", b"hello".to_vec());
        assert_eq!(
            msg.encode().unwrap(),
            r#"{"type":"file","name":"a.txt","content":"aGVsbG8="}"#
        );
    }

    #[test]
    fn test_decode_download_request() {
        let msg = Message::decode(r#"{"type":"download","file":"a.txt"}"#).unwrap();
        assert_eq!(msg, Message::download("a.txt"));
        assert_eq!(msg.message_type(), "download");
    }

    #[test]
    fn test_decode_ignores_extra_fields() {
        let msg = Message::decode(r#"{"type":"download","file":"a.txt","extra":1}"#).unwrap();
        assert_eq!(msg, Message::download("a.txt"));
    }

    #[test]
    fn test_decode_binary_frame() {
        let msg = Message::decode_bytes(br#"{"type":"list","files":[]}"#).unwrap();
        assert_eq!(msg, Message::Listing { files: vec![] });
    }

    #[test]
    fn test_decode_unknown_type() {
        let err = Message::decode(r#"{"type":"upload","file":"a.txt"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedMessage(_)));
    }

    #[test]
    fn test_decode_missing_field() {
        assert!(Message::decode(r#"{"type":"download"}"#).is_err());
        assert!(Message::decode(r#"{"file":"a.txt"}"#).is_err());
    }

    #[test]
    fn test_decode_wrong_field_type() {
        assert!(Message::decode(r#"{"type":"download","file":42}"#).is_err());
        assert!(Message::decode(r#"{"type":"list","files":"a.txt"}"#).is_err());
    }

    #[test]
    fn test_decode_not_json() {
        assert!(Message::decode("hello").is_err());
        assert!(Message::decode("").is_err());
        assert!(Message::decode("[1,2,3]").is_err());
    }

    #[test]
    fn test_decode_invalid_base64() {
        let err = Message::decode(r#"{"type":"file","name":"a","content":"!!!"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedMessage(_)));
    }

    proptest! {
        #[test]
        fn prop_payload_bytes_survive_codec(
            name in "[a-zA-Z0-9._-]{1,32}",
            bytes in proptest::collection::vec(any::<u8>(), 0..4096),
        ) {
            let msg = Message::payload(name.clone(), bytes.clone());
            let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, Message::FilePayload { name, bytes });
        }
    }
}
