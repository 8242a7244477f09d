//! Text messages on the video WebSocket
//!
//! Binary messages carry one Annex-B NAL unit each. Text messages are JSON:
//!
//! ```text
//! {"type":"metadata","device_width":1080,"device_height":2400,"stream_width":576,"stream_height":1280}
//! {"type":"error","error":"failed to start capture for emulator-5554: ..."}
//! ```

use serde::{Deserialize, Serialize};

use crate::device::{Resolution, StreamInfo};

/// Control message sent as a WebSocket text frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// Device and stream resolution
    Metadata {
        device_width: Option<u32>,
        device_height: Option<u32>,
        stream_width: Option<u32>,
        stream_height: Option<u32>,
    },
    /// The stream cannot be served
    Error { error: String },
}

/// Text payloads a consumer accepts
///
/// Older relays send a bare `{"error": "..."}` without a type tag.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum IncomingText {
    Tagged(RelayMessage),
    BareError { error: String },
}

impl RelayMessage {
    pub fn metadata(info: StreamInfo) -> Self {
        RelayMessage::Metadata {
            device_width: info.device.map(|r| r.width),
            device_height: info.device.map(|r| r.height),
            stream_width: info.encoded.map(|r| r.width),
            stream_height: info.encoded.map(|r| r.height),
        }
    }

    pub fn error(error: impl ToString) -> Self {
        RelayMessage::Error {
            error: error.to_string(),
        }
    }

    /// Serialize for a text frame
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl IncomingText {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Resolutions carried by a metadata message
pub fn stream_info(
    device_width: Option<u32>,
    device_height: Option<u32>,
    stream_width: Option<u32>,
    stream_height: Option<u32>,
) -> StreamInfo {
    let pair = |w: Option<u32>, h: Option<u32>| Some(Resolution::new(w?, h?));
    StreamInfo::new(pair(device_width, device_height), pair(stream_width, stream_height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_json() {
        let info = StreamInfo::new(
            Some(Resolution::new(1080, 2400)),
            Some(Resolution::new(576, 1280)),
        );
        let json = RelayMessage::metadata(info).to_json().unwrap();
        assert_eq!(
            json,
            r#"{"type":"metadata","device_width":1080,"device_height":2400,"stream_width":576,"stream_height":1280}"#
        );
    }

    #[test]
    fn test_error_json() {
        let json = RelayMessage::error("device unreachable").to_json().unwrap();
        assert_eq!(json, r#"{"type":"error","error":"device unreachable"}"#);
    }

    #[test]
    fn test_parse_incoming() {
        let parsed = IncomingText::parse(r#"{"type":"error","error":"boom"}"#).unwrap();
        assert_eq!(parsed, IncomingText::Tagged(RelayMessage::error("boom")));

        let parsed = IncomingText::parse(r#"{"error":"boom"}"#).unwrap();
        assert_eq!(parsed, IncomingText::BareError { error: "boom".into() });

        let parsed = IncomingText::parse(r#"{"type":"metadata","device_width":null,"device_height":null,"stream_width":576,"stream_height":1280}"#).unwrap();
        let IncomingText::Tagged(RelayMessage::Metadata {
            device_width,
            device_height,
            stream_width,
            stream_height,
        }) = parsed
        else {
            panic!("expected metadata");
        };
        let info = stream_info(device_width, device_height, stream_width, stream_height);
        assert_eq!(info.device, None);
        assert_eq!(info.encoded, Some(Resolution::new(576, 1280)));

        assert!(IncomingText::parse("not json").is_err());
    }
}
