//! Shared content types mirroring the Gemini wire format.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::error::{OpalError, Result};

/// Inline binary payload (audio, image, or video bytes), base64 on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    /// Base64-encoded bytes.
    pub data: String,
}

impl Blob {
    /// Encode raw bytes into an inline blob.
    pub fn from_bytes(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: BASE64.encode(bytes),
        }
    }

    /// Decode the base64 payload back into raw bytes.
    pub fn decode(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.data)
            .map_err(|e| OpalError::Audio(format!("invalid base64 payload: {e}")))
    }

    /// Whether this blob carries audio data.
    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }

    /// Whether this blob carries image data.
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// One part of a content message: text or inline data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn inline(blob: Blob) -> Self {
        Self {
            inline_data: Some(blob),
            ..Self::default()
        }
    }
}

/// A content message: an optional role plus an ordered list of parts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: Some("user".into()),
            parts,
        }
    }

    /// System instruction content (no role on the wire).
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: None,
            parts: vec![Part::text(text)],
        }
    }
}

/// A search-grounding citation: source URI plus page title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingChunk {
    pub uri: String,
    pub title: String,
}

/// An encoded microphone chunk ready for the live transport:
/// raw PCM bytes plus the declared mime type.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub data: Vec<u8>,
    pub mime_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_round_trip() {
        let blob = Blob::from_bytes("audio/pcm;rate=16000", &[1, 2, 3, 255]);
        assert_eq!(blob.decode().unwrap(), vec![1, 2, 3, 255]);
        assert!(blob.is_audio());
        assert!(!blob.is_image());
    }

    #[test]
    fn test_blob_invalid_base64() {
        let blob = Blob {
            mime_type: "audio/pcm".into(),
            data: "not base64!!!".into(),
        };
        assert!(blob.decode().is_err());
    }

    #[test]
    fn test_part_serialization_camel_case() {
        let part = Part::inline(Blob::from_bytes("image/png", &[0u8; 4]));
        let json = serde_json::to_value(&part).unwrap();
        assert!(json["inlineData"]["mimeType"].is_string());
        assert!(json.get("text").is_none());
    }

    #[test]
    fn test_content_system_has_no_role() {
        let content = Content::system("Be brief.");
        let json = serde_json::to_value(&content).unwrap();
        assert!(json.get("role").is_none());
        assert_eq!(json["parts"][0]["text"], "Be brief.");
    }
}
