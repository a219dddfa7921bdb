//! One-shot `generateContent` requests: image editing and search-grounded
//! question answering.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use opal_core::error::{OpalError, Result};
use opal_core::types::{Blob, Content, GroundingChunk, Part};

use crate::GeminiClient;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_modalities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

impl GenerateRequest {
    /// A plain text prompt.
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            contents: vec![Content::user(vec![Part::text(prompt)])],
            system_instruction: None,
            tools: None,
            generation_config: None,
        }
    }

    /// An inline image followed by an instruction prompt.
    pub fn image_edit(image: Blob, prompt: impl Into<String>) -> Self {
        Self {
            contents: vec![Content::user(vec![Part::inline(image), Part::text(prompt)])],
            system_instruction: None,
            tools: None,
            // Image editing needs the image modality enabled on the response
            generation_config: Some(GenerationConfig {
                response_modalities: Some(vec!["TEXT".into(), "IMAGE".into()]),
                temperature: None,
            }),
        }
    }

    /// Enable the search-grounding tool.
    pub fn with_search(mut self) -> Self {
        self.tools = Some(vec![json!({ "googleSearch": {} })]);
        self
    }
}

// --- Response wire types ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunkWire>,
}

#[derive(Debug, Deserialize)]
struct GroundingChunkWire {
    #[serde(default)]
    web: Option<WebSource>,
}

#[derive(Debug, Deserialize)]
struct WebSource {
    #[serde(default)]
    uri: String,
    #[serde(default)]
    title: String,
}

/// A settled one-shot reply: the candidate's parts plus any citations.
#[derive(Debug, Clone, Default)]
pub struct GenerateReply {
    pub parts: Vec<Part>,
    pub grounding: Vec<GroundingChunk>,
}

impl GenerateReply {
    /// All text parts concatenated.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }

    /// Inline image payloads, in response order.
    pub fn inline_images(&self) -> Vec<&Blob> {
        self.parts
            .iter()
            .filter_map(|p| p.inline_data.as_ref())
            .filter(|b| b.is_image())
            .collect()
    }
}

fn reply_from_response(response: GenerateResponse) -> GenerateReply {
    let mut reply = GenerateReply::default();
    if let Some(candidate) = response.candidates.into_iter().next() {
        if let Some(content) = candidate.content {
            reply.parts = content.parts;
        }
        if let Some(metadata) = candidate.grounding_metadata {
            reply.grounding = metadata
                .grounding_chunks
                .into_iter()
                .filter_map(|c| c.web)
                .map(|w| GroundingChunk {
                    uri: w.uri,
                    title: w.title,
                })
                .collect();
        }
    }
    reply
}

impl GeminiClient {
    /// Issue a one-shot `generateContent` request.
    pub async fn generate(&self, model: &str, request: &GenerateRequest) -> Result<GenerateReply> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url,
            model,
            self.api_key()
        );

        debug!(model, "Calling generateContent");

        let response = self
            .http()
            .post(&url)
            .header("content-type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| OpalError::Provider(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OpalError::Provider(format!("Gemini API error {status}: {body}")));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| OpalError::Provider(format!("malformed response: {e}")))?;

        Ok(reply_from_response(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_request_shape() {
        let req = GenerateRequest::text("hello");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][0]["parts"][0]["text"], "hello");
        assert!(json.get("tools").is_none());
    }

    #[test]
    fn test_image_edit_request_shape() {
        let req = GenerateRequest::image_edit(Blob::from_bytes("image/png", &[1, 2]), "make it blue");
        let json = serde_json::to_value(&req).unwrap();
        assert!(json["contents"][0]["parts"][0]["inlineData"]["data"].is_string());
        assert_eq!(json["contents"][0]["parts"][1]["text"], "make it blue");
        let modalities = &json["generationConfig"]["responseModalities"];
        assert_eq!(modalities[0], "TEXT");
        assert_eq!(modalities[1], "IMAGE");
    }

    #[test]
    fn test_with_search_adds_tool() {
        let req = GenerateRequest::text("who won?").with_search();
        let json = serde_json::to_value(&req).unwrap();
        assert!(json["tools"][0]["googleSearch"].is_object());
    }

    #[test]
    fn test_reply_extraction() {
        let raw = r#"{
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"text": "The answer"},
                        {"inlineData": {"mimeType": "image/png", "data": "AAAA"}}
                    ]
                },
                "groundingMetadata": {
                    "groundingChunks": [
                        {"web": {"uri": "https://a.test", "title": "Source A"}},
                        {"retrievedContext": {}}
                    ]
                }
            }]
        }"#;
        let response: GenerateResponse = serde_json::from_str(raw).unwrap();
        let reply = reply_from_response(response);

        assert_eq!(reply.text(), "The answer");
        assert_eq!(reply.inline_images().len(), 1);
        assert_eq!(
            reply.grounding,
            vec![GroundingChunk {
                uri: "https://a.test".into(),
                title: "Source A".into()
            }]
        );
    }

    #[test]
    fn test_reply_with_no_candidates_is_empty() {
        let response: GenerateResponse = serde_json::from_str("{}").unwrap();
        let reply = reply_from_response(response);
        assert!(reply.parts.is_empty());
        assert_eq!(reply.text(), "");
        assert!(reply.inline_images().is_empty());
    }
}
