//! Gemini API client.
//!
//! Three surfaces: one-shot `generateContent` (image editing, search-grounded
//! answers), long-running video operations (submit + poll by reference), and
//! the bidirectional Live WebSocket session. Auth is via API key in a query
//! parameter.

pub mod generate;
pub mod live;
pub mod video;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_LIVE_BASE_URL: &str = "wss://generativelanguage.googleapis.com";

pub struct GeminiClient {
    pub base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.into(),
            http: reqwest::Client::new(),
        }
    }

    pub(crate) fn api_key(&self) -> &str {
        &self.api_key
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Append the access credential to a fetchable result URI.
    pub fn credentialed_url(&self, uri: &str) -> String {
        let sep = if uri.contains('?') { '&' } else { '?' };
        format!("{uri}{sep}key={}", self.api_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_base_url_default_and_trim() {
        let client = GeminiClient::new("k", None);
        assert_eq!(client.base_url, DEFAULT_BASE_URL);

        let client = GeminiClient::new("k", Some("https://example.test/"));
        assert_eq!(client.base_url, "https://example.test");
    }

    #[test]
    fn test_credentialed_url() {
        let client = GeminiClient::new("secret", None);
        assert_eq!(
            client.credentialed_url("https://files.test/video.mp4"),
            "https://files.test/video.mp4?key=secret"
        );
        assert_eq!(
            client.credentialed_url("https://files.test/video.mp4?alt=media"),
            "https://files.test/video.mp4?alt=media&key=secret"
        );
    }
}
