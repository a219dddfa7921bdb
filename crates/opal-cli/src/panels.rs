//! Media job panels: the image-to-video, image-editing, and grounded
//! search flows. Each panel owns a [`JobState`] so callers can observe
//! whether a job is idle, in flight (with a coarse status line), or
//! settled with a result or a failure message.

use std::path::{Path, PathBuf};

use opal_core::config::Config;
use opal_core::error::{OpalError, Result};
use opal_core::types::{Blob, GroundingChunk};
use opal_gemini::generate::{GenerateReply, GenerateRequest};
use opal_gemini::video::{DEFAULT_MAX_POLLS, DEFAULT_POLL_INTERVAL, poll_until_done};
use opal_gemini::GeminiClient;
use tracing::info;

/// Lifecycle of a long-running panel job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobState<T> {
    Idle,
    InFlight { status: String },
    Settled(std::result::Result<T, String>),
}

impl<T> JobState<T> {
    pub fn begin(&mut self, status: impl Into<String>) {
        *self = JobState::InFlight { status: status.into() };
    }

    /// Update the status line; only meaningful while in flight.
    pub fn progress(&mut self, status: impl Into<String>) {
        if matches!(self, JobState::InFlight { .. }) {
            *self = JobState::InFlight { status: status.into() };
        }
    }

    pub fn settle(&mut self, result: &Result<T>)
    where
        T: Clone,
    {
        *self = match result {
            Ok(value) => JobState::Settled(Ok(value.clone())),
            Err(e) => JobState::Settled(Err(e.to_string())),
        };
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, JobState::Settled(_))
    }
}

/// Map a file extension to the MIME type sent with inline image data.
pub fn mime_for_path(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/png",
    }
}

fn read_image(path: &Path) -> Result<Blob> {
    let bytes = std::fs::read(path)?;
    Ok(Blob::from_bytes(mime_for_path(path), &bytes))
}

/// Image-to-video generation: submit, poll until the job settles, then
/// download the result to `output`.
pub struct VideoPanel {
    pub state: JobState<PathBuf>,
}

impl VideoPanel {
    pub fn new() -> Self {
        Self { state: JobState::Idle }
    }

    pub async fn run(
        &mut self,
        client: &GeminiClient,
        config: &Config,
        image: &Path,
        prompt: &str,
        output: &Path,
    ) -> Result<PathBuf> {
        self.state.begin("submitting video job");
        let result = self.run_inner(client, config, image, prompt, output).await;
        self.state.settle(&result);
        result
    }

    async fn run_inner(
        &mut self,
        client: &GeminiClient,
        config: &Config,
        image: &Path,
        prompt: &str,
        output: &Path,
    ) -> Result<PathBuf> {
        let source = read_image(image)?;
        let op = client
            .start_video(&config.video_model(), prompt, Some(&source))
            .await?;
        info!(name = %op.name, "Video job accepted");

        let state = &mut self.state;
        let op = poll_until_done(
            client,
            op,
            DEFAULT_POLL_INTERVAL,
            DEFAULT_MAX_POLLS,
            |status| {
                println!("  {status}");
                state.progress(status);
            },
        )
        .await?;

        let uri = op
            .video_uri()
            .ok_or_else(|| OpalError::Job("job settled without a video".into()))?;
        self.state.progress("downloading video");
        let bytes = client.download(uri).await?;
        std::fs::write(output, bytes)?;
        Ok(output.to_path_buf())
    }
}

/// Prompt-driven image editing: one generateContent call with image
/// response modality, then the first returned image is written out.
pub struct ImagePanel {
    pub state: JobState<PathBuf>,
}

impl ImagePanel {
    pub fn new() -> Self {
        Self { state: JobState::Idle }
    }

    pub async fn run(
        &mut self,
        client: &GeminiClient,
        config: &Config,
        image: &Path,
        prompt: &str,
        output: &Path,
    ) -> Result<PathBuf> {
        self.state.begin("editing image");
        let result = async {
            let source = read_image(image)?;
            let request = GenerateRequest::image_edit(source, prompt);
            let reply = client.generate(&config.image_model(), &request).await?;
            let commentary = reply.text();
            if !commentary.is_empty() {
                println!("{commentary}");
            }
            let edited = extract_edited_image(&reply)?;
            std::fs::write(output, edited.decode()?)?;
            Ok(output.to_path_buf())
        }
        .await;
        self.state.settle(&result);
        result
    }
}

/// Pull the first inline image out of an edit reply. A reply with no
/// image parts is a failure, not an empty success.
pub fn extract_edited_image(reply: &GenerateReply) -> Result<Blob> {
    reply
        .inline_images()
        .into_iter()
        .next()
        .cloned()
        .ok_or(OpalError::NoImage)
}

/// A grounded answer: the Markdown body plus its web citations.
#[derive(Debug, Clone)]
pub struct SearchAnswer {
    pub markdown: String,
    pub citations: Vec<GroundingChunk>,
}

/// Search-grounded question answering.
pub struct SearchPanel {
    pub state: JobState<SearchAnswer>,
}

impl SearchPanel {
    pub fn new() -> Self {
        Self { state: JobState::Idle }
    }

    pub async fn run(
        &mut self,
        client: &GeminiClient,
        config: &Config,
        question: &str,
    ) -> Result<SearchAnswer> {
        self.state.begin("asking");
        let result = async {
            let request = GenerateRequest::text(question).with_search();
            let reply = client.generate(&config.search_model(), &request).await?;
            Ok(SearchAnswer {
                markdown: reply.text(),
                citations: reply.grounding.clone(),
            })
        }
        .await;
        self.state.settle(&result);
        result
    }
}
