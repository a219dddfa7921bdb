//! Live session controller.
//!
//! Owns every resource of the voice path — microphone capture, the playback
//! sink and scheduler, the remote session handles — with an explicit state
//! machine and a single dispatch point for inbound server events. Teardown
//! is idempotent: every release is guarded, so repeated stops are safe.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use opal_core::config::Config;
use opal_core::error::{OpalError, Result};
use opal_gemini::live::{LiveEvents, LiveSender, LiveSession, LiveSetup, ServerContent, ServerEvent};
use opal_audio::device::{self, CaptureHandle, OutputSink};
use opal_audio::meter::{LevelMeter, MeterFrame};
use opal_audio::pcm::{decode_payload, encode_chunk};
use opal_audio::{PlaybackScheduler, PlaybackSink};

use crate::state::{self, SessionState, SharedState};

/// Connection lifecycle of the live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Starting,
    Open,
    Closing,
    Closed,
    Error,
}

/// Events the controller emits for the shell to render.
#[derive(Debug, Clone)]
pub enum LiveEvent {
    Phase(SessionPhase),
    /// Accumulated transcript of the user's speech this turn.
    UserTranscript(String),
    /// Accumulated transcript of the model's speech this turn.
    ModelTranscript(String),
    TurnComplete,
    TranscriptsCleared,
    Interrupted,
    Error {
        at: DateTime<Utc>,
        message: String,
    },
}

type BoxedSink = Box<dyn PlaybackSink + Send>;

pub struct LiveController {
    config: Config,
    phase: SessionPhase,
    state: SharedState,
    /// Bumped when a turn is cut short, so a pending delayed clear from the
    /// previous turn-complete becomes stale.
    turn_generation: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<LiveEvent>,
    cancel: CancellationToken,
    meter: LevelMeter,

    // Resource handles, all guarded for idempotent teardown.
    capture: Option<CaptureHandle>,
    scheduler: Option<PlaybackScheduler<BoxedSink>>,
    sender: Option<LiveSender>,
}

impl LiveController {
    pub fn new(
        config: Config,
        events: mpsc::UnboundedSender<LiveEvent>,
    ) -> (Self, watch::Receiver<MeterFrame>) {
        let (meter, meter_rx) = LevelMeter::new(config.audio().meter_bands);
        (
            Self {
                config,
                phase: SessionPhase::Idle,
                state: Arc::new(Mutex::new(SessionState::default())),
                turn_generation: Arc::new(AtomicU64::new(0)),
                events,
                cancel: CancellationToken::new(),
                meter,
                capture: None,
                scheduler: None,
                sender: None,
            },
            meter_rx,
        )
    }

    /// Token that stops the session when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Snapshot of the conversation state.
    pub fn state(&self) -> SessionState {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Run the session to completion: acquire devices, connect, pump audio
    /// both ways, then tear everything down. Returns once the session is
    /// closed or has failed.
    pub async fn run(&mut self) -> Result<()> {
        let result = match self.open_session().await {
            Ok((capture_rx, server_events)) => {
                self.drive(capture_rx, server_events).await;
                Ok(())
            }
            Err(e) => {
                self.fail(&e.to_string());
                Err(e)
            }
        };

        self.teardown().await;
        result
    }

    /// Idle → Starting: acquire the microphone, build the playback path,
    /// open the remote session.
    async fn open_session(
        &mut self,
    ) -> Result<(mpsc::UnboundedReceiver<Vec<f32>>, LiveEvents)> {
        self.transition(SessionPhase::Starting);

        let api_key = self
            .config
            .gemini()
            .resolve_api_key()
            .ok_or_else(|| OpalError::Config("no Gemini API key configured".into()))?;

        let audio = self.config.audio();
        let (capture, capture_rx) = device::open_capture(audio.capture_rate)?;
        let sink = OutputSink::open()?;
        let scheduler = PlaybackScheduler::new(Box::new(sink) as BoxedSink);

        let setup = LiveSetup::audio(
            &self.config.live_model(),
            &self.config.voice(),
            &self.config.system_instruction(),
        );
        let base_url = self.config.gemini().base_url;
        let session = LiveSession::connect(base_url.as_deref(), &api_key, &setup).await?;
        let (sender, server_events) = session.split();

        self.capture = Some(capture);
        self.scheduler = Some(scheduler);
        self.sender = Some(sender);

        info!(model = %self.config.live_model(), "Live session starting");
        Ok((capture_rx, server_events))
    }

    /// Main loop: forward microphone chunks out, apply server events coming
    /// back, until stopped or the remote side closes.
    async fn drive(
        &mut self,
        mut capture_rx: mpsc::UnboundedReceiver<Vec<f32>>,
        mut server_events: LiveEvents,
    ) {
        let cancel = self.cancel.clone();
        let capture_rate = self.config.audio().capture_rate;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.transition(SessionPhase::Closing);
                    break;
                }
                block = capture_rx.recv() => {
                    match block {
                        Some(block) => self.forward_capture(&block, capture_rate).await,
                        None => {
                            warn!("Capture stream ended unexpectedly");
                            self.transition(SessionPhase::Closing);
                            break;
                        }
                    }
                }
                event = server_events.next_event() => {
                    match event {
                        Some(ServerEvent::Opened) => {
                            info!("Live session open");
                            self.transition(SessionPhase::Open);
                        }
                        Some(ServerEvent::Content(content)) => self.apply_content(content),
                        Some(ServerEvent::Closed { reason }) => {
                            debug!(?reason, "Live session closed by server");
                            break;
                        }
                        Some(ServerEvent::Error(message)) => {
                            self.fail(&message);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// Encode one capture block and forward it. Best-effort: before the
    /// session is open (and on a failed send) the chunk is dropped.
    async fn forward_capture(&mut self, block: &[f32], capture_rate: u32) {
        self.meter.update(block);

        if self.phase != SessionPhase::Open {
            return;
        }
        let Some(sender) = self.sender.as_mut() else {
            return;
        };

        let chunk = encode_chunk(block, capture_rate);
        if let Err(e) = sender.send_audio(&chunk).await {
            debug!(%e, "Dropped audio chunk");
        }
    }

    /// Single dispatch point for server content.
    fn apply_content(&mut self, content: ServerContent) {
        if content.interrupted {
            self.on_interrupted();
        }

        for blob in &content.audio {
            let playback_rate = self.config.audio().playback_rate;
            match decode_payload(blob, playback_rate, 1) {
                Ok(buffer) => {
                    if let Some(scheduler) = self.scheduler.as_mut() {
                        scheduler.schedule(buffer);
                    }
                }
                // A single bad payload is dropped; the session continues.
                Err(e) => warn!(%e, "Dropping undecodable audio payload"),
            }
        }

        if let Some(text) = &content.input_transcript {
            let full = self.with_state(|s| {
                s.push_user(text);
                s.user_transcript.clone()
            });
            self.emit(LiveEvent::UserTranscript(full));
        }

        if let Some(text) = &content.output_transcript {
            let full = self.with_state(|s| {
                s.push_model(text);
                s.model_transcript.clone()
            });
            self.emit(LiveEvent::ModelTranscript(full));
        }

        if content.turn_complete {
            self.on_turn_complete();
        }
    }

    /// Barge-in: flush queued playback immediately and discard the model's
    /// in-progress transcript. Connection state does not change.
    fn on_interrupted(&mut self) {
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.flush();
        }
        self.turn_generation.fetch_add(1, Ordering::SeqCst);
        self.with_state(|s| s.model_transcript.clear());
        self.emit(LiveEvent::Interrupted);
    }

    /// Turn completion schedules a delayed transcript clear; connection
    /// state does not change. Starting a new generation here makes any
    /// clear still pending from the previous turn stale.
    fn on_turn_complete(&mut self) {
        self.emit(LiveEvent::TurnComplete);
        let generation = self.turn_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let events = self.events.clone();
        state::spawn_transcript_clear(
            self.state.clone(),
            self.turn_generation.clone(),
            generation,
            move || {
                let _ = events.send(LiveEvent::TranscriptsCleared);
            },
        );
    }

    /// Release every resource. Safe to call any number of times; every
    /// handle is guarded and left empty afterwards.
    pub async fn teardown(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.flush();
        }
        if let Some(mut sender) = self.sender.take() {
            sender.close().await;
        }
        self.with_state(|s| s.connected = false);

        if !matches!(self.phase, SessionPhase::Error | SessionPhase::Closed) {
            self.transition(SessionPhase::Closed);
        }
    }

    fn transition(&mut self, phase: SessionPhase) {
        if self.phase == phase {
            return;
        }
        debug!(from = ?self.phase, to = ?phase, "Session phase transition");
        self.phase = phase;
        self.with_state(|s| s.connected = phase == SessionPhase::Open);
        self.emit(LiveEvent::Phase(phase));
    }

    fn fail(&mut self, message: &str) {
        warn!(message, "Live session error");
        self.with_state(|s| s.error = Some(message.to_string()));
        self.emit(LiveEvent::Error {
            at: Utc::now(),
            message: message.to_string(),
        });
        self.transition(SessionPhase::Error);
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SessionState) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    fn emit(&self, event: LiveEvent) {
        // Receiver may be gone during shutdown; that's fine.
        let _ = self.events.send(event);
    }
}
