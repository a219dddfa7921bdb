//! Conversation state: connection flag, error, and the accumulating
//! transcript pair.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

/// How long after turn completion the transcript text stays visible.
pub const TURN_CLEAR_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub connected: bool,
    pub error: Option<String>,
    /// What the user has said this turn.
    pub user_transcript: String,
    /// What the model has said this turn.
    pub model_transcript: String,
}

impl SessionState {
    pub fn push_user(&mut self, text: &str) {
        self.user_transcript.push_str(text);
    }

    pub fn push_model(&mut self, text: &str) {
        self.model_transcript.push_str(text);
    }

    pub fn clear_transcripts(&mut self) {
        self.user_transcript.clear();
        self.model_transcript.clear();
    }
}

pub type SharedState = Arc<Mutex<SessionState>>;

/// Schedule both transcripts to clear after [`TURN_CLEAR_DELAY`].
///
/// The clear is skipped if the turn generation has moved on by the time the
/// delay elapses (an interruption started a new turn in the meantime).
pub fn spawn_transcript_clear(
    state: SharedState,
    generation: Arc<AtomicU64>,
    expected: u64,
    on_clear: impl FnOnce() + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(TURN_CLEAR_DELAY).await;
        if generation.load(Ordering::SeqCst) != expected {
            return;
        }
        if let Ok(mut s) = state.lock() {
            s.clear_transcripts();
        }
        on_clear();
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_text() -> SharedState {
        let mut s = SessionState::default();
        s.push_user("hello");
        s.push_model("hi there");
        Arc::new(Mutex::new(s))
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_fires_after_exact_delay_not_before() {
        let state = state_with_text();
        let generation = Arc::new(AtomicU64::new(1));
        let handle = spawn_transcript_clear(state.clone(), generation, 1, || {});

        tokio::time::advance(TURN_CLEAR_DELAY - Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(state.lock().unwrap().user_transcript, "hello");

        tokio::time::advance(Duration::from_millis(2)).await;
        handle.await.unwrap();
        let s = state.lock().unwrap();
        assert!(s.user_transcript.is_empty());
        assert!(s.model_transcript.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_clear_is_skipped() {
        let state = state_with_text();
        let generation = Arc::new(AtomicU64::new(1));
        let handle = spawn_transcript_clear(state.clone(), generation.clone(), 1, || {});

        // A new turn starts before the delay elapses.
        generation.store(2, Ordering::SeqCst);
        tokio::time::advance(TURN_CLEAR_DELAY + Duration::from_millis(1)).await;
        handle.await.unwrap();

        assert_eq!(state.lock().unwrap().model_transcript, "hi there");
    }

    #[test]
    fn test_transcript_accumulation() {
        let mut s = SessionState::default();
        s.push_user("one ");
        s.push_user("two");
        assert_eq!(s.user_transcript, "one two");
        s.clear_transcripts();
        assert!(s.user_transcript.is_empty());
    }
}
