//! Gapless playback scheduling.
//!
//! Buffers arrive from the network in sequence order but at irregular times.
//! The scheduler keeps a single cursor — the earliest time the next buffer
//! may start on the playback clock — so consecutive buffers play back to
//! back with no gaps and no overlap. There is no backpressure: if the
//! producer outpaces the consumer, latency grows.

use std::collections::HashSet;

use tracing::debug;

use crate::pcm::AudioBuffer;

/// Identifier of a scheduled playback source.
pub type SourceId = u64;

/// Output side of the playback path. `now` is the playback clock in seconds;
/// it only moves forward while the sink is rendering.
pub trait PlaybackSink {
    fn now(&self) -> f64;

    /// Begin rendering `buffer` at clock time `at`.
    fn start(&mut self, buffer: AudioBuffer, at: f64) -> SourceId;

    /// Stop a source before it finishes. Stopping an already-finished
    /// source is a no-op.
    fn stop(&mut self, id: SourceId);

    /// Sources that finished rendering since the last call.
    fn drain_finished(&mut self) -> Vec<SourceId> {
        Vec::new()
    }
}

impl<S: PlaybackSink + ?Sized> PlaybackSink for Box<S> {
    fn now(&self) -> f64 {
        (**self).now()
    }

    fn start(&mut self, buffer: AudioBuffer, at: f64) -> SourceId {
        (**self).start(buffer, at)
    }

    fn stop(&mut self, id: SourceId) {
        (**self).stop(id)
    }

    fn drain_finished(&mut self) -> Vec<SourceId> {
        (**self).drain_finished()
    }
}

/// Schedules decoded buffers onto a [`PlaybackSink`] back to back.
pub struct PlaybackScheduler<S: PlaybackSink> {
    sink: S,
    /// Earliest clock time the next buffer may start.
    cursor: f64,
    /// Sources scheduled and not yet known to have finished.
    scheduled: HashSet<SourceId>,
}

impl<S: PlaybackSink> PlaybackScheduler<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            cursor: 0.0,
            scheduled: HashSet::new(),
        }
    }

    /// Schedule a buffer for gapless playback. Returns the assigned start
    /// time: never in the past, never before the previous buffer ends.
    pub fn schedule(&mut self, buffer: AudioBuffer) -> f64 {
        self.reap();

        let start = self.cursor.max(self.sink.now());
        let duration = buffer.duration();
        let id = self.sink.start(buffer, start);
        self.scheduled.insert(id);
        self.cursor = start + duration;
        start
    }

    /// Barge-in: stop every source not yet finished, clear the tracking set,
    /// and reset the cursor so the next buffer starts at "now".
    pub fn flush(&mut self) {
        let n = self.scheduled.len();
        for id in self.scheduled.drain() {
            self.sink.stop(id);
        }
        self.cursor = 0.0;
        if n > 0 {
            debug!(stopped = n, "Flushed scheduled playback");
        }
    }

    /// Drop finished sources from the tracking set.
    pub fn reap(&mut self) {
        for id in self.sink.drain_finished() {
            self.scheduled.remove(&id);
        }
    }

    /// Number of sources currently tracked.
    pub fn scheduled_len(&self) -> usize {
        self.scheduled.len()
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct MockState {
        now: f64,
        next_id: SourceId,
        started: Vec<(SourceId, f64, f64)>, // id, start, duration
        stopped: Vec<SourceId>,
        finished: Vec<SourceId>,
    }

    #[derive(Clone, Default)]
    struct MockSink(Rc<RefCell<MockState>>);

    impl MockSink {
        fn set_now(&self, t: f64) {
            self.0.borrow_mut().now = t;
        }

        fn finish(&self, id: SourceId) {
            self.0.borrow_mut().finished.push(id);
        }
    }

    impl PlaybackSink for MockSink {
        fn now(&self) -> f64 {
            self.0.borrow().now
        }

        fn start(&mut self, buffer: AudioBuffer, at: f64) -> SourceId {
            let mut s = self.0.borrow_mut();
            let id = s.next_id;
            s.next_id += 1;
            s.started.push((id, at, buffer.duration()));
            id
        }

        fn stop(&mut self, id: SourceId) {
            self.0.borrow_mut().stopped.push(id);
        }

        fn drain_finished(&mut self) -> Vec<SourceId> {
            std::mem::take(&mut self.0.borrow_mut().finished)
        }
    }

    fn buffer_ms(ms: u32) -> AudioBuffer {
        AudioBuffer {
            samples: vec![0.0; (24 * ms) as usize],
            sample_rate: 24_000,
        }
    }

    #[test]
    fn test_gapless_ordering_under_jitter() {
        let sink = MockSink::default();
        let mut sched = PlaybackScheduler::new(sink.clone());

        // Buffers arrive at irregular wall times but in sequence order.
        let durations = [100u32, 40, 250, 10, 80];
        let clock_at_arrival = [0.0, 0.02, 0.5, 0.55, 0.56];

        let mut starts = Vec::new();
        for (&ms, &now) in durations.iter().zip(&clock_at_arrival) {
            sink.set_now(now);
            starts.push(sched.schedule(buffer_ms(ms)));
        }

        for (i, window) in starts.windows(2).enumerate() {
            let d = durations[i] as f64 / 1000.0;
            assert!(
                window[1] >= window[0] + d - 1e-9,
                "buffer {} overlaps its predecessor",
                i + 1
            );
        }
        for (s, now) in starts.iter().zip(&clock_at_arrival) {
            assert!(s >= now, "scheduled in the past");
        }
    }

    #[test]
    fn test_cursor_advances_by_duration() {
        let sink = MockSink::default();
        let mut sched = PlaybackScheduler::new(sink.clone());

        let start = sched.schedule(buffer_ms(500));
        assert_eq!(start, 0.0);
        assert!((sched.cursor() - 0.5).abs() < 1e-9);

        let start2 = sched.schedule(buffer_ms(100));
        assert!((start2 - 0.5).abs() < 1e-9);
        assert!((sched.cursor() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_flush_stops_everything_and_resets() {
        let sink = MockSink::default();
        let mut sched = PlaybackScheduler::new(sink.clone());

        sched.schedule(buffer_ms(100));
        sched.schedule(buffer_ms(100));
        sched.schedule(buffer_ms(100));
        assert_eq!(sched.scheduled_len(), 3);

        sched.flush();
        assert_eq!(sched.scheduled_len(), 0);
        assert_eq!(sched.cursor(), 0.0);

        let stopped = sink.0.borrow().stopped.clone();
        assert_eq!(stopped.len(), 3);

        // Next buffer starts at "now", not where the old queue ended.
        sink.set_now(0.07);
        let start = sched.schedule(buffer_ms(50));
        assert!((start - 0.07).abs() < 1e-9);
    }

    #[test]
    fn test_finished_sources_untracked_and_not_stopped() {
        let sink = MockSink::default();
        let mut sched = PlaybackScheduler::new(sink.clone());

        sched.schedule(buffer_ms(10));
        let first_id = sink.0.borrow().started[0].0;
        sink.finish(first_id);

        sched.schedule(buffer_ms(10));
        assert_eq!(sched.scheduled_len(), 1);

        sched.flush();
        let stopped = sink.0.borrow().stopped.clone();
        assert!(!stopped.contains(&first_id));
        assert_eq!(stopped.len(), 1);
    }
}
