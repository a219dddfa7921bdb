//! cpal device plumbing: microphone capture and speaker output.
//!
//! cpal streams are not `Send`, so each stream lives on its own dedicated
//! thread; the handles exposed here are plain `Send` types. Capture delivers
//! mono f32 blocks at the requested rate through an unbounded channel, and
//! [`OutputSink`] implements [`PlaybackSink`] over a shared sample timeline
//! driven by the device callback.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use opal_core::error::{OpalError, Result};

use crate::pcm::{downmix_mono, resample_linear};
use crate::scheduler::{PlaybackSink, SourceId};
use crate::AudioBuffer;

/// Handle for a running microphone capture stream. Dropping it (or calling
/// [`CaptureHandle::stop`]) releases the device.
pub struct CaptureHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CaptureHandle {
    /// Release the capture device. Idempotent.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open the default microphone, delivering mono f32 blocks at `target_rate`.
///
/// The device callback downmixes, resamples, and forwards without blocking;
/// if the receiver falls behind, blocks queue in the channel.
pub fn open_capture(target_rate: u32) -> Result<(CaptureHandle, mpsc::UnboundedReceiver<Vec<f32>>)> {
    let (block_tx, block_rx) = mpsc::unbounded_channel::<Vec<f32>>();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<std::result::Result<u32, String>>();
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_thread = shutdown.clone();

    let thread = std::thread::spawn(move || {
        let host = cpal::default_host();
        let device = match host.default_input_device() {
            Some(d) => d,
            None => {
                let _ = ready_tx.send(Err("no input device available".into()));
                return;
            }
        };

        let supported = match device.default_input_config() {
            Ok(c) => c,
            Err(e) => {
                let _ = ready_tx.send(Err(format!("input config: {e}")));
                return;
            }
        };

        let device_rate = supported.sample_rate();
        let channels = supported.channels() as usize;
        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();

        let forward = move |interleaved: &[f32]| {
            let mono = downmix_mono(interleaved, channels);
            let block = resample_linear(&mono, device_rate, target_rate);
            let _ = block_tx.send(block);
        };

        let err_cb = |e: cpal::StreamError| warn!(%e, "Capture stream error");

        let stream = match sample_format {
            cpal::SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| forward(data),
                err_cb,
                None,
            ),
            cpal::SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let floats: Vec<f32> =
                        data.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
                    forward(&floats);
                },
                err_cb,
                None,
            ),
            other => {
                let _ = ready_tx.send(Err(format!("unsupported input format: {other:?}")));
                return;
            }
        };

        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                let _ = ready_tx.send(Err(format!("input stream: {e}")));
                return;
            }
        };

        if let Err(e) = stream.play() {
            let _ = ready_tx.send(Err(format!("input stream start: {e}")));
            return;
        }

        let _ = ready_tx.send(Ok(device_rate));
        debug!(device_rate, channels, "Capture stream running");

        while !shutdown_thread.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(50));
        }
        drop(stream);
    });

    match ready_rx.recv() {
        Ok(Ok(_rate)) => Ok((
            CaptureHandle {
                shutdown,
                thread: Some(thread),
            },
            block_rx,
        )),
        Ok(Err(msg)) => {
            let _ = thread.join();
            Err(OpalError::Audio(msg))
        }
        Err(_) => {
            let _ = thread.join();
            Err(OpalError::Audio("capture thread died during setup".into()))
        }
    }
}

struct TimelineSource {
    id: SourceId,
    start_frame: u64,
    samples: Vec<f32>,
}

#[derive(Default)]
struct Timeline {
    sources: Vec<TimelineSource>,
    finished: Vec<SourceId>,
}

/// Speaker output implementing [`PlaybackSink`].
///
/// Scheduled buffers are placed on a shared sample timeline at their start
/// frame; the device callback mixes every active source and advances the
/// playback clock by frames actually rendered.
pub struct OutputSink {
    shared: Arc<Mutex<Timeline>>,
    frames_rendered: Arc<AtomicU64>,
    device_rate: u32,
    next_id: SourceId,
    shutdown: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl OutputSink {
    /// Open the default output device.
    pub fn open() -> Result<Self> {
        let shared: Arc<Mutex<Timeline>> = Arc::new(Mutex::new(Timeline::default()));
        let frames_rendered = Arc::new(AtomicU64::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<std::result::Result<u32, String>>();

        let shared_thread = shared.clone();
        let frames_thread = frames_rendered.clone();
        let shutdown_thread = shutdown.clone();

        let thread = std::thread::spawn(move || {
            let host = cpal::default_host();
            let device = match host.default_output_device() {
                Some(d) => d,
                None => {
                    let _ = ready_tx.send(Err("no output device available".into()));
                    return;
                }
            };

            let supported = match device.default_output_config() {
                Ok(c) => c,
                Err(e) => {
                    let _ = ready_tx.send(Err(format!("output config: {e}")));
                    return;
                }
            };

            let device_rate = supported.sample_rate();
            let channels = supported.channels() as usize;
            let sample_format = supported.sample_format();
            let config: cpal::StreamConfig = supported.into();

            let err_cb = |e: cpal::StreamError| warn!(%e, "Output stream error");

            let stream = match sample_format {
                cpal::SampleFormat::F32 => {
                    let shared = shared_thread.clone();
                    let frames = frames_thread.clone();
                    device.build_output_stream(
                        &config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            let n = data.len() / channels;
                            let mut mono = vec![0.0f32; n];
                            render_block(&shared, &frames, &mut mono);
                            for (frame, &value) in data.chunks_mut(channels).zip(&mono) {
                                frame.fill(value);
                            }
                        },
                        err_cb,
                        None,
                    )
                }
                cpal::SampleFormat::I16 => {
                    let shared = shared_thread.clone();
                    let frames = frames_thread.clone();
                    device.build_output_stream(
                        &config,
                        move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                            let n = data.len() / channels;
                            let mut mono = vec![0.0f32; n];
                            render_block(&shared, &frames, &mut mono);
                            for (frame, &value) in data.chunks_mut(channels).zip(&mono) {
                                frame.fill((value * i16::MAX as f32) as i16);
                            }
                        },
                        err_cb,
                        None,
                    )
                }
                other => {
                    let _ = ready_tx.send(Err(format!("unsupported output format: {other:?}")));
                    return;
                }
            };

            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(format!("output stream: {e}")));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(format!("output stream start: {e}")));
                return;
            }

            let _ = ready_tx.send(Ok(device_rate));
            debug!(device_rate, channels, "Output stream running");

            while !shutdown_thread.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(50));
            }
            drop(stream);
        });

        match ready_rx.recv() {
            Ok(Ok(device_rate)) => Ok(Self {
                shared,
                frames_rendered,
                device_rate,
                next_id: 0,
                shutdown,
                thread: Some(thread),
            }),
            Ok(Err(msg)) => {
                let _ = thread.join();
                Err(OpalError::Audio(msg))
            }
            Err(_) => {
                let _ = thread.join();
                Err(OpalError::Audio("output thread died during setup".into()))
            }
        }
    }

    /// Release the output device. Idempotent.
    pub fn close(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for OutputSink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Mix every active timeline source into a mono block starting at the
/// current global frame counter, pruning sources that finished.
fn render_block(shared: &Arc<Mutex<Timeline>>, frames: &Arc<AtomicU64>, out: &mut [f32]) {
    let base = frames.fetch_add(out.len() as u64, Ordering::SeqCst);
    let Ok(mut timeline) = shared.lock() else {
        return;
    };

    for (i, slot) in out.iter_mut().enumerate() {
        let t = base + i as u64;
        let mut acc = 0.0f32;
        for src in &timeline.sources {
            if t >= src.start_frame {
                let idx = (t - src.start_frame) as usize;
                if idx < src.samples.len() {
                    acc += src.samples[idx];
                }
            }
        }
        *slot = acc.clamp(-1.0, 1.0);
    }

    let end = base + out.len() as u64;
    let mut done = Vec::new();
    timeline.sources.retain(|src| {
        let finished = end >= src.start_frame + src.samples.len() as u64;
        if finished {
            done.push(src.id);
        }
        !finished
    });
    timeline.finished.extend(done);
}

impl PlaybackSink for OutputSink {
    fn now(&self) -> f64 {
        self.frames_rendered.load(Ordering::SeqCst) as f64 / self.device_rate as f64
    }

    fn start(&mut self, buffer: AudioBuffer, at: f64) -> SourceId {
        let samples = resample_linear(&buffer.samples, buffer.sample_rate, self.device_rate);
        let start_frame = (at * self.device_rate as f64).round() as u64;
        let id = self.next_id;
        self.next_id += 1;

        if let Ok(mut timeline) = self.shared.lock() {
            timeline.sources.push(TimelineSource {
                id,
                start_frame,
                samples,
            });
        }
        id
    }

    fn stop(&mut self, id: SourceId) {
        if let Ok(mut timeline) = self.shared.lock() {
            timeline.sources.retain(|src| src.id != id);
        }
    }

    fn drain_finished(&mut self) -> Vec<SourceId> {
        match self.shared.lock() {
            Ok(mut timeline) => std::mem::take(&mut timeline.finished),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Device-free tests: exercise the timeline mixer directly.

    fn sink_without_device() -> OutputSink {
        OutputSink {
            shared: Arc::new(Mutex::new(Timeline::default())),
            frames_rendered: Arc::new(AtomicU64::new(0)),
            device_rate: 1000,
            next_id: 0,
            shutdown: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    #[test]
    fn test_render_advances_clock() {
        let sink = sink_without_device();
        let mut out = vec![0.0f32; 250];
        render_block(&sink.shared, &sink.frames_rendered, &mut out);
        assert!((sink.now() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_scheduled_source_renders_at_start_frame() {
        let mut sink = sink_without_device();
        let buffer = AudioBuffer {
            samples: vec![0.5; 100],
            sample_rate: 1000,
        };
        sink.start(buffer, 0.1); // frame 100

        let mut out = vec![0.0f32; 100];
        render_block(&sink.shared, &sink.frames_rendered, &mut out);
        assert!(out.iter().all(|&s| s == 0.0), "nothing before start frame");

        render_block(&sink.shared, &sink.frames_rendered, &mut out);
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));

        // Fully rendered now; source reported finished.
        let finished = sink.drain_finished();
        assert_eq!(finished.len(), 1);
    }

    #[test]
    fn test_stop_silences_remaining_samples() {
        let mut sink = sink_without_device();
        let buffer = AudioBuffer {
            samples: vec![0.5; 500],
            sample_rate: 1000,
        };
        let id = sink.start(buffer, 0.0);

        let mut out = vec![0.0f32; 100];
        render_block(&sink.shared, &sink.frames_rendered, &mut out);
        assert!(out[0] > 0.0);

        sink.stop(id);
        render_block(&sink.shared, &sink.frames_rendered, &mut out);
        assert!(out.iter().all(|&s| s == 0.0), "no output after stop");
    }

    #[test]
    fn test_overlapping_sources_mix_and_clamp() {
        let mut sink = sink_without_device();
        for _ in 0..3 {
            sink.start(
                AudioBuffer {
                    samples: vec![0.6; 50],
                    sample_rate: 1000,
                },
                0.0,
            );
        }
        let mut out = vec![0.0f32; 50];
        render_block(&sink.shared, &sink.frames_rendered, &mut out);
        assert!(out.iter().all(|&s| s <= 1.0));
    }
}
