//! Audio pipeline: PCM codec helpers, gapless playback scheduling,
//! level metering, and cpal device plumbing.

pub mod device;
pub mod meter;
pub mod pcm;
pub mod scheduler;

pub use pcm::AudioBuffer;
pub use scheduler::{PlaybackScheduler, PlaybackSink, SourceId};
