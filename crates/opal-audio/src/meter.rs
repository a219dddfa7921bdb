//! Live input level meter.
//!
//! Feeds on capture blocks while a session is active and publishes the
//! latest frame through a watch channel; the shell renders it on its own
//! cadence.

use tokio::sync::watch;

/// One rendered meter frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeterFrame {
    /// RMS level of the most recent block, 0.0..1.0.
    pub rms: f32,
    /// Peak absolute sample of the most recent block, 0.0..1.0.
    pub peak: f32,
    /// Per-band levels across the block, 0.0..1.0 each.
    pub bands: Vec<f32>,
}

pub struct LevelMeter {
    bands: usize,
    tx: watch::Sender<MeterFrame>,
}

impl LevelMeter {
    /// Create a meter with the given band count and a receiver for renderers.
    pub fn new(bands: usize) -> (Self, watch::Receiver<MeterFrame>) {
        let (tx, rx) = watch::channel(MeterFrame {
            bands: vec![0.0; bands.max(1)],
            ..MeterFrame::default()
        });
        (
            Self {
                bands: bands.max(1),
                tx,
            },
            rx,
        )
    }

    /// Fold one capture block into the published frame.
    pub fn update(&self, samples: &[f32]) {
        let frame = self.analyze(samples);
        // Receiver may be gone once the renderer stops; that's fine.
        let _ = self.tx.send(frame);
    }

    fn analyze(&self, samples: &[f32]) -> MeterFrame {
        if samples.is_empty() {
            return MeterFrame {
                bands: vec![0.0; self.bands],
                ..MeterFrame::default()
            };
        }

        let rms = (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt();
        let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));

        let chunk = samples.len().div_ceil(self.bands);
        let mut bands = Vec::with_capacity(self.bands);
        for segment in samples.chunks(chunk) {
            let seg_rms =
                (segment.iter().map(|s| s * s).sum::<f32>() / segment.len() as f32).sqrt();
            bands.push(seg_rms.min(1.0));
        }
        bands.resize(self.bands, 0.0);

        MeterFrame {
            rms: rms.min(1.0),
            peak: peak.min(1.0),
            bands,
        }
    }
}

/// Render a meter frame as a one-line bar string for the terminal.
pub fn render_bar(frame: &MeterFrame, width: usize) -> String {
    let filled = ((frame.rms * width as f32).round() as usize).min(width);
    let mut bar = String::with_capacity(width);
    for i in 0..width {
        bar.push(if i < filled { '█' } else { '·' });
    }
    bar
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_is_zero() {
        let (meter, rx) = LevelMeter::new(8);
        meter.update(&vec![0.0; 512]);
        let frame = rx.borrow().clone();
        assert_eq!(frame.rms, 0.0);
        assert_eq!(frame.peak, 0.0);
        assert!(frame.bands.iter().all(|&b| b == 0.0));
    }

    #[test]
    fn test_full_scale_signal() {
        let (meter, rx) = LevelMeter::new(4);
        let samples: Vec<f32> = (0..512).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        meter.update(&samples);
        let frame = rx.borrow().clone();
        assert!((frame.rms - 1.0).abs() < 1e-3);
        assert_eq!(frame.peak, 1.0);
        assert_eq!(frame.bands.len(), 4);
    }

    #[test]
    fn test_band_count_stable_for_short_blocks() {
        let (meter, rx) = LevelMeter::new(16);
        meter.update(&[0.5, 0.5]);
        assert_eq!(rx.borrow().bands.len(), 16);
    }

    #[test]
    fn test_render_bar_width() {
        let frame = MeterFrame {
            rms: 0.5,
            peak: 0.5,
            bands: vec![],
        };
        let bar = render_bar(&frame, 10);
        assert_eq!(bar.chars().count(), 10);
        assert_eq!(bar.chars().filter(|&c| c == '█').count(), 5);
    }
}
