use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use crate::config::{Settings, WindowFunction};
use crate::error::{EngineError, Result};

/// Magnitude spectrogram in decibels relative to the clip maximum.
///
/// `db[f][t]` is the level of frequency bin `f` at frame `t`; `freqs_hz` and
/// `times_s` are the axis labels for the two indices.
#[derive(Debug, Clone)]
pub struct SpectrogramData {
    pub db: Vec<Vec<f32>>,
    pub freqs_hz: Vec<f32>,
    pub times_s: Vec<f32>,
}

impl SpectrogramData {
    pub fn num_bins(&self) -> usize {
        self.db.len()
    }

    pub fn num_frames(&self) -> usize {
        self.db.first().map_or(0, |row| row.len())
    }
}

/// Short-time Fourier transform front end.
pub struct Spectrogram {
    n_fft: usize,
    hop_length: usize,
    sample_rate: u32,
    window: WindowFunction,
}

// Floor applied before log conversion so silence maps to a finite level.
const AMP_FLOOR: f32 = 1e-10;

impl Spectrogram {
    pub fn new(settings: &Settings) -> Self {
        Self {
            n_fft: settings.stft.n_fft,
            hop_length: settings.stft.hop_length,
            sample_rate: settings.audio.sample_rate,
            window: settings.stft.window,
        }
    }

    /// Compute the dB spectrogram of a mono PCM buffer.
    ///
    /// Frames are centered: the signal is zero-padded by `n_fft / 2` on both
    /// sides, so frame `t` is centered on sample `t * hop_length` and
    /// `times_s[t] = t * hop_length / sample_rate`. The same convention is
    /// used on ingest and query, which is all the downstream matcher needs.
    pub fn compute(&self, pcm: &[f32]) -> Result<SpectrogramData> {
        if self.n_fft == 0 || self.hop_length == 0 {
            return Err(EngineError::Config(
                "n_fft and hop_length must be positive".to_string(),
            ));
        }
        if pcm.is_empty() {
            return Err(EngineError::EmptyInput("audio buffer has no samples"));
        }

        let n_fft = self.n_fft;
        let pad = n_fft / 2;
        let padded_len = pcm.len() + 2 * pad;
        let num_frames = (padded_len - n_fft) / self.hop_length + 1;
        let num_bins = n_fft / 2 + 1;

        let window: Vec<f32> = (0..n_fft)
            .map(|i| self.window.coefficient(i, n_fft))
            .collect();

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(n_fft);
        let mut buffer = vec![Complex::new(0.0f32, 0.0f32); n_fft];

        let mut magnitudes = vec![vec![0.0f32; num_frames]; num_bins];
        let mut clip_max = 0.0f32;

        for frame in 0..num_frames {
            let start = frame * self.hop_length;
            for (j, slot) in buffer.iter_mut().enumerate() {
                // Index into the virtual padded signal; outside the real
                // samples the padding is zero.
                let padded_idx = start + j;
                let sample = if padded_idx >= pad && padded_idx - pad < pcm.len() {
                    pcm[padded_idx - pad]
                } else {
                    0.0
                };
                *slot = Complex::new(sample * window[j], 0.0);
            }

            fft.process(&mut buffer);

            for (bin, row) in magnitudes.iter_mut().enumerate().take(num_bins) {
                let mag = buffer[bin].norm();
                row[frame] = mag;
                if mag > clip_max {
                    clip_max = mag;
                }
            }
        }

        let ref_db = 20.0 * clip_max.max(AMP_FLOOR).log10();
        let db = magnitudes
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|mag| 20.0 * mag.max(AMP_FLOOR).log10() - ref_db)
                    .collect()
            })
            .collect();

        let freqs_hz = (0..num_bins)
            .map(|f| f as f32 * self.sample_rate as f32 / n_fft as f32)
            .collect();
        let times_s = (0..num_frames)
            .map(|t| t as f32 * self.hop_length as f32 / self.sample_rate as f32)
            .collect();

        Ok(SpectrogramData { db, freqs_hz, times_s })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn sine(freq: f32, secs: f32, sample_rate: u32) -> Vec<f32> {
        let n = (secs * sample_rate as f32) as usize;
        (0..n)
            .map(|i| (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn empty_buffer_is_rejected() {
        let spec = Spectrogram::new(&Settings::default());
        assert!(matches!(spec.compute(&[]), Err(EngineError::EmptyInput(_))));
    }

    #[test]
    fn zero_hop_is_a_config_error() {
        let mut settings = Settings::default();
        settings.stft.hop_length = 0;
        let spec = Spectrogram::new(&settings);
        assert!(matches!(
            spec.compute(&[0.0; 4096]),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn axes_match_the_stft_grid() {
        let settings = Settings::default();
        let spec = Spectrogram::new(&settings);
        let pcm = sine(440.0, 1.0, settings.audio.sample_rate);
        let data = spec.compute(&pcm).unwrap();

        assert_eq!(data.num_bins(), settings.stft.n_fft / 2 + 1);
        assert_eq!(data.num_frames(), pcm.len() / settings.stft.hop_length + 1);
        assert_eq!(data.freqs_hz[0], 0.0);
        let bin_width = settings.audio.sample_rate as f32 / settings.stft.n_fft as f32;
        assert!((data.freqs_hz[1] - bin_width).abs() < 1e-3);
        assert_eq!(data.times_s[0], 0.0);
        let frame_step = settings.stft.hop_length as f32 / settings.audio.sample_rate as f32;
        assert!((data.times_s[1] - frame_step).abs() < 1e-6);
    }

    #[test]
    fn pure_tone_energy_lands_in_the_right_bin() {
        let settings = Settings::default();
        let spec = Spectrogram::new(&settings);
        let data = spec
            .compute(&sine(440.0, 1.0, settings.audio.sample_rate))
            .unwrap();

        // Strongest bin of a middle frame should be the one closest to 440 Hz.
        let frame = data.num_frames() / 2;
        let loudest = (0..data.num_bins())
            .max_by(|&a, &b| data.db[a][frame].total_cmp(&data.db[b][frame]))
            .unwrap();
        let bin_width = settings.audio.sample_rate as f32 / settings.stft.n_fft as f32;
        assert!((data.freqs_hz[loudest] - 440.0).abs() <= bin_width);
    }

    #[test]
    fn levels_are_relative_to_the_clip_maximum() {
        let settings = Settings::default();
        let spec = Spectrogram::new(&settings);
        let data = spec
            .compute(&sine(1000.0, 0.5, settings.audio.sample_rate))
            .unwrap();

        let max = data
            .db
            .iter()
            .flat_map(|row| row.iter())
            .fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        assert!(max.abs() < 1e-3, "clip maximum should sit at 0 dB, got {max}");
    }
}
