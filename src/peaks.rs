use log::debug;
use ordered_float::OrderedFloat;

use crate::config::Settings;
use crate::error::Result;
use crate::spectrogram::{Spectrogram, SpectrogramData};

/// A spectral landmark: a strict local maximum of the dB surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub freq_idx: usize,
    pub time_idx: usize,
    pub amplitude: f32,
    pub freq_hz: f32,
    pub time_s: f32,
}

/// Extracts a bounded, well-distributed peak constellation from audio.
pub struct PeakFinder {
    spectrogram: Spectrogram,
    neighborhood: usize,
    threshold_abs_db: f32,
    max_peaks_per_frame: usize,
    max_peaks_total: usize,
    min_frequency: f32,
    max_frequency: f32,
    freq_bins: usize,
}

impl PeakFinder {
    pub fn new(settings: &Settings) -> Self {
        Self {
            spectrogram: Spectrogram::new(settings),
            neighborhood: settings.peaks.neighborhood_size,
            threshold_abs_db: settings.peaks.threshold_abs_db,
            max_peaks_per_frame: settings.peaks.max_peaks_per_frame,
            max_peaks_total: settings.peaks.max_peaks_total,
            min_frequency: settings.peaks.min_frequency,
            max_frequency: settings.peaks.max_frequency,
            freq_bins: settings.peaks.freq_bins,
        }
    }

    /// Spectrogram plus constellation in one call.
    pub fn process(&self, pcm: &[f32]) -> Result<(SpectrogramData, Vec<Peak>)> {
        let data = self.spectrogram.compute(pcm)?;
        let peaks = self.find_peaks(&data);
        Ok((data, peaks))
    }

    /// Run the full candidate -> threshold -> band -> decimation -> cap
    /// cascade over a spectrogram. An empty result is not an error.
    pub fn find_peaks(&self, data: &SpectrogramData) -> Vec<Peak> {
        let candidates = self.local_maxima(data);
        if candidates.is_empty() {
            debug!("no local maxima above {} dB", self.threshold_abs_db);
            return candidates;
        }

        let banded = self.clip_frequency_band(candidates, &data.freqs_hz);
        let decimated = self.decimate_by_log_band(banded);
        let capped = self.limit_peaks_per_frame(decimated);

        let mut peaks = capped;
        if peaks.len() > self.max_peaks_total {
            peaks.truncate(self.max_peaks_total);
        }
        debug!("final peak count: {}", peaks.len());
        peaks
    }

    /// Strict local maxima over a square neighborhood, already filtered by
    /// the absolute dB threshold. Plateaus resolve deterministically: a cell
    /// loses to an equal-valued neighbor at a smaller (freq_idx, time_idx).
    fn local_maxima(&self, data: &SpectrogramData) -> Vec<Peak> {
        let num_bins = data.num_bins();
        let num_frames = data.num_frames();
        let r = self.neighborhood;
        let mut peaks = Vec::new();

        for f in 0..num_bins {
            for t in 0..num_frames {
                let value = data.db[f][t];
                if value <= self.threshold_abs_db {
                    continue;
                }

                let f_lo = f.saturating_sub(r);
                let f_hi = (f + r + 1).min(num_bins);
                let t_lo = t.saturating_sub(r);
                let t_hi = (t + r + 1).min(num_frames);

                let mut is_max = true;
                'window: for nf in f_lo..f_hi {
                    for nt in t_lo..t_hi {
                        if nf == f && nt == t {
                            continue;
                        }
                        let neighbor = data.db[nf][nt];
                        if neighbor > value
                            || (neighbor == value && (nf, nt) < (f, t))
                        {
                            is_max = false;
                            break 'window;
                        }
                    }
                }

                if is_max {
                    peaks.push(Peak {
                        freq_idx: f,
                        time_idx: t,
                        amplitude: value,
                        freq_hz: data.freqs_hz[f],
                        time_s: data.times_s[t],
                    });
                }
            }
        }
        peaks
    }

    /// Keep peaks with `min_frequency <= freq < max_frequency`, computed by
    /// partition points on the ascending frequency axis.
    fn clip_frequency_band(&self, peaks: Vec<Peak>, freqs: &[f32]) -> Vec<Peak> {
        let lo = freqs.partition_point(|&f| f < self.min_frequency);
        let hi = freqs.partition_point(|&f| f <= self.max_frequency);
        peaks
            .into_iter()
            .filter(|p| p.freq_idx >= lo && p.freq_idx < hi)
            .collect()
    }

    /// Split peaks into log-spaced frequency buckets and keep the loudest
    /// few of each, so one loud band cannot monopolize the constellation.
    fn decimate_by_log_band(&self, peaks: Vec<Peak>) -> Vec<Peak> {
        if peaks.is_empty() || self.freq_bins == 0 {
            return peaks;
        }

        let lo = self.min_frequency.max(20.0).log10();
        let hi = self.max_frequency.log10();
        let edges: Vec<f32> = (0..=self.freq_bins)
            .map(|i| 10f32.powf(lo + (hi - lo) * i as f32 / self.freq_bins as f32))
            .collect();

        let mut buckets: Vec<Vec<Peak>> = vec![Vec::new(); self.freq_bins];
        for peak in peaks {
            let idx = edges.partition_point(|&e| e <= peak.freq_hz) as isize - 1;
            let idx = idx.clamp(0, self.freq_bins as isize - 1) as usize;
            buckets[idx].push(peak);
        }

        let keep = (self.max_peaks_total / self.freq_bins).max(5);
        let mut selected = Vec::new();
        for mut bucket in buckets {
            sort_by_amplitude_desc(&mut bucket);
            bucket.truncate(keep);
            selected.extend(bucket);
        }
        selected
    }

    /// Within each time frame keep only the loudest peaks. Frames come back
    /// in ascending time order.
    fn limit_peaks_per_frame(&self, peaks: Vec<Peak>) -> Vec<Peak> {
        if peaks.is_empty() || self.max_peaks_per_frame == 0 {
            return peaks;
        }

        let mut frames: Vec<usize> = peaks.iter().map(|p| p.time_idx).collect();
        frames.sort_unstable();
        frames.dedup();

        let mut selected = Vec::with_capacity(peaks.len());
        for frame in frames {
            let mut in_frame: Vec<Peak> =
                peaks.iter().filter(|p| p.time_idx == frame).copied().collect();
            if in_frame.len() > self.max_peaks_per_frame {
                sort_by_amplitude_desc(&mut in_frame);
                in_frame.truncate(self.max_peaks_per_frame);
            }
            selected.extend(in_frame);
        }
        selected
    }
}

/// Amplitude descending; ties break by lower freq_idx then lower time_idx.
fn sort_by_amplitude_desc(peaks: &mut [Peak]) {
    peaks.sort_by_key(|p| {
        (
            std::cmp::Reverse(OrderedFloat(p.amplitude)),
            p.freq_idx,
            p.time_idx,
        )
    });
}
