use std::collections::HashSet;

use log::debug;
use ordered_float::OrderedFloat;
use rand::seq::IndexedRandom;
use rand::Rng;

use crate::config::{HashMethod, Settings};
use crate::peaks::Peak;

/// One landmark pair, hashed, stamped with its anchor time in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fingerprint {
    pub hash: u32,
    pub time_offset: f32,
}

/// Flag bit separating the two hash layouts in the index.
pub const V2_FLAG: u32 = 1 << 31;

// Log-frequency quantization range in Hz.
const QUANT_MIN_HZ: f32 = 20.0;
const QUANT_MAX_HZ: f32 = 20_000.0;

// Width of the discretized time-delta field.
const TIME_DELTA_BITS: u32 = 10;

/// Turns a peak constellation into landmark-pair hashes.
///
/// Each anchor is paired with up to `fan_value` later peaks inside the
/// `(min_time_delta, max_time_delta)` window. When the window holds more
/// candidates than the fan, half the pairs go to the nearest targets (robust
/// under noise) and the rest are drawn at random from the remainder
/// (discriminative over longer spans).
pub struct FingerprintGenerator {
    fan_value: usize,
    min_time_delta_ms: f32,
    max_time_delta_ms: f32,
    freq_bin_count: u32,
    hash_method: HashMethod,
}

impl FingerprintGenerator {
    pub fn new(settings: &Settings) -> Self {
        Self {
            fan_value: settings.fingerprint.fan_value,
            min_time_delta_ms: settings.fingerprint.min_time_delta_ms,
            max_time_delta_ms: settings.fingerprint.max_time_delta_ms,
            freq_bin_count: settings.fingerprint.freq_bin_count,
            hash_method: settings.fingerprint.hash_method,
        }
    }

    /// Generate with a different hash method than the configured one.
    pub fn with_hash_method(mut self, method: HashMethod) -> Self {
        self.hash_method = method;
        self
    }

    pub fn generate(&self, peaks: &[Peak]) -> Vec<Fingerprint> {
        self.generate_with_rng(peaks, &mut rand::rng())
    }

    /// Deterministic variant for callers that seed their own RNG.
    pub fn generate_with_rng<R: Rng + ?Sized>(
        &self,
        peaks: &[Peak],
        rng: &mut R,
    ) -> Vec<Fingerprint> {
        if peaks.len() < 2 {
            debug!("not enough peaks to form landmark pairs");
            return Vec::new();
        }

        let mut fingerprints = Vec::new();

        for anchor in peaks {
            let window_lo = anchor.time_s + self.min_time_delta_ms / 1000.0;
            let window_hi = anchor.time_s + self.max_time_delta_ms / 1000.0;

            // Strict on both sides, so an anchor never pairs with itself.
            let candidates: Vec<usize> = (0..peaks.len())
                .filter(|&i| {
                    let t = peaks[i].time_s;
                    t > window_lo && t < window_hi
                })
                .collect();
            if candidates.is_empty() {
                continue;
            }

            let targets = if candidates.len() > self.fan_value {
                self.select_targets(&candidates, peaks, anchor, rng)
            } else {
                candidates
            };

            let anchor_bin = self.log_freq_bin(anchor.freq_hz);
            for idx in targets {
                let target = &peaks[idx];
                let dt_ms = (target.time_s - anchor.time_s) * 1000.0;
                let dt_bin = time_delta_bin(dt_ms, self.max_time_delta_ms);

                if self.hash_method.includes_v1() {
                    let target_bin = self.log_freq_bin(target.freq_hz);
                    fingerprints.push(Fingerprint {
                        hash: pack_hash(anchor_bin, target_bin, dt_bin),
                        time_offset: anchor.time_s,
                    });
                }
                if self.hash_method.includes_v2() {
                    let df = (target.freq_hz - anchor.freq_hz).abs();
                    let df_bin = ((df / 50.0) as u32).min((1 << TIME_DELTA_BITS) - 1);
                    fingerprints.push(Fingerprint {
                        hash: pack_hash(anchor_bin, df_bin, dt_bin) | V2_FLAG,
                        time_offset: anchor.time_s,
                    });
                }
            }
        }

        debug!("generated {} fingerprints", fingerprints.len());
        fingerprints
    }

    /// Nearest half by time delta, plus a uniform random draw from the rest.
    fn select_targets<R: Rng + ?Sized>(
        &self,
        candidates: &[usize],
        peaks: &[Peak],
        anchor: &Peak,
        rng: &mut R,
    ) -> Vec<usize> {
        let near_count = self.fan_value / 2;

        let mut by_delta = candidates.to_vec();
        by_delta.sort_by_key(|&i| OrderedFloat(peaks[i].time_s - anchor.time_s));
        by_delta.truncate(near_count);

        let near: HashSet<usize> = by_delta.iter().copied().collect();
        let remaining: Vec<usize> = candidates
            .iter()
            .copied()
            .filter(|i| !near.contains(i))
            .collect();

        let draw = (self.fan_value - by_delta.len()).min(remaining.len());
        by_delta.extend(remaining.choose_multiple(rng, draw).copied());
        by_delta
    }

    /// Quantize a frequency onto a logarithmic scale over [20 Hz, 20 kHz].
    fn log_freq_bin(&self, freq_hz: f32) -> u32 {
        let bounded = freq_hz.clamp(QUANT_MIN_HZ, QUANT_MAX_HZ);
        let span = QUANT_MAX_HZ.ln() - QUANT_MIN_HZ.ln();
        let scaled =
            (bounded.ln() - QUANT_MIN_HZ.ln()) / span * (self.freq_bin_count - 1) as f32;
        (scaled as u32).min(self.freq_bin_count - 1)
    }
}

fn time_delta_bin(dt_ms: f32, max_time_delta_ms: f32) -> u32 {
    let bin_width = max_time_delta_ms / (1 << TIME_DELTA_BITS) as f32;
    ((dt_ms / bin_width) as u32).min((1 << TIME_DELTA_BITS) - 1)
}

/// Layout: `[31: method flag][30..22: anchor bin][21..10: target field]
/// [9..0: time delta bin]`.
fn pack_hash(anchor_bin: u32, target_field: u32, dt_bin: u32) -> u32 {
    ((((anchor_bin & 0xFFF) as u64) << 22
        | ((target_field & 0xFFF) as u64) << 10
        | (dt_bin & 0x3FF) as u64)
        & 0xFFFF_FFFF) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn peak(freq_hz: f32, time_s: f32) -> Peak {
        Peak {
            freq_idx: (freq_hz / 21.5) as usize,
            time_idx: (time_s / 0.0116) as usize,
            amplitude: -5.0,
            freq_hz,
            time_s,
        }
    }

    fn generator(method: HashMethod) -> FingerprintGenerator {
        FingerprintGenerator::new(&Settings::default()).with_hash_method(method)
    }

    #[test]
    fn single_peak_yields_nothing() {
        let fps = generator(HashMethod::Both).generate(&[peak(440.0, 1.0)]);
        assert!(fps.is_empty());
    }

    #[test]
    fn window_is_strict_on_both_sides() {
        // Simultaneous peak and a peak exactly at the window edge: neither
        // qualifies as a target.
        let peaks = [peak(440.0, 1.0), peak(880.0, 1.0), peak(660.0, 1.2)];
        let fps = generator(HashMethod::V1).generate(&peaks);
        assert!(fps.is_empty());
    }

    #[test]
    fn pair_inside_the_window_is_hashed() {
        let peaks = [peak(440.0, 1.0), peak(880.0, 1.1)];
        let fps = generator(HashMethod::V1).generate(&peaks);
        assert_eq!(fps.len(), 1);

        let fp = fps[0];
        assert_eq!(fp.time_offset, 1.0);
        assert_eq!(fp.hash & V2_FLAG, 0);

        // 100 ms into a 200 ms window quantized over 1024 bins.
        assert_eq!(fp.hash & 0x3FF, 512);

        let fingerprinter = generator(HashMethod::V1);
        assert_eq!(fp.hash >> 22, fingerprinter.log_freq_bin(440.0));
        assert_eq!((fp.hash >> 10) & 0xFFF, fingerprinter.log_freq_bin(880.0));
    }

    #[test]
    fn v2_encodes_the_frequency_delta() {
        let peaks = [peak(440.0, 1.0), peak(880.0, 1.1)];
        let fps = generator(HashMethod::V2).generate(&peaks);
        assert_eq!(fps.len(), 1);

        let fp = fps[0];
        assert_eq!(fp.hash & V2_FLAG, V2_FLAG);
        // |880 - 440| at 50 Hz per bin.
        assert_eq!((fp.hash >> 10) & 0xFFF, (440.0f32 / 50.0) as u32);
    }

    #[test]
    fn both_emits_disjoint_hash_spaces() {
        let peaks = [peak(440.0, 1.0), peak(880.0, 1.1), peak(660.0, 1.15)];
        let fps = generator(HashMethod::Both).generate(&peaks);
        assert_eq!(fps.len() % 2, 0);
        assert!(!fps.is_empty());

        let v1: Vec<u32> = fps.iter().map(|f| f.hash).filter(|h| h & V2_FLAG == 0).collect();
        let v2: Vec<u32> = fps.iter().map(|f| f.hash).filter(|h| h & V2_FLAG != 0).collect();
        assert_eq!(v1.len(), v2.len());
        assert!(v1.iter().all(|h| !v2.contains(h)));
    }

    #[test]
    fn fan_value_caps_targets_per_anchor() {
        // One anchor followed by 60 candidates inside the window.
        let mut peaks = vec![peak(440.0, 1.0)];
        for i in 0..60 {
            peaks.push(peak(500.0 + i as f32 * 10.0, 1.001 + i as f32 * 0.003));
        }

        let settings = Settings::default();
        let fingerprinter = FingerprintGenerator::new(&settings).with_hash_method(HashMethod::V1);
        let mut rng = StdRng::seed_from_u64(7);
        let fps = fingerprinter.generate_with_rng(&peaks, &mut rng);

        let from_anchor = fps.iter().filter(|f| f.time_offset == 1.0).count();
        assert_eq!(from_anchor, settings.fingerprint.fan_value);
    }

    #[test]
    fn nearest_targets_are_always_kept() {
        let mut peaks = vec![peak(440.0, 1.0)];
        for i in 0..60 {
            peaks.push(peak(500.0 + i as f32 * 10.0, 1.001 + i as f32 * 0.003));
        }

        let settings = Settings::default();
        let fingerprinter = FingerprintGenerator::new(&settings).with_hash_method(HashMethod::V1);
        let near_count = settings.fingerprint.fan_value / 2;

        // The nearest-half selection is delta ordered, so the smallest
        // `fan / 2` time-delta bins must appear regardless of the seed.
        let mut rng = StdRng::seed_from_u64(99);
        let fps = fingerprinter.generate_with_rng(&peaks, &mut rng);
        let mut dt_bins: Vec<u32> = fps
            .iter()
            .filter(|f| f.time_offset == 1.0)
            .map(|f| f.hash & 0x3FF)
            .collect();
        dt_bins.sort_unstable();

        let expected: Vec<u32> = (0..near_count)
            .map(|i| time_delta_bin((peaks[i + 1].time_s - peaks[0].time_s) * 1000.0, 200.0))
            .collect();
        for bin in expected {
            assert!(dt_bins.contains(&bin), "missing near target bin {bin}");
        }
    }

    #[test]
    fn hashes_are_stable_for_a_fixed_seed() {
        let mut peaks = Vec::new();
        for i in 0..80 {
            peaks.push(peak(300.0 + (i % 9) as f32 * 120.0, i as f32 * 0.004));
        }
        let fingerprinter = generator(HashMethod::Both);

        let a = fingerprinter.generate_with_rng(&peaks, &mut StdRng::seed_from_u64(42));
        let b = fingerprinter.generate_with_rng(&peaks, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn anchor_times_are_preserved() {
        let peaks = [peak(440.0, 2.5), peak(620.0, 2.55), peak(880.0, 2.6)];
        let fps = generator(HashMethod::Both).generate(&peaks);
        assert!(!fps.is_empty());
        assert!(fps.iter().all(|f| f.time_offset >= 2.5 && f.time_offset < 2.7));
    }
}
