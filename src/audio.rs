use std::fs::File;
use std::path::Path;

use log::{debug, warn};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::{EngineError, Result};

/// Decode an audio file to mono f32 PCM at `target_sample_rate`.
///
/// WAV files take the direct reader path; everything else goes through the
/// format probe. Multi-channel audio is averaged down to one channel and a
/// mismatched native rate is linearly resampled.
pub fn load_audio(path: &Path, target_sample_rate: u32) -> Result<Vec<f32>> {
    let is_wav = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("wav"));

    let (samples, native_rate) = if is_wav {
        decode_wav(path)?
    } else {
        decode_with_probe(path)?
    };

    debug!(
        "decoded {} samples at {} Hz from {}",
        samples.len(),
        native_rate,
        path.display()
    );
    Ok(resample_linear(&samples, native_rate, target_sample_rate))
}

fn decode_wav(path: &Path) -> Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| EngineError::Decode(format!("{}: {e}", path.display())))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| EngineError::Decode(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| EngineError::Decode(e.to_string()))?
        }
    };

    Ok((mix_to_mono(&interleaved, spec.channels as usize), spec.sample_rate))
}

fn decode_with_probe(path: &Path) -> Result<(Vec<f32>, u32)> {
    let file = File::open(path)
        .map_err(|e| EngineError::Decode(format!("{}: {e}", path.display())))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| EngineError::Decode(format!("unsupported format: {e}")))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL && t.codec_params.sample_rate.is_some())
        .ok_or_else(|| EngineError::Decode("no decodable audio track".to_string()))?;
    let track_id = track.id;
    let native_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| EngineError::Decode("track has no sample rate".to_string()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| EngineError::Decode(format!("failed to create decoder: {e}")))?;

    let mut mono = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::IoError(_)) => break,
            Err(e) => return Err(EngineError::Decode(e.to_string())),
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                mono.extend(mix_to_mono(buf.samples(), spec.channels.count()));
            }
            // A corrupt packet is skipped; the rest of the stream may still
            // decode.
            Err(SymphoniaError::DecodeError(e)) => warn!("decode error, skipping packet: {e}"),
            Err(e) => return Err(EngineError::Decode(e.to_string())),
        }
    }

    Ok((mono, native_rate))
}

fn mix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Linear-interpolation resampler; identity when rates already agree.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let new_len = (samples.len() as f64 / ratio) as usize;
    let mut resampled = Vec::with_capacity(new_len);

    for i in 0..new_len {
        let pos = i as f64 * ratio;
        let idx = pos.floor() as usize;
        let frac = pos.fract() as f32;

        if idx + 1 < samples.len() {
            resampled.push(samples[idx] + frac * (samples[idx + 1] - samples[idx]));
        } else if idx < samples.len() {
            resampled.push(samples[idx]);
        } else {
            break;
        }
    }
    resampled
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resample_is_identity_at_equal_rates() {
        let samples = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_linear(&samples, 44_100, 44_100), samples);
    }

    #[test]
    fn resample_halves_the_sample_count() {
        let samples: Vec<f32> = (0..1000).map(|i| i as f32 / 1000.0).collect();
        let out = resample_linear(&samples, 44_100, 22_050);
        assert!((out.len() as i64 - 500).abs() <= 1);
        // A linear ramp survives linear interpolation.
        assert!((out[100] - samples[200]).abs() < 1e-4);
    }

    #[test]
    fn stereo_mixdown_averages_frames() {
        let interleaved = [1.0, 0.0, 0.5, 0.5, -1.0, 1.0];
        assert_eq!(mix_to_mono(&interleaved, 2), vec![0.5, 0.5, 0.0]);
    }

    #[test]
    fn wav_roundtrip_through_the_loader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..44_100u32 {
            let t = i as f32 / 44_100.0;
            let v = (2.0 * std::f32::consts::PI * 440.0 * t).sin();
            writer.write_sample((v * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();

        let pcm = load_audio(&path, 44_100).unwrap();
        assert_eq!(pcm.len(), 44_100);
        let peak = pcm.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()));
        assert!(peak > 0.9 && peak <= 1.0);
    }

    #[test]
    fn missing_file_is_a_decode_error() {
        let err = load_audio(Path::new("/nonexistent/file.mp3"), 44_100).unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));
    }
}
