//! Audio format utilities.
//!
//! Conversion to the canonical transcription format (16 kHz mono 16-bit
//! PCM WAV) shells out to `ffmpeg`, which is what browser-recorded webm
//! needs anyway; the sample-to-WAV path wraps `hound` for synth output.

use std::io::Cursor;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const CANONICAL_SAMPLE_RATE: u32 = 16_000;

/// Converts compressed audio bytes (webm/ogg/mp4) into canonical WAV via
/// ffmpeg. Input and output both go through pipes; no scratch files are
/// left behind.
pub async fn convert_to_wav(input: &[u8], input_format: &str) -> Result<Vec<u8>> {
    let mut child = Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            input_format,
            "-i",
            "pipe:0",
            "-acodec",
            "pcm_s16le",
            "-ac",
            "1",
            "-ar",
            "16000",
            "-f",
            "wav",
            "pipe:1",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| Error::Audio(format!("could not start ffmpeg: {err}")))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Audio("ffmpeg stdin unavailable".to_string()))?;
    let input_len = input.len();
    let input = input.to_vec();
    let writer = tokio::spawn(async move {
        let _ = stdin.write_all(&input).await;
        // Dropping stdin closes the pipe so ffmpeg sees EOF.
    });

    let output = child
        .wait_with_output()
        .await
        .map_err(|err| Error::Audio(format!("ffmpeg failed: {err}")))?;
    let _ = writer.await;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Audio(format!(
            "ffmpeg conversion from {input_format} failed: {}",
            stderr.trim()
        )));
    }
    debug!(
        input_bytes = input_len,
        output_bytes = output.stdout.len(),
        "audio converted to canonical wav"
    );
    Ok(output.stdout)
}

/// Encodes float samples as 16-bit PCM WAV. Out-of-range output is
/// normalised; NaN/Inf or all-zero output is rejected as invalid audio.
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    if samples.is_empty() {
        return Err(Error::Audio("no audio samples to encode".to_string()));
    }
    if samples.iter().any(|s| !s.is_finite()) {
        return Err(Error::Audio(
            "audio samples contain NaN or infinite values".to_string(),
        ));
    }
    let peak = samples.iter().fold(0.0f32, |max, s| max.max(s.abs()));
    if peak == 0.0 {
        return Err(Error::Audio("audio samples are all zero".to_string()));
    }
    let scale = if peak > 1.0 {
        warn!(peak, "normalising out-of-range audio");
        1.0 / peak
    } else {
        1.0
    };

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|err| Error::Audio(err.to_string()))?;
        for sample in samples {
            let value = (sample * scale * 32767.0) as i16;
            writer
                .write_sample(value)
                .map_err(|err| Error::Audio(err.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|err| Error::Audio(err.to_string()))?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_samples_as_riff_wav() {
        let samples: Vec<f32> = (0..160).map(|i| (i as f32 / 160.0).sin()).collect();
        let wav = samples_to_wav(&samples, CANONICAL_SAMPLE_RATE).unwrap();
        assert_eq!(&wav[..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
    }

    #[test]
    fn out_of_range_samples_are_normalised_not_rejected() {
        let wav = samples_to_wav(&[2.0, -3.0, 1.0], 22_050).unwrap();
        assert!(!wav.is_empty());
    }

    #[test]
    fn invalid_sample_data_is_rejected() {
        assert!(samples_to_wav(&[], 16_000).is_err());
        assert!(samples_to_wav(&[f32::NAN, 0.1], 16_000).is_err());
        assert!(samples_to_wav(&[0.0, 0.0], 16_000).is_err());
    }
}
