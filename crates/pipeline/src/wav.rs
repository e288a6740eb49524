//! WAV container helpers for the HTTP speech services

use std::io::Cursor;

use voicebot_core::{AudioFrame, Channels, SampleRate};

use crate::PipelineError;

/// Encode mono f32 samples as a 16-bit PCM WAV file
pub fn encode_wav(frame: &AudioFrame) -> Result<Vec<u8>, PipelineError> {
    let spec = hound::WavSpec {
        channels: frame.channels.count() as u16,
        sample_rate: frame.sample_rate.as_u32(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + frame.samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| PipelineError::Audio(format!("WAV header: {}", e)))?;
        for sample in frame.to_pcm16() {
            writer
                .write_sample(sample)
                .map_err(|e| PipelineError::Audio(format!("WAV write: {}", e)))?;
        }
        writer
            .finalize()
            .map_err(|e| PipelineError::Audio(format!("WAV finalize: {}", e)))?;
    }
    Ok(cursor.into_inner())
}

/// Decode a mono WAV file into f32 samples and its sample rate
///
/// Multi-channel input is downmixed by averaging.
pub fn decode_wav(bytes: &[u8]) -> Result<(Vec<f32>, u32), PipelineError> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| PipelineError::Audio(format!("WAV header: {}", e)))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
        }
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>(),
    }
    .map_err(|e| PipelineError::Audio(format!("WAV samples: {}", e)))?;

    let channels = spec.channels.max(1) as usize;
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|c| c.iter().sum::<f32>() / c.len() as f32)
            .collect()
    };

    Ok((samples, spec.sample_rate))
}

/// Split mono samples into ~20ms frames at the nearest supported rate
pub fn into_frames(samples: Vec<f32>, sample_rate: u32, first_sequence: u64) -> Vec<AudioFrame> {
    let (samples, rate) = match SampleRate::from_u32(sample_rate) {
        Some(rate) => (samples, rate),
        None => (
            voicebot_core::audio::resample_linear(&samples, sample_rate, SampleRate::Hz24000.as_u32()),
            SampleRate::Hz24000,
        ),
    };

    let chunk = rate.frame_size_20ms().max(1);
    samples
        .chunks(chunk)
        .enumerate()
        .map(|(i, c)| AudioFrame::new(c.to_vec(), rate, Channels::Mono, first_sequence + i as u64))
        .collect()
}
