//! # piper-tts-rs
//!
//! A Rust library providing text-to-speech synthesis with Piper (VITS) voices.
//!
//! ## Features
//!
//! - **Piper TTS**: phoneme-driven neural synthesis from `.onnx` voice exports
//! - **Async friendly**: inference runs on the blocking pool, one request per session at a time
//! - **Pluggable phonemizers**: espeak-ng out of the box, or any `(text, voice) -> phonemes` function
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! piper-tts-rs = { version = "2026.10", features = ["onnx"] }
//! ```
//!
//! ```ignore
//! use std::path::PathBuf;
//! use piper_tts_rs::{engines::piper::PiperEngine, SynthesisEngine};
//!
//! let mut engine = PiperEngine::new();
//! engine.load_model(&PathBuf::from("models/en_US-amy-low.onnx"))?;
//!
//! let result = engine.synthesize("Hello, world!", None)?;
//! result.write_wav(&PathBuf::from("output.wav"))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod engines;

use std::path::Path;

/// Largest magnitude of a signed 16-bit PCM sample.
const MAX_WAV_VALUE: f32 = 32767.0;

/// The result of a synthesis (text-to-speech) operation.
///
/// Contains raw mono f32 audio samples and the sample rate of the output audio.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    /// Raw audio samples as f32 values, roughly in `[-1, 1]`
    pub samples: Vec<f32>,
    /// Sample rate of the audio in Hz
    pub sample_rate: u32,
}

impl Waveform {
    /// Number of interleaved channels. Piper voices are always mono.
    pub fn channels(&self) -> u16 {
        1
    }

    /// Write the audio to a 32-bit float WAV file.
    pub fn write_wav(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let spec = hound::WavSpec {
            channels: self.channels(),
            sample_rate: self.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for &sample in &self.samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
        Ok(())
    }

    /// Duration of the audio in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Peak-normalised signed 16-bit PCM, for sinks that do not take floats.
    ///
    /// Near-silent clips are not amplified beyond a peak of 0.01.
    pub fn to_i16_pcm(&self) -> Vec<i16> {
        let peak = self
            .samples
            .iter()
            .fold(0.0f32, |acc, &s| acc.max(s.abs()))
            .max(0.01);
        let scale = MAX_WAV_VALUE / peak;
        self.samples
            .iter()
            .map(|&s| (s * scale).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
            .collect()
    }
}

/// Common interface for text-to-speech synthesis engines.
///
/// This trait defines the standard operations that all synthesis engines must support.
/// Each engine may have different parameter types for model loading and inference configuration.
pub trait SynthesisEngine {
    /// Parameters for configuring inference behavior (voice, scales, speaker, etc.)
    type SynthesisParams;
    /// Parameters for configuring model loading (threads, etc.)
    type ModelParams: Default;

    /// Load a model from the specified path using default parameters.
    fn load_model(&mut self, model_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        self.load_model_with_params(model_path, Self::ModelParams::default())
    }

    /// Load a model from the specified path with custom parameters.
    fn load_model_with_params(
        &mut self,
        model_path: &Path,
        params: Self::ModelParams,
    ) -> Result<(), Box<dyn std::error::Error>>;

    /// Unload the currently loaded model and free associated resources.
    fn unload_model(&mut self);

    /// Synthesize speech from the given text.
    fn synthesize(
        &mut self,
        text: &str,
        params: Option<Self::SynthesisParams>,
    ) -> Result<Waveform, Box<dyn std::error::Error>>;

    /// Synthesize speech from the given text and write to a WAV file.
    ///
    /// Default implementation calls `synthesize()` then `Waveform::write_wav()`.
    fn synthesize_to_file(
        &mut self,
        text: &str,
        wav_path: &Path,
        params: Option<Self::SynthesisParams>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.synthesize(text, params)?.write_wav(wav_path)
    }
}

#[cfg(test)]
mod tests {
    use super::Waveform;

    #[test]
    fn duration_follows_sample_rate() {
        let wave = Waveform {
            samples: vec![0.0; 8000],
            sample_rate: 16000,
        };
        assert_eq!(wave.duration_secs(), 0.5);
        assert_eq!(wave.channels(), 1);
    }

    #[test]
    fn pcm_conversion_normalises_to_peak() {
        let wave = Waveform {
            samples: vec![0.5, -0.25, 0.0],
            sample_rate: 22050,
        };
        assert_eq!(wave.to_i16_pcm(), vec![32767, -16383, 0]);
    }

    #[test]
    fn pcm_conversion_does_not_boost_silence() {
        let wave = Waveform {
            samples: vec![0.001, 0.0],
            sample_rate: 22050,
        };
        assert_eq!(wave.to_i16_pcm(), vec![3276, 0]);
    }

    #[test]
    fn writes_float_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let wave = Waveform {
            samples: vec![0.1, -0.1, 0.2],
            sample_rate: 16000,
        };
        wave.write_wav(&path).unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.spec().sample_rate, 16000);
        let read: Vec<f32> = reader.into_samples::<f32>().map(|s| s.unwrap()).collect();
        assert_eq!(read, wave.samples);
    }
}
