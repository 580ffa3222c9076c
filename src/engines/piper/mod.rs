//! Piper text-to-speech engine implementation.
//!
//! This module provides a synthesis engine for Piper voices: VITS models
//! exported to ONNX that turn a sequence of phoneme ids into raw audio. Text
//! is phonemized by espeak-ng (or any [`Phonemizer`]), mapped through the
//! voice's phoneme table, and run through the model.
//!
//! # System Requirements
//!
//! **espeak-ng** must be installed when using the default phonemizer:
//! - **Linux**: `sudo apt-get install espeak-ng`
//! - **macOS**: `brew install espeak-ng`
//! - **Windows**: Download installer from <https://espeak-ng.org/download>
//!
//! # Voice Files
//!
//! ```text
//! models/
//! ├── en_US-amy-low.onnx        # VITS model
//! └── en_US-amy-low.onnx.json   # sample rate, phoneme_id_map, default scales
//! ```
//!
//! Voices: <https://huggingface.co/rhasspy/piper-voices>
//!
//! # Synthesis Parameters
//!
//! | Parameter | Default | Effect |
//! |---|---|---|
//! | `noise_scale` | 0.667 | stochastic timbre variation |
//! | `length_scale` | 1.0 | speaking rate, larger is slower |
//! | `noise_w` | 0.8 | duration-predictor stochasticity |
//! | `speaker_id` | 0 | voice index for multi-speaker models |
//! | `speaker` | `None` | speaker name from the voice config, overrides `speaker_id` |
//!
//! # Examples
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! # #[cfg(feature = "onnx")]
//! # {
//! use piper_tts_rs::{SynthesisEngine, engines::piper::PiperEngine};
//! use std::path::PathBuf;
//!
//! let mut engine = PiperEngine::new();
//! engine.load_model(&PathBuf::from("models/en_US-amy-low.onnx"))?;
//!
//! let result = engine.synthesize("Hello, world!", None)?;
//! println!("Generated {} samples at {}Hz", result.samples.len(), result.sample_rate);
//! # }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## From an Async Runtime
//!
//! ```rust,no_run
//! # #[cfg(feature = "onnx")]
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use piper_tts_rs::{SynthesisEngine, engines::piper::{PiperEngine, PiperInferenceParams}};
//! use std::path::PathBuf;
//!
//! let mut engine = PiperEngine::new();
//! engine.load_model(&PathBuf::from("models/ru_RU-irina-medium.onnx"))?;
//!
//! let params = PiperInferenceParams {
//!     voice: "ru".to_string(),
//!     length_scale: 1.2,
//!     ..engine.default_params().clone()
//! };
//! let wave = engine.generate_speech("Привет!", Some(params)).await?;
//! wave.write_wav(&PathBuf::from("out.wav"))?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod model;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod phonemizer;
pub mod tensors;
pub mod vocab;
pub mod waveform;

pub use config::VoiceConfig;
pub use engine::{
    CancelHandle, IdFraming, PiperEngine, PiperInferenceParams, PiperModelParams,
    PipelineOptions, PipelineOptionsBuilder, SynthesisStage, UnknownPhonemePolicy,
};
pub use model::{ErrorKind, InferenceSession, PiperError, VocoderBackend};
pub use phonemizer::{EspeakPhonemizer, Phonemizer, Tokenization};
pub use tensors::{InputTensorSet, SynthesisParams};
pub use vocab::PhonemeTable;
