//! Speech synthesis engines.
//!
//! This module contains implementations of text-to-speech engines.
//!
//! # Available Engines
//!
//! - `piper` - Piper VITS voices. The ONNX Runtime backend is enabled with the
//!   `onnx` Cargo feature; without it a custom [`piper::VocoderBackend`] must be supplied.

pub mod piper;
