use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use derive_builder::Builder;

use crate::{SynthesisEngine, Waveform};

use super::config::VoiceConfig;
use super::model::{InferenceSession, PiperError};
use super::phonemizer::{tokenize, EspeakPhonemizer, Phonemizer, Tokenization};
use super::tensors::{self, InputTensorSet, SynthesisParams};
use super::vocab::PhonemeTable;
use super::waveform;

/// Sample rate of the low-quality Piper voices.
pub const DEFAULT_SAMPLE_RATE: u32 = 16000;

const BOS: &str = "^";
const EOS: &str = "$";
const PAD: &str = "_";

/// Parameters for configuring Piper model loading.
#[derive(Debug, Clone, Default)]
pub struct PiperModelParams {
    /// Number of CPU threads to use for inference.
    /// `None` uses the ORT default (typically all available cores).
    pub num_threads: Option<usize>,
    /// Path for caching the Level3-optimized ONNX graph.
    ///
    /// Always write to a writable location (e.g. app data dir); bundled resource
    /// directories may be read-only.
    pub optimized_model_cache_path: Option<PathBuf>,
    /// Voice config to use instead of `<model>.onnx.json`.
    pub config_path: Option<PathBuf>,
    /// Pipeline behaviour. `None` derives it from the voice config.
    pub options: Option<PipelineOptions>,
}

/// Parameters for configuring a Piper synthesis request.
#[derive(Debug, Clone, PartialEq)]
pub struct PiperInferenceParams {
    /// Phonemizer voice / language (e.g. `"en-us"`, `"ru"`).
    pub voice: String,
    /// Stochastic timbre variation. Default 0.667.
    pub noise_scale: f32,
    /// Speaking rate; larger is slower. Default 1.0.
    pub length_scale: f32,
    /// Duration-predictor stochasticity. Default 0.8.
    pub noise_w: f32,
    /// Speaker for multi-speaker voices, 0 otherwise.
    pub speaker_id: i64,
    /// Named speaker from the voice's `speaker_id_map`; overrides `speaker_id`.
    pub speaker: Option<String>,
}

impl Default for PiperInferenceParams {
    fn default() -> Self {
        let scales = SynthesisParams::default();
        Self {
            voice: "en".to_string(),
            noise_scale: scales.noise_scale,
            length_scale: scales.length_scale,
            noise_w: scales.noise_w,
            speaker_id: scales.speaker_id,
            speaker: None,
        }
    }
}

impl PiperInferenceParams {
    pub fn scales(&self) -> SynthesisParams {
        SynthesisParams {
            noise_scale: self.noise_scale,
            length_scale: self.length_scale,
            noise_w: self.noise_w,
            speaker_id: self.speaker_id,
        }
    }
}

/// What to do with a phoneme that has no entry in the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnknownPhonemePolicy {
    /// Skip it and continue with the remaining phonemes.
    #[default]
    Drop,
    /// Fail the request with [`PiperError::UnknownPhoneme`].
    Fail,
}

/// Extra ids wrapped around the phoneme ids.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdFraming {
    /// Phoneme ids only.
    #[default]
    None,
    /// `^`, then each id followed by `_`, then `$`, as Piper voices are trained.
    Piper,
}

/// Behaviour of the synthesis pipeline, independent of any single request.
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
#[builder(default)]
pub struct PipelineOptions {
    /// Output sample rate; must match the rate the voice was exported at.
    pub sample_rate: u32,
    pub unknown_phonemes: UnknownPhonemePolicy,
    pub tokenization: Tokenization,
    pub framing: IdFraming,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            unknown_phonemes: UnknownPhonemePolicy::Drop,
            tokenization: Tokenization::Whitespace,
            framing: IdFraming::None,
        }
    }
}

impl PipelineOptions {
    /// Options matching how upstream Piper feeds a voice: per-codepoint
    /// lookup, `^ … $` framing with `_` padding, and the voice's sample rate.
    pub fn for_voice(config: &VoiceConfig) -> Self {
        Self {
            sample_rate: config.audio.sample_rate,
            unknown_phonemes: UnknownPhonemePolicy::Drop,
            tokenization: Tokenization::Codepoint,
            framing: IdFraming::Piper,
        }
    }
}

/// Stages a synthesis request moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisStage {
    Idle,
    Phonemizing,
    Mapping,
    BuildingInput,
    Inferring,
    Assembling,
    Done,
    Failed,
}

impl fmt::Display for SynthesisStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Cooperative cancellation for an in-progress request.
///
/// Checked between stages only; a running inference completes and its result
/// is discarded.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), PiperError> {
        if self.is_cancelled() {
            Err(PiperError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Tracks one request through its stages and logs every transition.
struct Request<'a> {
    stage: SynthesisStage,
    cancel: &'a CancelHandle,
}

impl<'a> Request<'a> {
    fn new(cancel: &'a CancelHandle) -> Self {
        Self {
            stage: SynthesisStage::Idle,
            cancel,
        }
    }

    fn enter(&mut self, next: SynthesisStage) -> Result<(), PiperError> {
        self.cancel.check()?;
        log::debug!("Synthesis: {} -> {}", self.stage, next);
        self.stage = next;
        Ok(())
    }

    fn fail(&mut self, err: PiperError) -> PiperError {
        log::warn!("Synthesis failed during {}: {err}", self.stage);
        self.stage = SynthesisStage::Failed;
        err
    }
}

/// Map phoneme tokens to model ids, preserving order.
pub fn map_phonemes<S: AsRef<str>>(
    table: &PhonemeTable,
    tokens: &[S],
    policy: UnknownPhonemePolicy,
) -> Result<Vec<i64>, PiperError> {
    let mut ids = Vec::with_capacity(tokens.len());
    let mut dropped = 0usize;
    for token in tokens {
        let token = token.as_ref();
        match (table.lookup(token), policy) {
            (Some(id), _) => ids.push(id),
            (None, UnknownPhonemePolicy::Drop) => dropped += 1,
            (None, UnknownPhonemePolicy::Fail) => {
                return Err(PiperError::UnknownPhoneme(token.to_string()))
            }
        }
    }
    if dropped > 0 {
        log::warn!(
            "Dropped {dropped} of {} phonemes with no id in the phoneme map",
            tokens.len()
        );
    }
    Ok(ids)
}

/// Wrap ids the way Piper voices expect: `^ id _ id _ … $`.
fn frame_ids(table: &PhonemeTable, ids: Vec<i64>) -> Result<Vec<i64>, PiperError> {
    let meta = |token: &str| {
        table.lookup(token).ok_or_else(|| {
            PiperError::Initialization(format!("Phoneme map has no {token:?} entry"))
        })
    };
    let (bos, eos, pad) = (meta(BOS)?, meta(EOS)?, meta(PAD)?);

    let mut framed = Vec::with_capacity(ids.len() * 2 + 2);
    framed.push(bos);
    for id in ids {
        framed.push(id);
        framed.push(pad);
    }
    framed.push(eos);
    Ok(framed)
}

/// Piper text-to-speech engine.
///
/// Runs text through the phonemizer, the phoneme table, and the vocoder model,
/// one stage after another. Phoneme tables are shared between requests; the
/// model session runs one inference at a time and queues the rest.
///
/// # Quick Start
///
/// ```rust,no_run
/// # #[cfg(feature = "onnx")]
/// # {
/// use piper_tts_rs::{SynthesisEngine, engines::piper::PiperEngine};
/// use std::path::PathBuf;
///
/// // Uses system espeak-ng from PATH
/// let mut engine = PiperEngine::new();
/// engine.load_model(&PathBuf::from("models/en_US-amy-low.onnx"))?;
/// let result = engine.synthesize("Hello, world!", None)?;
/// # }
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct PiperEngine {
    table: Option<Arc<PhonemeTable>>,
    session: Option<Arc<InferenceSession>>,
    phonemizer: Arc<dyn Phonemizer>,
    voice: Option<Arc<VoiceConfig>>,
    options: PipelineOptions,
    defaults: PiperInferenceParams,
    model_path: Option<PathBuf>,
}

impl Default for PiperEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PiperEngine {
    /// Create a new engine that uses `espeak-ng` from PATH.
    pub fn new() -> Self {
        Self::with_phonemizer(EspeakPhonemizer::default())
    }

    /// Create a new engine with explicit espeak-ng binary and data paths.
    ///
    /// Use this when bundling espeak-ng with your application. Either path
    /// can be `None` to fall back to the system default.
    pub fn with_espeak(bin_path: Option<PathBuf>, data_path: Option<PathBuf>) -> Self {
        Self::with_phonemizer(EspeakPhonemizer {
            bin_path,
            data_path,
        })
    }

    /// Create a new engine with any phonemizer.
    pub fn with_phonemizer(phonemizer: impl Phonemizer + 'static) -> Self {
        Self {
            table: None,
            session: None,
            phonemizer: Arc::new(phonemizer),
            voice: None,
            options: PipelineOptions::default(),
            defaults: PiperInferenceParams::default(),
            model_path: None,
        }
    }

    /// Bind a phoneme table and a model session supplied by the host.
    ///
    /// Replaces (and disposes) anything previously loaded.
    pub fn initialize(
        &mut self,
        table: PhonemeTable,
        session: InferenceSession,
        options: PipelineOptions,
    ) -> Result<(), PiperError> {
        if table.is_empty() {
            return Err(PiperError::Initialization(
                "Phoneme map is empty".to_string(),
            ));
        }
        if options.framing == IdFraming::Piper {
            frame_ids(&table, Vec::new())?;
        }
        self.shutdown();
        log::info!(
            "Piper pipeline ready: {} phonemes, {} Hz",
            table.len(),
            options.sample_rate
        );
        self.table = Some(Arc::new(table));
        self.session = Some(Arc::new(session));
        self.options = options;
        Ok(())
    }

    /// Bind a parsed voice config and its model session.
    ///
    /// Takes the phoneme table, request defaults and speaker names from the
    /// config. `options` of `None` uses [`PipelineOptions::for_voice`].
    pub fn initialize_voice(
        &mut self,
        config: VoiceConfig,
        session: InferenceSession,
        options: Option<PipelineOptions>,
    ) -> Result<(), PiperError> {
        let table = config.phoneme_table()?;
        let options = options.unwrap_or_else(|| PipelineOptions::for_voice(&config));
        self.initialize(table, session, options)?;
        if config.is_multi_speaker() {
            log::info!("Voice has {} speakers", config.num_speakers);
        }
        self.defaults = voice_defaults(&config);
        self.voice = Some(Arc::new(config));
        Ok(())
    }

    /// Dispose the model session and forget the phoneme table. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            session.dispose();
        }
        self.table = None;
        self.voice = None;
        self.model_path = None;
    }

    pub fn is_initialized(&self) -> bool {
        self.table.is_some() && self.session.is_some()
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn model_path(&self) -> Option<&Path> {
        self.model_path.as_deref()
    }

    /// Speaker names of the loaded voice, ordered by id. Empty for
    /// single-speaker voices or when no voice config was loaded.
    pub fn speakers(&self) -> Vec<&str> {
        self.voice
            .as_deref()
            .map(VoiceConfig::speakers)
            .unwrap_or_default()
    }

    /// Parameters used when a request does not supply its own.
    pub fn default_params(&self) -> &PiperInferenceParams {
        &self.defaults
    }

    pub fn set_default_params(&mut self, params: PiperInferenceParams) {
        self.defaults = params;
    }

    /// Synthesize speech, running the model on tokio's blocking pool.
    pub async fn generate_speech(
        &self,
        text: &str,
        params: Option<PiperInferenceParams>,
    ) -> Result<Waveform, PiperError> {
        self.generate_speech_with_cancel(text, params, &CancelHandle::new())
            .await
    }

    /// Like [`generate_speech`](Self::generate_speech), abandoning the request
    /// at the next stage boundary once `cancel` is triggered.
    pub async fn generate_speech_with_cancel(
        &self,
        text: &str,
        params: Option<PiperInferenceParams>,
        cancel: &CancelHandle,
    ) -> Result<Waveform, PiperError> {
        let params = params.unwrap_or_else(|| self.defaults.clone());
        let mut request = Request::new(cancel);
        self.run_async(&mut request, text, &params)
            .await
            .map_err(|err| request.fail(err))
    }

    async fn run_async(
        &self,
        request: &mut Request<'_>,
        text: &str,
        params: &PiperInferenceParams,
    ) -> Result<Waveform, PiperError> {
        request.enter(SynthesisStage::Phonemizing)?;
        // espeak-ng is a blocking subprocess; keep it off the async workers.
        let phonemizer = Arc::clone(&self.phonemizer);
        let tokenization = self.options.tokenization;
        let (owned_text, voice) = (text.to_string(), params.voice.clone());
        let phonemes = tokio::task::spawn_blocking(move || {
            phonemizer.phonemize_for(&owned_text, &voice, tokenization)
        })
        .await
        .map_err(|e| PiperError::Phonemization(format!("phonemizer task failed: {e}")))?;
        let phonemes = checked_phonemes(phonemes, text, params)?;

        let inputs = self.build_inputs(request, &phonemes, params)?;
        let session = self.session(request)?;
        let output = session.run(inputs).await?;
        self.finish(request, &output)
    }

    fn synthesize_blocking(
        &self,
        text: &str,
        params: &PiperInferenceParams,
        cancel: &CancelHandle,
    ) -> Result<Waveform, PiperError> {
        let mut request = Request::new(cancel);
        self.run_blocking(&mut request, text, params)
            .map_err(|err| request.fail(err))
    }

    fn run_blocking(
        &self,
        request: &mut Request<'_>,
        text: &str,
        params: &PiperInferenceParams,
    ) -> Result<Waveform, PiperError> {
        request.enter(SynthesisStage::Phonemizing)?;
        let phonemes =
            self.phonemizer
                .phonemize_for(text, &params.voice, self.options.tokenization);
        let phonemes = checked_phonemes(phonemes, text, params)?;

        let inputs = self.build_inputs(request, &phonemes, params)?;
        let session = self.session(request)?;
        let output = session.run_blocking(&inputs)?;
        self.finish(request, &output)
    }

    /// Map phonemes to ids and build the model inputs.
    fn build_inputs(
        &self,
        request: &mut Request<'_>,
        phonemes: &str,
        params: &PiperInferenceParams,
    ) -> Result<InputTensorSet, PiperError> {
        request.enter(SynthesisStage::Mapping)?;
        let table = self.table.as_ref().ok_or(PiperError::ModelNotLoaded)?;
        let tokens = tokenize(phonemes, self.options.tokenization);
        let ids = map_phonemes(table, &tokens, self.options.unknown_phonemes)?;

        request.enter(SynthesisStage::BuildingInput)?;
        if ids.is_empty() {
            return Err(PiperError::EmptySequence);
        }
        let ids = match self.options.framing {
            IdFraming::None => ids,
            IdFraming::Piper => frame_ids(table, ids)?,
        };
        tensors::build(&ids, &self.resolve_scales(params)?)
    }

    /// Model scales for a request, with a named speaker resolved to its id.
    fn resolve_scales(&self, params: &PiperInferenceParams) -> Result<SynthesisParams, PiperError> {
        let mut scales = params.scales();
        if let Some(name) = &params.speaker {
            scales.speaker_id = self
                .voice
                .as_ref()
                .and_then(|voice| voice.speaker_id(name))
                .ok_or_else(|| PiperError::SpeakerNotFound(name.clone()))?;
        }
        Ok(scales)
    }

    fn session(&self, request: &mut Request<'_>) -> Result<Arc<InferenceSession>, PiperError> {
        request.enter(SynthesisStage::Inferring)?;
        self.session.clone().ok_or(PiperError::ModelNotLoaded)
    }

    fn finish(
        &self,
        request: &mut Request<'_>,
        output: &ndarray::ArrayD<f32>,
    ) -> Result<Waveform, PiperError> {
        request.enter(SynthesisStage::Assembling)?;
        let wave = waveform::assemble(output, self.options.sample_rate)?;
        request.enter(SynthesisStage::Done)?;
        log::info!("Synthesized {:.2}s of audio", wave.duration_secs());
        Ok(wave)
    }

    #[cfg(feature = "onnx")]
    fn load_voice(&mut self, model_path: &Path, params: PiperModelParams) -> Result<(), PiperError> {
        let config_path = params
            .config_path
            .clone()
            .unwrap_or_else(|| super::config::config_path_for(model_path));
        let config = VoiceConfig::load(&config_path)?;

        let session = InferenceSession::load(
            model_path,
            params.num_threads,
            params.optimized_model_cache_path.as_deref(),
        )?;

        self.initialize_voice(config, session, params.options)?;
        self.model_path = Some(model_path.to_path_buf());
        Ok(())
    }

    #[cfg(not(feature = "onnx"))]
    fn load_voice(&mut self, model_path: &Path, _params: PiperModelParams) -> Result<(), PiperError> {
        Err(PiperError::Initialization(format!(
            "cannot load {}: built without the `onnx` feature",
            model_path.display()
        )))
    }
}

/// Request defaults recommended by a voice config.
pub fn voice_defaults(config: &VoiceConfig) -> PiperInferenceParams {
    let scales = config.default_params();
    PiperInferenceParams {
        voice: config.espeak_voice().unwrap_or("en").to_string(),
        noise_scale: scales.noise_scale,
        length_scale: scales.length_scale,
        noise_w: scales.noise_w,
        speaker_id: scales.speaker_id,
        speaker: None,
    }
}

/// Normalize a phonemizer result: failures and empty output both become
/// `Phonemization` errors.
fn checked_phonemes(
    phonemes: Result<String, PiperError>,
    text: &str,
    params: &PiperInferenceParams,
) -> Result<String, PiperError> {
    let phonemes = phonemes.map_err(|err| match err {
        PiperError::Phonemization(_) | PiperError::EspeakNotFound => err,
        other => PiperError::Phonemization(other.to_string()),
    })?;
    if phonemes.trim().is_empty() {
        return Err(PiperError::Phonemization(format!(
            "no phonemes produced for {text:?} (voice {:?})",
            params.voice
        )));
    }
    Ok(phonemes)
}

impl Drop for PiperEngine {
    fn drop(&mut self) {
        self.unload_model();
    }
}

impl SynthesisEngine for PiperEngine {
    type SynthesisParams = PiperInferenceParams;
    type ModelParams = PiperModelParams;

    fn load_model_with_params(
        &mut self,
        model_path: &Path,
        params: Self::ModelParams,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.load_voice(model_path, params)?;
        Ok(())
    }

    fn unload_model(&mut self) {
        self.shutdown();
    }

    /// Blocks until the model finishes. Inside a current-thread tokio runtime
    /// this fails with an `Inference` error; use `generate_speech` there.
    fn synthesize(
        &mut self,
        text: &str,
        params: Option<Self::SynthesisParams>,
    ) -> Result<Waveform, Box<dyn std::error::Error>> {
        let params = params.unwrap_or_else(|| self.defaults.clone());
        Ok(self.synthesize_blocking(text, &params, &CancelHandle::new())?)
    }
}
