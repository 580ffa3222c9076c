use std::path::Path;

use ndarray::ArrayD;
use ort::execution_providers::CPUExecutionProvider;
use ort::inputs;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{TensorRef, ValueType};

use super::model::{PiperError, VocoderBackend};
use super::tensors::InputTensorSet;

/// Input and output names for the upstream Piper export.
const IDS_INPUT: &str = "input";
const LENGTHS_INPUT: &str = "input_lengths";
const SCALES_INPUT: &str = "scales";
const SPEAKER_INPUT: &str = "sid";
const AUDIO_OUTPUT: &str = "output";

/// Piper VITS model running on ONNX Runtime.
pub struct OnnxBackend {
    session: Session,
    /// True if the model takes a `sid` input (multi-speaker voices)
    has_speaker_input: bool,
    /// True if `input_lengths` is rank 1 (`[batch]`) rather than `[1, 1]`
    flat_lengths: bool,
    /// True if `scales` is rank 1 (`[3]`) rather than `[1, 3]`
    flat_scales: bool,
    /// "output" for upstream exports, otherwise the first model output
    output_name: String,
}

impl OnnxBackend {
    pub fn load(
        onnx_path: &Path,
        num_threads: Option<usize>,
        optimized_cache_path: Option<&Path>,
    ) -> Result<Self, PiperError> {
        if !onnx_path.exists() {
            return Err(PiperError::Initialization(format!(
                "Model file not found at {}",
                onnx_path.display()
            )));
        }
        log::info!("Loading Piper model from {}", onnx_path.display());

        let session = init_session(onnx_path, num_threads, optimized_cache_path)?;

        let has_speaker_input = session.inputs().iter().any(|i| i.name() == SPEAKER_INPUT);
        let flat_lengths = input_rank(&session, LENGTHS_INPUT) == Some(1);
        let flat_scales = input_rank(&session, SCALES_INPUT) == Some(1);
        let output_name = detect_audio_output(&session)?;

        log::info!(
            "Detected: multi_speaker={}, flat_lengths={}, flat_scales={}, output='{}'",
            has_speaker_input,
            flat_lengths,
            flat_scales,
            output_name
        );

        Ok(Self {
            session,
            has_speaker_input,
            flat_lengths,
            flat_scales,
            output_name,
        })
    }
}

impl VocoderBackend for OnnxBackend {
    fn infer(&mut self, tensors: &InputTensorSet) -> Result<ArrayD<f32>, PiperError> {
        let lengths = if self.flat_lengths {
            tensors.lengths.view().into_shape_with_order(1)?.into_dyn()
        } else {
            tensors.lengths.view().into_dyn()
        };
        let scales = if self.flat_scales {
            tensors.scales.view().into_shape_with_order(3)?.into_dyn()
        } else {
            tensors.scales.view().into_dyn()
        };

        let output = if self.has_speaker_input {
            let inputs = inputs![
                IDS_INPUT => TensorRef::from_array_view(tensors.ids.view())?,
                LENGTHS_INPUT => TensorRef::from_array_view(lengths)?,
                SCALES_INPUT => TensorRef::from_array_view(scales)?,
                SPEAKER_INPUT => TensorRef::from_array_view(tensors.speaker_id.view())?,
            ];
            self.session.run(inputs)
        } else {
            let inputs = inputs![
                IDS_INPUT => TensorRef::from_array_view(tensors.ids.view())?,
                LENGTHS_INPUT => TensorRef::from_array_view(lengths)?,
                SCALES_INPUT => TensorRef::from_array_view(scales)?,
            ];
            self.session.run(inputs)
        }
        .map_err(|e| PiperError::Inference(e.to_string()))?;

        let waveform = output[self.output_name.as_str()].try_extract_array::<f32>()?;

        Ok(waveform.to_owned())
    }
}

/// Initialize an ONNX session with optional on-disk graph caching.
///
/// With a cache path, the first load runs Level3 optimization and saves the
/// graph; later loads read it back at `Disable` level.
fn init_session(
    onnx_path: &Path,
    num_threads: Option<usize>,
    optimized_cache_path: Option<&Path>,
) -> Result<Session, PiperError> {
    let providers = vec![CPUExecutionProvider::default().build()];

    let (load_path, opt_level, write_cache) = match optimized_cache_path {
        Some(cache) if cache.exists() => {
            log::info!("Loading pre-optimized Piper graph from {:?}", cache);
            (cache, GraphOptimizationLevel::Disable, None)
        }
        Some(cache) => {
            log::info!(
                "First load: running Level3 optimization; saving graph to {:?}",
                cache
            );
            (onnx_path, GraphOptimizationLevel::Level3, Some(cache))
        }
        None => (onnx_path, GraphOptimizationLevel::Level3, None),
    };

    let mut builder = Session::builder()?
        .with_optimization_level(opt_level)?
        .with_execution_providers(providers)?;

    if let Some(cache) = write_cache {
        builder = builder.with_optimized_model_path(cache)?;
    }

    if let Some(threads) = num_threads {
        builder = builder
            .with_intra_threads(threads)?
            .with_inter_threads(threads)?;
    }

    builder
        .commit_from_file(load_path)
        .map_err(|e| PiperError::Initialization(format!("Failed to load model: {e}")))
}

fn input_rank(session: &Session, name: &str) -> Option<usize> {
    session
        .inputs()
        .iter()
        .find(|input| input.name() == name)
        .and_then(|input| match input.dtype() {
            ValueType::Tensor { shape, .. } => Some(shape.len()),
            _ => None,
        })
}

fn detect_audio_output(session: &Session) -> Result<String, PiperError> {
    let outputs = session.outputs();
    if outputs.iter().any(|output| output.name() == AUDIO_OUTPUT) {
        return Ok(AUDIO_OUTPUT.to_string());
    }
    outputs
        .first()
        .map(|output| output.name().to_string())
        .ok_or_else(|| PiperError::Initialization("Model declares no outputs".to_string()))
}
