use ndarray::{arr1, arr2, Array1, Array2};

use super::model::PiperError;

/// Numeric controls for one synthesis request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynthesisParams {
    /// Stochastic timbre variation.
    pub noise_scale: f32,
    /// Speaking rate; larger is slower.
    pub length_scale: f32,
    /// Duration-predictor stochasticity.
    pub noise_w: f32,
    /// Voice index for multi-speaker models, 0 otherwise.
    pub speaker_id: i64,
}

impl Default for SynthesisParams {
    fn default() -> Self {
        Self {
            noise_scale: 0.667,
            length_scale: 1.0,
            noise_w: 0.8,
            speaker_id: 0,
        }
    }
}

/// The four tensors a Piper VITS export takes as input.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensorSet {
    /// `[1, N]` phoneme ids.
    pub ids: Array2<i64>,
    /// `[1, 1]` holding `N`.
    pub lengths: Array2<i64>,
    /// `[1, 3]` holding `[noise_scale, length_scale, noise_w]`.
    pub scales: Array2<f32>,
    /// `[1]` speaker id.
    pub speaker_id: Array1<i64>,
}

impl InputTensorSet {
    /// Number of phoneme ids in the sequence.
    pub fn sequence_len(&self) -> usize {
        self.ids.ncols()
    }

    /// Scales as `[noise_scale, length_scale, noise_w]`.
    pub fn scale_values(&self) -> [f32; 3] {
        [self.scales[[0, 0]], self.scales[[0, 1]], self.scales[[0, 2]]]
    }
}

/// Build the model inputs for an id sequence.
///
/// The length tensor carries the number of ids actually present, which may be
/// smaller than the phoneme count when unknown phonemes were dropped.
pub fn build(ids: &[i64], params: &SynthesisParams) -> Result<InputTensorSet, PiperError> {
    if ids.is_empty() {
        return Err(PiperError::EmptySequence);
    }

    let seq_len = ids.len();
    let ids = Array2::from_shape_vec((1, seq_len), ids.to_vec())?;
    let lengths = arr2(&[[seq_len as i64]]);
    let scales = arr2(&[[params.noise_scale, params.length_scale, params.noise_w]]);
    let speaker_id = arr1(&[params.speaker_id]);

    Ok(InputTensorSet {
        ids,
        lengths,
        scales,
        speaker_id,
    })
}
