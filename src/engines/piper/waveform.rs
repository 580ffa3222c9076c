use ndarray::ArrayD;

use crate::Waveform;

use super::model::PiperError;

/// Copy the model's audio tensor into an owned [`Waveform`].
///
/// The tensor may be `[1, 1, T]`, `[1, T]` or `[T]`; samples are read in
/// logical order regardless of memory layout. A tensor with no samples is an
/// error rather than a silent clip.
pub fn assemble(output: &ArrayD<f32>, sample_rate: u32) -> Result<Waveform, PiperError> {
    if output.is_empty() {
        return Err(PiperError::EmptyOutput);
    }

    let samples: Vec<f32> = output.iter().copied().collect();
    log::debug!(
        "Assembled {} samples ({:.2}s @ {} Hz)",
        samples.len(),
        samples.len() as f64 / sample_rate as f64,
        sample_rate
    );

    Ok(Waveform {
        samples,
        sample_rate,
    })
}
