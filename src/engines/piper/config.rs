use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::model::PiperError;
use super::tensors::SynthesisParams;
use super::vocab::PhonemeTable;

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EspeakVoiceConfig {
    pub voice: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceDefaults {
    pub noise_scale: f32,
    pub length_scale: f32,
    pub noise_w: f32,
}

/// Contents of a Piper `<voice>.onnx.json` file.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceConfig {
    pub audio: AudioConfig,
    #[serde(default)]
    pub espeak: Option<EspeakVoiceConfig>,
    #[serde(default)]
    pub inference: Option<InferenceDefaults>,
    #[serde(default)]
    pub num_speakers: u32,
    #[serde(default)]
    pub speaker_id_map: HashMap<String, i64>,
    pub phoneme_id_map: HashMap<String, Vec<i64>>,
}

impl VoiceConfig {
    pub fn load(path: &Path) -> Result<Self, PiperError> {
        let file = std::fs::File::open(path).map_err(|e| {
            PiperError::Initialization(format!(
                "Failed to open voice config {}: {e}",
                path.display()
            ))
        })?;
        serde_json::from_reader(std::io::BufReader::new(file)).map_err(|e| {
            PiperError::Initialization(format!(
                "Failed to parse voice config {}: {e}",
                path.display()
            ))
        })
    }

    /// Parse a voice config from JSON text.
    pub fn from_json(json: &str) -> Result<Self, PiperError> {
        serde_json::from_str(json)
            .map_err(|e| PiperError::Initialization(format!("Invalid voice config: {e}")))
    }

    /// Build the phoneme table from `phoneme_id_map`.
    pub fn phoneme_table(&self) -> Result<PhonemeTable, PiperError> {
        PhonemeTable::from_id_lists(
            self.phoneme_id_map
                .iter()
                .map(|(token, ids)| (token.clone(), ids.clone())),
        )
    }

    /// Synthesis parameters recommended by the voice, falling back to Piper's defaults.
    pub fn default_params(&self) -> SynthesisParams {
        let mut params = SynthesisParams::default();
        if let Some(inference) = &self.inference {
            params.noise_scale = inference.noise_scale;
            params.length_scale = inference.length_scale;
            params.noise_w = inference.noise_w;
        }
        params
    }

    /// espeak-ng voice the model was trained with.
    pub fn espeak_voice(&self) -> Option<&str> {
        self.espeak.as_ref().map(|e| e.voice.as_str())
    }

    pub fn is_multi_speaker(&self) -> bool {
        self.num_speakers > 1
    }

    /// Resolve a named speaker to its id.
    pub fn speaker_id(&self, name: &str) -> Option<i64> {
        self.speaker_id_map.get(name).copied()
    }

    /// Speaker names sorted by id.
    pub fn speakers(&self) -> Vec<&str> {
        let mut speakers: Vec<(&str, i64)> = self
            .speaker_id_map
            .iter()
            .map(|(name, &id)| (name.as_str(), id))
            .collect();
        speakers.sort_unstable_by_key(|&(_, id)| id);
        speakers.into_iter().map(|(name, _)| name).collect()
    }
}

/// Path of the config that accompanies a model: `voice.onnx` → `voice.onnx.json`.
pub fn config_path_for(onnx_path: &Path) -> PathBuf {
    let mut name = onnx_path.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}
