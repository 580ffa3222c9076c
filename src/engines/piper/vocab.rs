use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use super::model::PiperError;

/// Only the `phoneme_id_map` field matters here; a full voice config parses too.
#[derive(Deserialize)]
struct PhonemeMapFile {
    phoneme_id_map: HashMap<String, Vec<i64>>,
}

/// Read-only mapping from phoneme token to model input id.
///
/// Piper voice files map each token to a list of ids; only the first (primary)
/// id is kept. Built once at load time and shared freely between requests.
#[derive(Debug, Clone)]
pub struct PhonemeTable {
    ids: HashMap<String, i64>,
}

impl PhonemeTable {
    /// Load the table from a JSON file containing a `phoneme_id_map` object.
    ///
    /// Accepts both a bare mapping file and a full `<voice>.onnx.json` config.
    pub fn load(path: &Path) -> Result<Self, PiperError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PiperError::Initialization(format!(
                "Failed to read phoneme map {}: {e}",
                path.display()
            ))
        })?;
        let table = Self::from_json(&content)?;
        log::info!(
            "Loaded {} phonemes from {}",
            table.len(),
            path.display()
        );
        Ok(table)
    }

    /// Parse the table from JSON text.
    pub fn from_json(json: &str) -> Result<Self, PiperError> {
        let file: PhonemeMapFile = serde_json::from_str(json)
            .map_err(|e| PiperError::Initialization(format!("Invalid phoneme map: {e}")))?;
        Self::from_id_lists(file.phoneme_id_map)
    }

    /// Build the table from token → id-list pairs, keeping the primary id.
    pub fn from_id_lists<I, K>(entries: I) -> Result<Self, PiperError>
    where
        I: IntoIterator<Item = (K, Vec<i64>)>,
        K: Into<String>,
    {
        let mut ids = HashMap::new();
        for (token, list) in entries {
            let token = token.into();
            let id = *list.first().ok_or_else(|| {
                PiperError::Initialization(format!("Phoneme {token:?} has no ids"))
            })?;
            ids.insert(token, id);
        }
        if ids.is_empty() {
            return Err(PiperError::Initialization(
                "Phoneme map is empty".to_string(),
            ));
        }
        Ok(Self { ids })
    }

    /// Look up the id for a single phoneme token.
    pub fn lookup(&self, token: &str) -> Option<i64> {
        self.ids.get(token).copied()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.ids.contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
impl<K: Into<String>> FromIterator<(K, i64)> for PhonemeTable {
    fn from_iter<T: IntoIterator<Item = (K, i64)>>(iter: T) -> Self {
        Self {
            ids: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}
