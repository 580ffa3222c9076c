use std::borrow::Cow;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use super::model::PiperError;

/// Converts text into a whitespace-separated phoneme string.
///
/// An empty result means the text could not be phonemized; the pipeline
/// reports it as an error rather than synthesizing silence.
pub trait Phonemizer: Send + Sync {
    fn phonemize(&self, text: &str, voice: &str) -> Result<String, PiperError>;

    /// Phonemize for a pipeline that will cut the output with `tokenization`.
    ///
    /// Phonemizers that can shape their output (e.g. separating individual
    /// phonemes with spaces) override this; the default ignores the mode.
    fn phonemize_for(
        &self,
        text: &str,
        voice: &str,
        tokenization: Tokenization,
    ) -> Result<String, PiperError> {
        let _ = tokenization;
        self.phonemize(text, voice)
    }
}

impl<F> Phonemizer for F
where
    F: Fn(&str, &str) -> String + Send + Sync,
{
    fn phonemize(&self, text: &str, voice: &str) -> Result<String, PiperError> {
        Ok(self(text, voice))
    }
}

/// How a phoneme string is cut into table lookups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Tokenization {
    /// Split on whitespace, discarding empty tokens.
    #[default]
    Whitespace,
    /// Every character is a token, as Piper voice maps are keyed. Each run of
    /// whitespace between words becomes a single `" "` word-boundary token.
    Codepoint,
}

const WORD_BOUNDARY: &str = " ";

/// Split a phoneme string into tokens, preserving order.
pub fn tokenize(phonemes: &str, mode: Tokenization) -> Vec<Cow<'_, str>> {
    match mode {
        Tokenization::Whitespace => phonemes.split_whitespace().map(Cow::Borrowed).collect(),
        Tokenization::Codepoint => {
            let mut tokens = Vec::with_capacity(phonemes.len());
            for (i, word) in phonemes.split_whitespace().enumerate() {
                if i > 0 {
                    tokens.push(Cow::Borrowed(WORD_BOUNDARY));
                }
                tokens.extend(
                    word.char_indices()
                        .map(|(idx, ch)| Cow::Borrowed(&word[idx..idx + ch.len_utf8()])),
                );
            }
            tokens
        }
    }
}

/// espeak-ng invoked as a subprocess.
///
/// Either path can be `None` to use `espeak-ng` from PATH and its built-in
/// data directory.
#[derive(Debug, Clone, Default)]
pub struct EspeakPhonemizer {
    pub bin_path: Option<PathBuf>,
    pub data_path: Option<PathBuf>,
}

impl EspeakPhonemizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Command-line arguments; `--sep` spaces out individual phonemes, which
    /// would hide word gaps from codepoint tokenization.
    fn espeak_args(voice: &str, tokenization: Tokenization) -> Vec<&str> {
        let mut args = vec!["--ipa"];
        if tokenization == Tokenization::Whitespace {
            args.push("--sep");
        }
        args.extend(["-q", "--stdin", "-v", voice]);
        args
    }

    fn run_espeak(
        &self,
        input: &str,
        voice: &str,
        tokenization: Tokenization,
    ) -> Result<String, PiperError> {
        let bin = self
            .bin_path
            .as_deref()
            .unwrap_or_else(|| std::path::Path::new("espeak-ng"));
        let mut command = Command::new(bin);
        command.args(Self::espeak_args(voice, tokenization));
        if let Some(data) = &self.data_path {
            command.env("ESPEAK_DATA_PATH", data);
        }

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    PiperError::EspeakNotFound
                } else {
                    PiperError::Io(e)
                }
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // espeak-ng under-processes the last token without a line terminator
            stdin.write_all(canonicalize_espeak_stdin_payload(input).as_bytes())?;
        }

        let output = child.wait_with_output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PiperError::Phonemization(format!(
                "espeak-ng exited with code {:?}: {stderr}",
                output.status.code()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Phonemizer for EspeakPhonemizer {
    fn phonemize(&self, text: &str, voice: &str) -> Result<String, PiperError> {
        self.phonemize_for(text, voice, Tokenization::Whitespace)
    }

    fn phonemize_for(
        &self,
        text: &str,
        voice: &str,
        tokenization: Tokenization,
    ) -> Result<String, PiperError> {
        if text.trim().is_empty() {
            return Ok(String::new());
        }
        let output = self.run_espeak(text, voice, tokenization)?;
        // One output line per clause; join them into a single token stream.
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join(" "))
    }
}

fn canonicalize_espeak_stdin_payload(input: &str) -> Cow<'_, str> {
    if input.ends_with('\n') {
        Cow::Borrowed(input)
    } else {
        Cow::Owned(format!("{input}\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::{
        canonicalize_espeak_stdin_payload, tokenize, EspeakPhonemizer, Phonemizer, Tokenization,
    };
    use std::process::Command;

    fn espeak_available() -> bool {
        Command::new("espeak-ng").arg("--version").output().is_ok()
    }

    #[test]
    fn whitespace_tokens_drop_empties() {
        let tokens = tokenize("  h ə  l oʊ \n", Tokenization::Whitespace);
        assert_eq!(tokens, vec!["h", "ə", "l", "oʊ"]);
    }

    #[test]
    fn codepoint_tokens_split_multichar_phonemes() {
        let tokens = tokenize("hə loʊ", Tokenization::Codepoint);
        assert_eq!(tokens, vec!["h", "ə", " ", "l", "o", "ʊ"]);
    }

    #[test]
    fn codepoint_tokens_collapse_word_gaps() {
        let tokens = tokenize("\n a \t\n b  c\n", Tokenization::Codepoint);
        assert_eq!(tokens, vec!["a", " ", "b", " ", "c"]);
    }

    #[test]
    fn espeak_separates_phonemes_only_for_whitespace_tokens() {
        let whitespace = EspeakPhonemizer::espeak_args("en-us", Tokenization::Whitespace);
        assert!(whitespace.contains(&"--sep"));

        let codepoint = EspeakPhonemizer::espeak_args("en-us", Tokenization::Codepoint);
        assert!(!codepoint.contains(&"--sep"));
        assert_eq!(codepoint.last(), Some(&"en-us"));
    }

    #[test]
    fn closures_are_phonemizers() {
        let fixed = |_: &str, voice: &str| format!("a b {voice}");
        assert_eq!(fixed.phonemize("hi", "en").unwrap(), "a b en");
    }

    #[test]
    fn empty_text_is_not_sent_to_espeak() {
        let phonemizer = EspeakPhonemizer {
            bin_path: Some("/nonexistent/espeak-ng".into()),
            data_path: None,
        };
        assert_eq!(phonemizer.phonemize("   ", "en-us").unwrap(), "");
    }

    #[test]
    fn missing_binary_is_reported() {
        let phonemizer = EspeakPhonemizer {
            bin_path: Some("/nonexistent/espeak-ng".into()),
            data_path: None,
        };
        let err = phonemizer.phonemize("hello", "en-us").unwrap_err();
        assert!(matches!(err, super::PiperError::EspeakNotFound));
    }

    #[test]
    fn appends_trailing_newline_for_espeak_stdin() {
        assert_eq!(canonicalize_espeak_stdin_payload("America"), "America\n");
    }

    #[test]
    fn keeps_single_trailing_newline_for_espeak_stdin() {
        assert_eq!(canonicalize_espeak_stdin_payload("America\n"), "America\n");
    }

    #[test]
    fn espeak_produces_separated_phonemes() {
        // Skip when espeak-ng is unavailable in the execution environment.
        if !espeak_available() {
            return;
        }

        let phonemes = EspeakPhonemizer::new()
            .phonemize("America", "en-us")
            .expect("espeak should succeed");
        assert!(!phonemes.is_empty());
        assert!(phonemes.contains(' '), "phonemes should be space separated: {phonemes:?}");
    }

    #[test]
    fn espeak_output_is_stable_with_or_without_trailing_newline() {
        if !espeak_available() {
            return;
        }

        let phonemizer = EspeakPhonemizer::new();
        let without_newline = phonemizer.phonemize("America", "en-us").unwrap();
        let with_newline = phonemizer.phonemize("America\n", "en-us").unwrap();
        assert_eq!(without_newline, with_newline);
    }
}
