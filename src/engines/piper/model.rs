use std::ops::DerefMut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ndarray::ArrayD;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::Mutex;

use super::tensors::InputTensorSet;

#[derive(thiserror::Error, Debug)]
pub enum PiperError {
    #[cfg(feature = "onnx")]
    #[error("ONNX runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
    #[error("Failed to initialize Piper: {0}")]
    Initialization(String),
    #[error(
        "espeak-ng not found. Install: Linux: `sudo apt-get install espeak-ng`, \
         macOS: `brew install espeak-ng`, Windows: https://espeak-ng.org/download"
    )]
    EspeakNotFound,
    #[error("Phonemization failed: {0}")]
    Phonemization(String),
    #[error("Phoneme {0:?} is not in the phoneme map")]
    UnknownPhoneme(String),
    #[error("No phonemes could be mapped to model ids")]
    EmptySequence,
    #[error("Speaker {0:?} is not defined by this voice")]
    SpeakerNotFound(String),
    #[error("Model not loaded. Call load_model() first.")]
    ModelNotLoaded,
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Model produced no audio samples")]
    EmptyOutput,
    #[error("Synthesis request was cancelled")]
    Cancelled,
}

/// Coarse classification of a [`PiperError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Model or phoneme map missing or corrupt. Fatal for the engine instance.
    Initialization,
    /// The phonemizer failed or produced nothing.
    Phonemization,
    /// No phoneme mapped to a known id.
    EmptySequence,
    /// The request itself is invalid for the loaded voice.
    InvalidRequest,
    /// The backend failed while running the model.
    Inference,
    /// The model ran but produced zero samples.
    EmptyOutput,
    /// The caller abandoned the request.
    Cancelled,
}

impl PiperError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            #[cfg(feature = "onnx")]
            PiperError::Ort(_) => ErrorKind::Inference,
            PiperError::Io(_)
            | PiperError::Json(_)
            | PiperError::Initialization(_)
            | PiperError::ModelNotLoaded => ErrorKind::Initialization,
            PiperError::EspeakNotFound | PiperError::Phonemization(_) => ErrorKind::Phonemization,
            PiperError::UnknownPhoneme(_) | PiperError::EmptySequence => ErrorKind::EmptySequence,
            PiperError::Shape(_) | PiperError::Wav(_) | PiperError::Inference(_) => {
                ErrorKind::Inference
            }
            PiperError::SpeakerNotFound(_) => ErrorKind::InvalidRequest,
            PiperError::EmptyOutput => ErrorKind::EmptyOutput,
            PiperError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// A loaded vocoder that turns an [`InputTensorSet`] into raw audio.
///
/// Backends are not reentrant; [`InferenceSession`] guarantees `infer` is never
/// called concurrently on the same instance.
pub trait VocoderBackend: Send {
    fn infer(&mut self, inputs: &InputTensorSet) -> Result<ArrayD<f32>, PiperError>;
}

type BackendSlot = Option<Box<dyn VocoderBackend>>;

/// Owns a loaded backend and serializes inference on it.
///
/// Requests queue on a fair lock in arrival order. The blocking model call runs
/// on tokio's blocking pool so async callers are never stalled by it.
pub struct InferenceSession {
    backend: Arc<Mutex<BackendSlot>>,
    disposed: Arc<AtomicBool>,
}

impl InferenceSession {
    pub fn new(backend: Box<dyn VocoderBackend>) -> Self {
        Self {
            backend: Arc::new(Mutex::new(Some(backend))),
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Load a Piper `.onnx` export with ONNX Runtime.
    #[cfg(feature = "onnx")]
    pub fn load(
        onnx_path: &std::path::Path,
        num_threads: Option<usize>,
        optimized_cache_path: Option<&std::path::Path>,
    ) -> Result<Self, PiperError> {
        let backend = super::onnx::OnnxBackend::load(onnx_path, num_threads, optimized_cache_path)?;
        Ok(Self::new(Box::new(backend)))
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Run inference from an async context.
    ///
    /// Waits for earlier requests to finish, then runs the model on the
    /// blocking pool. Dropping the returned future while the model is running
    /// does not interrupt it; the result is discarded.
    pub async fn run(&self, inputs: InputTensorSet) -> Result<ArrayD<f32>, PiperError> {
        if self.is_disposed() {
            return Err(PiperError::ModelNotLoaded);
        }
        let guard = Arc::clone(&self.backend).lock_owned().await;
        let backend = Arc::clone(&self.backend);
        let disposed = Arc::clone(&self.disposed);

        tokio::task::spawn_blocking(move || run_locked(guard, &backend, &disposed, &inputs))
            .await
            .map_err(|e| PiperError::Inference(format!("inference task failed: {e}")))?
    }

    /// Run inference on the current thread.
    ///
    /// Outside a runtime this simply blocks. On a multi-thread runtime the
    /// worker is handed off with `block_in_place` first. A current-thread
    /// runtime cannot be blocked, so the call fails instead.
    pub fn run_blocking(&self, inputs: &InputTensorSet) -> Result<ArrayD<f32>, PiperError> {
        if self.is_disposed() {
            return Err(PiperError::ModelNotLoaded);
        }
        match Handle::try_current().map(|handle| handle.runtime_flavor()) {
            Err(_) => self.run_on_current_thread(inputs),
            Ok(RuntimeFlavor::MultiThread) => {
                tokio::task::block_in_place(|| self.run_on_current_thread(inputs))
            }
            Ok(_) => Err(PiperError::Inference(
                "blocking synthesis called inside a current-thread async runtime; \
                 use generate_speech"
                    .to_string(),
            )),
        }
    }

    fn run_on_current_thread(&self, inputs: &InputTensorSet) -> Result<ArrayD<f32>, PiperError> {
        let slot = self.backend.blocking_lock();
        run_locked(slot, &self.backend, &self.disposed, inputs)
    }

    /// Release the backend.
    ///
    /// Returns `true` on the call that actually disposed the session. If a
    /// request is in flight the backend is released as soon as it completes.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        release_if_disposed(&self.backend, &self.disposed);
        log::info!("Inference session disposed");
        true
    }
}

impl Drop for InferenceSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Run one inference while holding the backend lock.
///
/// Whoever holds the lock when `disposed` is set is responsible for the
/// release: the flag is checked on entry, and again after the lock is dropped.
fn run_locked<G>(
    mut slot: G,
    backend: &Mutex<BackendSlot>,
    disposed: &AtomicBool,
    inputs: &InputTensorSet,
) -> Result<ArrayD<f32>, PiperError>
where
    G: DerefMut<Target = BackendSlot>,
{
    if disposed.load(Ordering::SeqCst) {
        slot.take();
        return Err(PiperError::ModelNotLoaded);
    }
    let result = infer_slot(&mut slot, inputs);
    drop(slot);
    release_if_disposed(backend, disposed);
    result
}

/// Drop the backend if the session is disposed and nobody holds the lock.
/// A current holder performs the release itself in `run_locked`.
fn release_if_disposed(backend: &Mutex<BackendSlot>, disposed: &AtomicBool) {
    if !disposed.load(Ordering::SeqCst) {
        return;
    }
    if let Ok(mut slot) = backend.try_lock() {
        slot.take();
    }
}

fn infer_slot(slot: &mut BackendSlot, inputs: &InputTensorSet) -> Result<ArrayD<f32>, PiperError> {
    let backend = slot.as_mut().ok_or(PiperError::ModelNotLoaded)?;
    let timer = std::time::Instant::now();
    let output = backend.infer(inputs)?;
    log::debug!(
        "Inference on {} ids took {:.2?}",
        inputs.sequence_len(),
        timer.elapsed()
    );
    Ok(output)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use ndarray::{ArrayD, IxDyn};

    use super::{ErrorKind, InferenceSession, PiperError, VocoderBackend};
    use crate::engines::piper::tensors::{build, InputTensorSet, SynthesisParams};

    /// Deterministic stand-in for a VITS model: `ids × length_scale × 100`
    /// samples, each derived from the ids and scales only.
    pub(crate) struct FakeVocoder {
        pub calls: Arc<AtomicUsize>,
        pub drops: Arc<AtomicUsize>,
        pub active: Arc<AtomicUsize>,
        pub delay: Duration,
        pub fail: bool,
    }

    impl FakeVocoder {
        pub(crate) fn new() -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                drops: Arc::new(AtomicUsize::new(0)),
                active: Arc::new(AtomicUsize::new(0)),
                delay: Duration::ZERO,
                fail: false,
            }
        }
    }

    impl VocoderBackend for FakeVocoder {
        fn infer(&mut self, inputs: &InputTensorSet) -> Result<ArrayD<f32>, PiperError> {
            let concurrent = self.active.fetch_add(1, Ordering::SeqCst);
            assert_eq!(concurrent, 0, "backend entered concurrently");
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.fail {
                return Err(PiperError::Inference("backend exploded".to_string()));
            }
            let [noise, length, _] = inputs.scale_values();
            let n = (inputs.sequence_len() as f32 * length * 100.0).round() as usize;
            let seed: i64 = inputs.ids.iter().sum::<i64>() + inputs.speaker_id[0] * 1000;
            let samples = (0..n)
                .map(|i| ((i as f32 + seed as f32) * 0.01).sin() * noise)
                .collect();
            Ok(ArrayD::from_shape_vec(IxDyn(&[1, 1, n]), samples)?)
        }
    }

    impl Drop for FakeVocoder {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn error_kinds_follow_taxonomy() {
        assert_eq!(PiperError::ModelNotLoaded.kind(), ErrorKind::Initialization);
        assert_eq!(
            PiperError::Phonemization("x".into()).kind(),
            ErrorKind::Phonemization
        );
        assert_eq!(PiperError::EmptySequence.kind(), ErrorKind::EmptySequence);
        assert_eq!(
            PiperError::UnknownPhoneme("q".into()).kind(),
            ErrorKind::EmptySequence
        );
        assert_eq!(PiperError::Inference("x".into()).kind(), ErrorKind::Inference);
        assert_eq!(PiperError::EmptyOutput.kind(), ErrorKind::EmptyOutput);
        assert_eq!(PiperError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            PiperError::SpeakerNotFound("zed".into()).kind(),
            ErrorKind::InvalidRequest
        );
    }

    #[test]
    fn blocking_run_is_deterministic() {
        let session = InferenceSession::new(Box::new(FakeVocoder::new()));
        let inputs = build(&[3, 1, 4], &SynthesisParams::default()).unwrap();
        let a = session.run_blocking(&inputs).unwrap();
        let b = session.run_blocking(&inputs).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 300);
    }

    #[test]
    fn dispose_releases_exactly_once() {
        let fake = FakeVocoder::new();
        let drops = Arc::clone(&fake.drops);
        let session = InferenceSession::new(Box::new(fake));

        assert!(session.dispose());
        assert!(!session.dispose());
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        drop(session);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispose_after_failed_request() {
        let mut fake = FakeVocoder::new();
        fake.fail = true;
        let drops = Arc::clone(&fake.drops);
        let session = InferenceSession::new(Box::new(fake));

        let inputs = build(&[1], &SynthesisParams::default()).unwrap();
        let err = session.run_blocking(&inputs).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Inference);

        assert!(session.dispose());
        assert!(!session.dispose());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disposed_session_reports_not_loaded() {
        let session = InferenceSession::new(Box::new(FakeVocoder::new()));
        session.dispose();
        let inputs = build(&[1], &SynthesisParams::default()).unwrap();
        assert!(matches!(
            session.run_blocking(&inputs),
            Err(PiperError::ModelNotLoaded)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_requests_are_serialized() {
        let mut fake = FakeVocoder::new();
        fake.delay = Duration::from_millis(20);
        let calls = Arc::clone(&fake.calls);
        let session = Arc::new(InferenceSession::new(Box::new(fake)));

        let mut handles = Vec::new();
        for i in 1..=4 {
            let session = Arc::clone(&session);
            handles.push(tokio::spawn(async move {
                let inputs = build(&[i], &SynthesisParams::default()).unwrap();
                session.run(inputs).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().len(), 100);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dispose_during_inference_releases_on_completion() {
        let mut fake = FakeVocoder::new();
        fake.delay = Duration::from_millis(100);
        let drops = Arc::clone(&fake.drops);
        let calls = Arc::clone(&fake.calls);
        let session = Arc::new(InferenceSession::new(Box::new(fake)));

        let running = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let inputs = build(&[1, 2], &SynthesisParams::default()).unwrap();
                session.run(inputs).await
            })
        };
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(session.dispose());
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        assert!(running.await.unwrap().is_ok());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(!session.dispose());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dispose_with_queued_request_releases_backend() {
        let mut fake = FakeVocoder::new();
        fake.delay = Duration::from_millis(150);
        let drops = Arc::clone(&fake.drops);
        let calls = Arc::clone(&fake.calls);
        let session = Arc::new(InferenceSession::new(Box::new(fake)));

        let spawn_request = |ids: Vec<i64>| {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let inputs = build(&ids, &SynthesisParams::default()).unwrap();
                session.run(inputs).await
            })
        };
        let first = spawn_request(vec![1]);
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let queued = spawn_request(vec![2]);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(session.dispose());
        assert!(first.await.unwrap().is_ok());
        assert!(matches!(
            queued.await.unwrap(),
            Err(PiperError::ModelNotLoaded)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn blocking_run_inside_current_thread_runtime_is_an_error() {
        let session = InferenceSession::new(Box::new(FakeVocoder::new()));
        let inputs = build(&[1], &SynthesisParams::default()).unwrap();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();

        let result = runtime.block_on(async { session.run_blocking(&inputs) });
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Inference);

        // Still usable once outside the runtime.
        assert_eq!(session.run_blocking(&inputs).unwrap().len(), 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_run_inside_multi_thread_runtime_succeeds() {
        let session = InferenceSession::new(Box::new(FakeVocoder::new()));
        let inputs = build(&[1, 2], &SynthesisParams::default()).unwrap();
        assert_eq!(session.run_blocking(&inputs).unwrap().len(), 200);
    }
}
