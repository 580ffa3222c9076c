use std::path::PathBuf;
use std::time::Instant;

use piper_tts_rs::{
    engines::piper::{PiperEngine, PiperInferenceParams, PiperModelParams},
    SynthesisEngine,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut engine = PiperEngine::new();
    let model_path = PathBuf::from("models/en_US-amy-low.onnx");

    let load_start = Instant::now();
    engine.load_model_with_params(&model_path, PiperModelParams::default())?;
    println!("Model loaded in {:.2?}", load_start.elapsed());
    println!("Sample rate: {} Hz", engine.options().sample_rate);
    let speakers = engine.speakers();
    if !speakers.is_empty() {
        println!("Speakers: {}", speakers.join(", "));
    }

    let text = "Hello! This is Piper, a fast local neural text to speech system.";

    let params = PiperInferenceParams {
        length_scale: 1.1,
        ..engine.default_params().clone()
    };

    let synth_start = Instant::now();
    let result = engine.synthesize(text, Some(params))?;
    let synth_dur = synth_start.elapsed();

    let audio_duration = result.duration_secs();
    let speedup = audio_duration / synth_dur.as_secs_f64();
    println!(
        "Synthesized {:.2}s audio in {:.2?} ({:.1}x real-time)",
        audio_duration, synth_dur, speedup
    );

    engine.synthesize_to_file(text, &PathBuf::from("output.wav"), None)?;
    println!("Saved to output.wav");

    engine.unload_model();
    Ok(())
}
