//! Command-line decoder for JSON tasks.
//!
//! Usage: `amira-multipass-decoder <task.json> [config.toml|config.yaml] [lattice.slf]`
//!
//! Decodes the task's frames and prints the hypothesis, its segmentation and
//! the lattice as JSON on stdout. With a third argument the lattice is also
//! written there in HTK format.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use serde::Serialize;
use tracing::info;

use amira_multipass_decoder::{
    error::{DecoderError, Result},
    hmm::LogMath,
    metrics,
    telemetry::{init_tracing, TracingConfig},
    Decoder, DecoderConfig, Hypothesis, LatticeExport, Task,
};

#[derive(Serialize)]
struct Output<'a> {
    utterance: String,
    frames: usize,
    hypothesis: &'a Hypothesis,
    lattice: Option<&'a LatticeExport>,
}

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let task_path = args.next().map(PathBuf::from).ok_or_else(|| {
        DecoderError::InvalidInput("usage: amira-multipass-decoder <task.json> [config] [lattice.slf]".to_string())
    })?;

    // Load configuration
    let config = match args.next() {
        Some(path) => DecoderConfig::load_from(&PathBuf::from(path))?,
        None => DecoderConfig::load()?,
    };

    init_tracing(TracingConfig::from(&config))
        .map_err(|e| DecoderError::Configuration(format!("Failed to initialize tracing: {}", e)))?;
    metrics::register_metrics();

    info!("Loading task from {:?}", task_path);
    let htk_path = args.next().map(PathBuf::from);
    let task = Task::load(&task_path)?;
    let logmath = LogMath::new(config.log_base)?;
    let frame_rate = config.frame_rate;
    let models = task.build(logmath)?;
    info!(frames = task.frames.len(), "Task loaded");

    let mut decoder = Decoder::new(
        config,
        models.am,
        models.dict,
        models.lm,
        models.scorer,
    )?;

    let utt = decoder.start_utterance()?;
    for frame in &task.frames {
        decoder.process_frame(frame)?;
    }
    let hypothesis = decoder.end_utterance()?;

    if let (Some(path), Some(lattice)) = (&htk_path, decoder.lattice()) {
        let mut file = BufWriter::new(File::create(path)?);
        lattice.write_htk(&mut file, &logmath, frame_rate)?;
        file.flush()?;
        info!("Wrote lattice to {:?}", path);
    }

    let output = Output {
        utterance: utt.to_string(),
        frames: task.frames.len(),
        hypothesis: &hypothesis,
        lattice: decoder.lattice(),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
