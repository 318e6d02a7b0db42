// Pipeline configuration.
//
// Every tunable parameter of the three entry points lives in `PipelineConfig`:
// where the corpus and artifacts are, how training windows and the network
// are shaped, how generation samples, and how the output file is laid out.
// The defaults reproduce the reference behaviour (50-token windows, 20 epochs
// of batch 64 with patience 5, 400 generated tokens, 100 BPM piano at half a
// beat per token). A JSON file may override any subset of fields; missing
// fields keep their defaults. CLI flags in `main.rs` are applied on top.
//
// `validate()` is called by each entry point before any work starts, so bad
// values fail fast with `InvalidConfig` instead of deep inside a phase.

use crate::error::{CadenzaError, Result};
use crate::generate::TemperatureSchedule;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Shape of the training windows, the network, and the optimizer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Context window length in tokens.
    pub sequence_length: usize,
    /// Upper bound on passes over the example set.
    pub epochs: usize,
    pub batch_size: usize,
    /// Consecutive non-improving epochs tolerated before stopping early.
    /// 0 disables early stopping.
    pub patience: usize,
    /// Minimum loss decrease that counts as an improvement.
    pub min_delta: f32,
    /// Recurrent state width.
    pub hidden_size: usize,
    /// Adam step size.
    pub learning_rate: f32,
    /// Global gradient norm ceiling per batch.
    pub clip_norm: f32,
    /// Seed for weight initialization and shuffling. `None` draws one from
    /// the clock.
    pub seed: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            sequence_length: 50,
            epochs: 20,
            batch_size: 64,
            patience: 5,
            min_delta: 0.0,
            hidden_size: 128,
            learning_rate: 0.001,
            clip_norm: 5.0,
            seed: None,
        }
    }
}

/// Autoregressive sampling parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Number of tokens to synthesize.
    pub num_notes: usize,
    pub output_file: PathBuf,
    pub temperature: TemperatureSchedule,
    /// Seed for the seed-window draw and sampling. `None` uses the clock.
    pub seed: Option<u64>,
    /// Log progress every this many tokens. 0 silences progress.
    pub progress_every: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        GenerationConfig {
            num_notes: 400,
            output_file: PathBuf::from("output/generated_music.mid"),
            temperature: TemperatureSchedule::default(),
            seed: None,
            progress_every: 100,
        }
    }
}

/// Layout of the written MIDI file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub tempo_bpm: u16,
    /// General MIDI program (0 = acoustic grand piano).
    pub program: u8,
    /// Beats between consecutive emitted events.
    pub step_beats: f64,
    /// Sounding length of each event in beats.
    pub note_beats: f64,
    pub velocity: u8,
    pub ticks_per_quarter: u16,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            tempo_bpm: 100,
            program: 0,
            step_beats: 0.5,
            note_beats: 1.0,
            velocity: 90,
            ticks_per_quarter: 480,
        }
    }
}

/// Complete configuration for preprocess, train and generate.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory scanned for `.mid` / `.midi` files.
    pub corpus_dir: PathBuf,
    /// Directory holding `notes.json`, `vocab.json` and `model.json`.
    pub artifacts_dir: PathBuf,
    pub training: TrainingConfig,
    pub generation: GenerationConfig,
    pub output: OutputConfig,
}

impl PipelineConfig {
    /// Defaults with the conventional directory layout.
    pub fn standard() -> Self {
        PipelineConfig {
            corpus_dir: PathBuf::from("data/midi_files"),
            artifacts_dir: PathBuf::from("models"),
            ..Default::default()
        }
    }

    /// Load from a JSON file. Fields absent from the file keep the
    /// `standard()` values.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| CadenzaError::io(path, e))?;
        let value: serde_json::Value =
            serde_json::from_str(&data).map_err(|e| CadenzaError::json(path, e))?;
        let mut merged =
            serde_json::to_value(Self::standard()).map_err(|e| CadenzaError::json(path, e))?;
        merge_json(&mut merged, value);
        serde_json::from_value(merged).map_err(|e| CadenzaError::json(path, e))
    }

    /// Reject values that would make a phase meaningless.
    pub fn validate(&self) -> Result<()> {
        let t = &self.training;
        let g = &self.generation;
        let o = &self.output;
        let checks: [(bool, &str); 11] = [
            (t.sequence_length > 0, "training.sequence_length must be positive"),
            (t.epochs > 0, "training.epochs must be positive"),
            (t.batch_size > 0, "training.batch_size must be positive"),
            (t.hidden_size > 0, "training.hidden_size must be positive"),
            (
                t.learning_rate.is_finite() && t.learning_rate > 0.0,
                "training.learning_rate must be a positive number",
            ),
            (g.num_notes > 0, "generation.num_notes must be positive"),
            (
                g.temperature.base.is_finite() && g.temperature.base > 0.0,
                "generation.temperature.base must be a positive number",
            ),
            (o.tempo_bpm > 0, "output.tempo_bpm must be positive"),
            (
                o.step_beats.is_finite() && o.step_beats > 0.0,
                "output.step_beats must be a positive number",
            ),
            (
                o.note_beats.is_finite() && o.note_beats > 0.0,
                "output.note_beats must be a positive number",
            ),
            (o.program <= 127 && o.velocity <= 127, "output.program and output.velocity must be 0-127"),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, msg)) => Err(CadenzaError::InvalidConfig((*msg).to_string())),
            None => Ok(()),
        }
    }

    pub fn notes_path(&self) -> PathBuf {
        self.artifacts_dir.join("notes.json")
    }

    pub fn vocab_path(&self) -> PathBuf {
        self.artifacts_dir.join("vocab.json")
    }

    pub fn model_path(&self) -> PathBuf {
        self.artifacts_dir.join("model.json")
    }
}

/// Overlay `patch` onto `base`, recursing into objects.
fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
