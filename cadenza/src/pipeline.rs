// Pipeline entry points: preprocess, train, generate.
//
// Each entry point validates the configuration, runs its phases in order and
// leaves its results in the artifact store:
//
//   preprocess: corpus -> tokens -> vocabulary; writes notes.json, vocab.json
//   train:      preprocess, then windows -> fitted network; writes model.json
//               after every epoch that improves the loss
//   generate:   notes.json + vocab.json + model.json -> sampled tokens -> MIDI
//
// Randomness comes from one `PipelineRng` per phase, seeded from the config
// or, when no seed is set, from the clock. The seed actually used is logged
// so any run can be replayed.

use crate::artifacts;
use crate::config::PipelineConfig;
use crate::corpus;
use crate::error::Result;
use crate::generate::{self, GenerationContext};
use crate::model::{EpochStats, RecurrentNet, SequenceModel, TrainableModel, TrainingReport};
use crate::serialize;
use crate::token::Token;
use crate::vocab::Vocabulary;
use crate::window::make_example_set;
use cadenza_prng::PipelineRng;
use std::path::PathBuf;

/// Token stream and vocabulary produced by `preprocess`.
#[derive(Clone, Debug)]
pub struct Preprocessed {
    pub tokens: Vec<Token>,
    pub vocab: Vocabulary,
}

/// What `generate` produced and where it went.
#[derive(Clone, Debug)]
pub struct GenerationOutput {
    pub tokens: Vec<Token>,
    /// Events actually written (undecodable tokens are dropped).
    pub events_written: usize,
    pub path: PathBuf,
}

fn phase_rng(seed: Option<u64>, phase: &str) -> PipelineRng {
    match seed {
        Some(seed) => {
            log::info!("{phase}: seed {seed}");
            PipelineRng::new(seed)
        }
        None => {
            let (rng, seed) = PipelineRng::from_clock();
            log::info!("{phase}: seed {seed} (from clock; pass --seed {seed} to replay)");
            rng
        }
    }
}

/// Extract tokens from the corpus and build the vocabulary.
pub fn preprocess(config: &PipelineConfig) -> Result<Preprocessed> {
    config.validate()?;
    log::info!("loading corpus from {}", config.corpus_dir.display());
    let tokens = corpus::load_corpus(&config.corpus_dir)?;
    let vocab = Vocabulary::build(&tokens)?;
    log::info!(
        "extracted {} tokens, {} distinct",
        tokens.len(),
        vocab.len()
    );
    artifacts::save_notes(config, &tokens)?;
    artifacts::save_vocab(config, &vocab)?;
    Ok(Preprocessed { tokens, vocab })
}

/// Preprocess, then fit a fresh network and checkpoint its best weights.
pub fn train(config: &PipelineConfig) -> Result<TrainingReport> {
    let Preprocessed { tokens, vocab } = preprocess(config)?;
    let t = &config.training;
    let ids = vocab.encode_all(&tokens)?;
    let examples = make_example_set(&ids, t.sequence_length, vocab.len())?;

    let mut rng = phase_rng(t.seed, "train");
    let mut net = RecurrentNet::new(t.sequence_length, t.hidden_size, vocab.len(), &mut rng)?;
    log::info!(
        "network: window {}, hidden {}, {} outputs, {} weights",
        t.sequence_length,
        net.hidden_size(),
        vocab.len(),
        net.parameter_count()
    );

    let mut checkpoint = |model: &RecurrentNet, _: &EpochStats| {
        artifacts::save_model(config, model)
    };
    let report = net.fit(&examples, t, &mut rng, &mut checkpoint)?;
    // The checkpoint already holds these weights unless no epoch improved.
    artifacts::save_model(config, &net)?;
    log::info!(
        "training finished after {} epochs; best loss {:.4} at epoch {}{}",
        report.history.len(),
        report.best_loss,
        report.best_epoch,
        if report.stopped_early { " (stopped early)" } else { "" }
    );
    Ok(report)
}

/// Load the trained artifacts, sample tokens and write the MIDI file.
pub fn generate(config: &PipelineConfig) -> Result<GenerationOutput> {
    config.validate()?;
    let tokens = artifacts::load_notes(config)?;
    let vocab = artifacts::load_vocab(config)?;
    let model = artifacts::load_model(config)?;
    log::info!(
        "loaded model (window {}, vocabulary {}) and {} corpus tokens",
        model.sequence_length(),
        vocab.len(),
        tokens.len()
    );

    let ids = vocab.encode_all(&tokens)?;
    let ctx = GenerationContext::new(&model, &vocab, &ids)?;
    let mut rng = phase_rng(config.generation.seed, "generate");
    generate_with(&ctx, config, &mut rng)
}

/// Sample from an already loaded context and write the MIDI file.
///
/// Nothing is written unless every step succeeds.
pub fn generate_with<M: SequenceModel + ?Sized>(
    ctx: &GenerationContext<'_, M>,
    config: &PipelineConfig,
    rng: &mut PipelineRng,
) -> Result<GenerationOutput> {
    let generated = generate::generate(ctx, &config.generation, rng)?;
    let stream = serialize::to_event_stream(&generated, &config.output);
    let path = config.generation.output_file.clone();
    serialize::write(&stream, &path, &config.output)?;
    Ok(GenerationOutput {
        tokens: generated,
        events_written: stream.events.len(),
        path,
    })
}
