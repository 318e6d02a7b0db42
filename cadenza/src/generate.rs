// Autoregressive generation with temperature sampling.
//
// A `GenerationSession` moves through three states:
// - Seeded: the pattern buffer holds `sequence_length` ids copied from a
//   random contiguous slice of the training stream.
// - Generating: each step normalizes the pattern, asks the model for a
//   distribution, reshapes it with the step's temperature, draws one id, then
//   appends that id to the output and slides it into the pattern (drop
//   oldest, append newest).
// - Done: exactly the requested number of ids has been drawn.
//
// Temperature sampling takes `ln(p + 1e-9) / T`, exponentiates and
// renormalizes before drawing, so T < 1 sharpens the distribution and T > 1
// flattens it. The temperature follows a sawtooth (`TemperatureSchedule`)
// that climbs slowly from its base value and resets every period, which
// keeps long runs from locking into a loop of the same few tokens.
//
// A step whose prediction is not a usable distribution fails the whole run;
// partial output is never returned. The model, vocabulary and training stream
// are borrowed through `GenerationContext`, so concurrent sessions can share
// them while each owns its own pattern and output.

use crate::config::GenerationConfig;
use crate::error::{CadenzaError, Result};
use crate::model::SequenceModel;
use crate::token::Token;
use crate::vocab::Vocabulary;
use crate::window::normalize_window;
use cadenza_prng::PipelineRng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Additive floor applied before taking logs of probabilities.
pub const LOG_FLOOR: f64 = 1e-9;

/// Sawtooth temperature: `base + (step mod period) / (divisor * period)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemperatureSchedule {
    pub base: f64,
    /// Steps per ramp. 0 keeps the temperature fixed at `base`.
    pub period: usize,
    /// The ramp peaks just under `base + 1 / divisor`.
    pub divisor: f64,
}

impl Default for TemperatureSchedule {
    fn default() -> Self {
        TemperatureSchedule {
            base: 0.7,
            period: 100,
            divisor: 3.0,
        }
    }
}

impl TemperatureSchedule {
    /// Fixed temperature for every step.
    pub fn constant(temperature: f64) -> Self {
        TemperatureSchedule {
            base: temperature,
            period: 0,
            divisor: 1.0,
        }
    }

    pub fn at(&self, step: usize) -> f64 {
        if self.period == 0 || self.divisor <= 0.0 {
            return self.base;
        }
        self.base + (step % self.period) as f64 / (self.divisor * self.period as f64)
    }
}

/// Reshape `probs` by `temperature` into a distribution that sums to 1.
///
/// Fails with a reason when the input has negative or non-finite entries, or
/// when nothing survives renormalization.
pub fn reweight(probs: &[f32], temperature: f64) -> std::result::Result<Vec<f64>, String> {
    if probs.is_empty() {
        return Err("empty distribution".into());
    }
    if !(temperature.is_finite() && temperature > 0.0) {
        return Err(format!("temperature {temperature} is not positive"));
    }
    if let Some((i, p)) = probs
        .iter()
        .enumerate()
        .find(|(_, p)| !p.is_finite() || **p < 0.0)
    {
        return Err(format!("entry {i} is {p}"));
    }
    // The log floor would turn an all-zero vector into a uniform one, so
    // the raw mass is checked first.
    let mass: f64 = probs.iter().map(|&p| f64::from(p)).sum();
    if !(mass.is_finite() && mass > 0.0) {
        return Err(format!("probabilities sum to {mass}"));
    }
    let scaled: Vec<f64> = probs
        .iter()
        .map(|&p| (f64::from(p) + LOG_FLOOR).ln() / temperature)
        .collect();
    // Shifting by the max leaves the normalized result unchanged and keeps
    // exp() in range for small temperatures.
    let max = scaled.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scaled.iter().map(|s| (s - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    if !(total.is_finite() && total > 0.0) {
        return Err(format!("reweighted mass {total} cannot be normalized"));
    }
    Ok(exps.into_iter().map(|e| e / total).collect())
}

/// Draw an index from a normalized distribution.
pub fn sample_index(weights: &[f64], rng: &mut PipelineRng) -> usize {
    let target = rng.next_f64();
    let mut cumulative = 0.0;
    for (i, &w) in weights.iter().enumerate() {
        cumulative += w;
        if cumulative > target {
            return i;
        }
    }
    // Rounding left the total a hair under `target`: take the last
    // index that carries any mass.
    weights.iter().rposition(|&w| w > 0.0).unwrap_or(0)
}

/// Read-only state shared by generation sessions.
pub struct GenerationContext<'a, M: SequenceModel + ?Sized> {
    pub model: &'a M,
    pub vocab: &'a Vocabulary,
    /// The training corpus as ids, used to draw seed windows.
    pub token_ids: &'a [usize],
}

impl<'a, M: SequenceModel + ?Sized> GenerationContext<'a, M> {
    /// Check that the model, vocabulary and stream agree with each other.
    pub fn new(model: &'a M, vocab: &'a Vocabulary, token_ids: &'a [usize]) -> Result<Self> {
        if model.vocab_size() != vocab.len() {
            return Err(CadenzaError::ArtifactMismatch(format!(
                "model predicts {} outcomes but the vocabulary has {} tokens",
                model.vocab_size(),
                vocab.len()
            )));
        }
        if let Some(&id) = token_ids.iter().find(|&&id| id >= vocab.len()) {
            return Err(CadenzaError::UnknownId {
                id,
                vocab_size: vocab.len(),
            });
        }
        Ok(GenerationContext {
            model,
            vocab,
            token_ids,
        })
    }

    pub fn sequence_length(&self) -> usize {
        self.model.sequence_length()
    }
}

/// Lifecycle of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Seeded,
    Generating,
    Done,
}

/// One generation run: the sliding pattern and the ids drawn so far.
#[derive(Clone, Debug)]
pub struct GenerationSession {
    pattern: VecDeque<usize>,
    output: Vec<usize>,
    num_notes: usize,
    state: SessionState,
}

impl GenerationSession {
    /// Seed from a uniformly chosen window of the training stream.
    ///
    /// The start index is drawn from `[0, N - L - 1)`; a stream of exactly
    /// `L + 1` ids can only start at 0.
    pub fn seed<M: SequenceModel + ?Sized>(
        ctx: &GenerationContext<'_, M>,
        num_notes: usize,
        rng: &mut PipelineRng,
    ) -> Result<Self> {
        let len = ctx.sequence_length();
        let n = ctx.token_ids.len();
        if n <= len {
            return Err(CadenzaError::InsufficientData {
                found: n,
                needed: len + 1,
                sequence_length: len,
            });
        }
        let upper = n - len - 1;
        let start = if upper == 0 { 0 } else { rng.range_usize(0, upper) };
        log::debug!("seeding from training window {start}..{}", start + len);
        Self::from_pattern(ctx.token_ids[start..start + len].to_vec(), num_notes)
    }

    /// Start from an explicit pattern. `step` rejects a pattern whose length
    /// differs from the model window.
    pub fn from_pattern(pattern: Vec<usize>, num_notes: usize) -> Result<Self> {
        if num_notes == 0 {
            return Err(CadenzaError::InvalidConfig(
                "num_notes must be at least 1".into(),
            ));
        }
        if pattern.is_empty() {
            return Err(CadenzaError::InvalidConfig(
                "seed pattern must not be empty".into(),
            ));
        }
        Ok(GenerationSession {
            pattern: pattern.into(),
            output: Vec::with_capacity(num_notes),
            num_notes,
            state: SessionState::Seeded,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pattern(&self) -> &VecDeque<usize> {
        &self.pattern
    }

    pub fn output(&self) -> &[usize] {
        &self.output
    }

    /// Draw one id. Returns `None` once the session is done.
    pub fn step<M: SequenceModel + ?Sized>(
        &mut self,
        ctx: &GenerationContext<'_, M>,
        schedule: &TemperatureSchedule,
        rng: &mut PipelineRng,
    ) -> Result<Option<usize>> {
        if self.state == SessionState::Done {
            return Ok(None);
        }
        if self.pattern.len() != ctx.sequence_length() {
            return Err(CadenzaError::ShapeMismatch(format!(
                "seed pattern holds {} ids, model window is {}",
                self.pattern.len(),
                ctx.sequence_length()
            )));
        }
        let step = self.output.len();
        let vocab_size = ctx.model.vocab_size();
        let input = normalize_window(&self.pattern, vocab_size);
        let probs = ctx.model.predict(&input)?;
        if probs.len() != vocab_size {
            return Err(CadenzaError::MalformedPrediction {
                step,
                reason: format!("{} probabilities for {} tokens", probs.len(), vocab_size),
            });
        }
        let weights = reweight(&probs, schedule.at(step))
            .map_err(|reason| CadenzaError::MalformedPrediction { step, reason })?;
        let id = sample_index(&weights, rng);

        self.output.push(id);
        self.pattern.push_back(id);
        self.pattern.pop_front();
        self.state = if self.output.len() == self.num_notes {
            SessionState::Done
        } else {
            SessionState::Generating
        };
        Ok(Some(id))
    }

    /// Step until done and return the drawn ids.
    pub fn run<M: SequenceModel + ?Sized>(
        mut self,
        ctx: &GenerationContext<'_, M>,
        schedule: &TemperatureSchedule,
        rng: &mut PipelineRng,
        progress_every: usize,
    ) -> Result<Vec<usize>> {
        while self.step(ctx, schedule, rng)?.is_some() {
            let done = self.output.len();
            if progress_every > 0 && done % progress_every == 0 {
                log::info!("generated {done}/{} tokens", self.num_notes);
            }
        }
        Ok(self.output)
    }
}

/// Seed a session, run it to completion and decode the ids to tokens.
pub fn generate<M: SequenceModel + ?Sized>(
    ctx: &GenerationContext<'_, M>,
    config: &GenerationConfig,
    rng: &mut PipelineRng,
) -> Result<Vec<Token>> {
    log::info!("generating {} tokens", config.num_notes);
    let session = GenerationSession::seed(ctx, config.num_notes, rng)?;
    let ids = session.run(ctx, &config.temperature, rng, config.progress_every)?;
    ctx.vocab.decode_all(&ids)
}
