// Sequence model: normalized token window -> distribution over the vocabulary.
//
// The rest of the pipeline only sees two traits:
// - `SequenceModel::predict` is all the generator needs. It is `Sync` and
//   takes `&self`, so one loaded model can serve any number of sessions.
// - `TrainableModel::fit` is what the training entry point drives.
//
// `RecurrentNet` is the shipped implementation: a single-layer Elman network
// (tanh recurrence over the scalar inputs of the window) feeding a softmax
// head over the vocabulary. Training minimizes sparse categorical
// cross-entropy by back-propagation through the whole window with Adam and
// global-norm gradient clipping. Examples are reshuffled every epoch; within
// a minibatch the per-example gradients are computed in parallel with rayon
// and summed. Early stopping watches the mean epoch loss and the weights from
// the best epoch are the ones kept.
//
// Weights are stored flat in one `Vec<f32>` so the optimizer, the gradient
// accumulator and the JSON artifact all share a single layout (see `Layout`).

use crate::config::TrainingConfig;
use crate::error::{CadenzaError, Result};
use crate::window::ExampleSet;
use cadenza_prng::PipelineRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::Path;

/// Anything that maps a normalized window to next-token probabilities.
pub trait SequenceModel: Sync {
    /// Number of outcomes `V` in every prediction.
    fn vocab_size(&self) -> usize;

    /// Window length the model expects.
    fn sequence_length(&self) -> usize;

    /// Probability of each id following `window`. Entries are non-negative and
    /// sum to 1 within floating tolerance.
    fn predict(&self, window: &[f32]) -> Result<Vec<f32>>;
}

/// Summary of one pass over the example set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    /// 1-based.
    pub epoch: usize,
    pub loss: f32,
    pub accuracy: f32,
    pub improved: bool,
}

/// Outcome of `fit`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TrainingReport {
    pub history: Vec<EpochStats>,
    pub best_epoch: usize,
    pub best_loss: f32,
    pub stopped_early: bool,
}

/// A model that can be fitted to an example set.
pub trait TrainableModel: SequenceModel {
    /// Train on `examples`. `on_improve` runs after every epoch that sets a
    /// new best loss, with the model holding that epoch's weights.
    fn fit(
        &mut self,
        examples: &ExampleSet,
        config: &TrainingConfig,
        rng: &mut PipelineRng,
        on_improve: &mut dyn FnMut(&Self, &EpochStats) -> Result<()>,
    ) -> Result<TrainingReport>;
}

/// Offsets of each weight group inside the flat parameter vector.
#[derive(Clone, Copy, Debug)]
struct Layout {
    hidden: usize,
    vocab: usize,
}

impl Layout {
    fn w_in(&self) -> Range<usize> {
        0..self.hidden
    }

    /// Row `i` holds the weights from every previous unit into unit `i`.
    fn w_rec(&self) -> Range<usize> {
        let start = self.w_in().end;
        start..start + self.hidden * self.hidden
    }

    fn b_rec(&self) -> Range<usize> {
        let start = self.w_rec().end;
        start..start + self.hidden
    }

    /// Row `k` holds the weights from every hidden unit into output `k`.
    fn w_out(&self) -> Range<usize> {
        let start = self.b_rec().end;
        start..start + self.vocab * self.hidden
    }

    fn b_out(&self) -> Range<usize> {
        let start = self.w_out().end;
        start..start + self.vocab
    }

    fn total(&self) -> usize {
        self.b_out().end
    }
}

/// Elman recurrent network with a softmax output layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecurrentNet {
    sequence_length: usize,
    hidden_size: usize,
    vocab_size: usize,
    params: Vec<f32>,
}

/// Hidden states of one forward pass (`states[0]` is the zero state) and the
/// output distribution.
struct Forward {
    states: Vec<Vec<f32>>,
    probs: Vec<f32>,
}

impl RecurrentNet {
    /// Fresh network with Glorot-uniform weights and zero biases.
    pub fn new(
        sequence_length: usize,
        hidden_size: usize,
        vocab_size: usize,
        rng: &mut PipelineRng,
    ) -> Result<Self> {
        if sequence_length == 0 || hidden_size == 0 || vocab_size == 0 {
            return Err(CadenzaError::ShapeMismatch(format!(
                "cannot build a network with sequence_length {sequence_length}, \
                 hidden_size {hidden_size}, vocab_size {vocab_size}"
            )));
        }
        let layout = Layout {
            hidden: hidden_size,
            vocab: vocab_size,
        };
        let mut params = vec![0.0f32; layout.total()];
        let glorot = |fan_in: usize, fan_out: usize| (6.0 / (fan_in + fan_out) as f32).sqrt();
        let groups = [
            (layout.w_in(), glorot(1, hidden_size)),
            (layout.w_rec(), glorot(hidden_size, hidden_size)),
            (layout.w_out(), glorot(hidden_size, vocab_size)),
        ];
        for (range, limit) in groups {
            for w in &mut params[range] {
                *w = rng.range_f32(-limit, limit);
            }
        }
        Ok(RecurrentNet {
            sequence_length,
            hidden_size,
            vocab_size,
            params,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn parameter_count(&self) -> usize {
        self.params.len()
    }

    fn layout(&self) -> Layout {
        Layout {
            hidden: self.hidden_size,
            vocab: self.vocab_size,
        }
    }

    /// Write the weights as JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string(self).map_err(|e| CadenzaError::json(path, e))?;
        std::fs::write(path, json).map_err(|e| CadenzaError::io(path, e))
    }

    /// Read weights written by `save`, checking that the shapes agree.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| CadenzaError::io(path, e))?;
        let net: RecurrentNet =
            serde_json::from_str(&data).map_err(|e| CadenzaError::json(path, e))?;
        if net.params.len() != net.layout().total() || net.sequence_length == 0 {
            return Err(CadenzaError::ArtifactMismatch(format!(
                "{} holds {} weights, expected {} for hidden {} / vocab {}",
                path.display(),
                net.params.len(),
                net.layout().total(),
                net.hidden_size,
                net.vocab_size
            )));
        }
        Ok(net)
    }

    fn check_window(&self, window: &[f32]) -> Result<()> {
        if window.len() != self.sequence_length {
            return Err(CadenzaError::ShapeMismatch(format!(
                "window of {} values, model expects {}",
                window.len(),
                self.sequence_length
            )));
        }
        Ok(())
    }

    fn forward(&self, window: &[f32]) -> Forward {
        let l = self.layout();
        let h = self.hidden_size;
        let w_in = &self.params[l.w_in()];
        let w_rec = &self.params[l.w_rec()];
        let b_rec = &self.params[l.b_rec()];
        let w_out = &self.params[l.w_out()];
        let b_out = &self.params[l.b_out()];

        let mut states = Vec::with_capacity(window.len() + 1);
        states.push(vec![0.0f32; h]);
        for &x in window {
            let prev = &states[states.len() - 1];
            let next: Vec<f32> = (0..h)
                .map(|i| {
                    let row = &w_rec[i * h..(i + 1) * h];
                    let recurrent: f32 = row.iter().zip(prev).map(|(w, p)| w * p).sum();
                    (w_in[i] * x + b_rec[i] + recurrent).tanh()
                })
                .collect();
            states.push(next);
        }

        let last = &states[states.len() - 1];
        let logits: Vec<f32> = (0..self.vocab_size)
            .map(|k| {
                let row = &w_out[k * h..(k + 1) * h];
                b_out[k] + row.iter().zip(last).map(|(w, s)| w * s).sum::<f32>()
            })
            .collect();
        Forward {
            states,
            probs: softmax(&logits),
        }
    }

    /// Add the cross-entropy gradient for one example into `grad`.
    /// Returns the example's loss and whether its argmax was the target.
    fn accumulate_gradient(&self, window: &[f32], target: usize, grad: &mut [f32]) -> (f32, bool) {
        let l = self.layout();
        let h = self.hidden_size;
        let fwd = self.forward(window);
        let loss = -fwd.probs[target].max(1e-12).ln();
        let correct = argmax(&fwd.probs) == target;

        let mut d_logits = fwd.probs;
        d_logits[target] -= 1.0;

        let last = &fwd.states[window.len()];
        let w_out = &self.params[l.w_out()];
        let mut d_state = vec![0.0f32; h];
        let g_w_out = l.w_out().start;
        let g_b_out = l.b_out().start;
        for (k, &dk) in d_logits.iter().enumerate() {
            grad[g_b_out + k] += dk;
            let row = &w_out[k * h..(k + 1) * h];
            for i in 0..h {
                grad[g_w_out + k * h + i] += dk * last[i];
                d_state[i] += row[i] * dk;
            }
        }

        let w_rec = &self.params[l.w_rec()];
        let mut d_pre = vec![0.0f32; h];
        for t in (0..window.len()).rev() {
            let state = &fwd.states[t + 1];
            let prev = &fwd.states[t];
            for i in 0..h {
                d_pre[i] = d_state[i] * (1.0 - state[i] * state[i]);
            }
            for i in 0..h {
                grad[l.w_in().start + i] += d_pre[i] * window[t];
                grad[l.b_rec().start + i] += d_pre[i];
                let g_row = &mut grad[l.w_rec().start + i * h..l.w_rec().start + (i + 1) * h];
                for (g, p) in g_row.iter_mut().zip(prev) {
                    *g += d_pre[i] * p;
                }
            }
            for (j, d) in d_state.iter_mut().enumerate() {
                *d = (0..h).map(|i| w_rec[i * h + j] * d_pre[i]).sum();
            }
        }
        (loss, correct)
    }

    /// Summed gradient, loss and hit count over a batch of example indices.
    fn batch_gradient(&self, examples: &ExampleSet, batch: &[usize]) -> BatchAccumulator {
        let size = self.params.len();
        batch
            .par_iter()
            .fold(
                || BatchAccumulator::zeros(size),
                |mut acc, &index| {
                    let input = examples.input(index);
                    let target = examples.examples[index].target;
                    let (loss, correct) = self.accumulate_gradient(&input, target, &mut acc.grad);
                    acc.loss += loss;
                    acc.correct += usize::from(correct);
                    acc
                },
            )
            .reduce(|| BatchAccumulator::zeros(size), BatchAccumulator::merge)
    }

    fn check_examples(&self, examples: &ExampleSet, config: &TrainingConfig) -> Result<()> {
        if examples.is_empty() {
            return Err(CadenzaError::InsufficientData {
                found: 0,
                needed: examples.sequence_length + 1,
                sequence_length: examples.sequence_length,
            });
        }
        if examples.sequence_length != self.sequence_length || examples.vocab_size != self.vocab_size {
            return Err(CadenzaError::ShapeMismatch(format!(
                "examples are {}x{} (window x vocab), model is {}x{}",
                examples.sequence_length, examples.vocab_size, self.sequence_length, self.vocab_size
            )));
        }
        if let Some(bad) = examples.examples.iter().find(|e| e.target >= self.vocab_size) {
            return Err(CadenzaError::UnknownId {
                id: bad.target,
                vocab_size: self.vocab_size,
            });
        }
        if config.batch_size == 0 || config.epochs == 0 {
            return Err(CadenzaError::InvalidConfig(
                "epochs and batch_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl SequenceModel for RecurrentNet {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    fn predict(&self, window: &[f32]) -> Result<Vec<f32>> {
        self.check_window(window)?;
        Ok(self.forward(window).probs)
    }
}

impl TrainableModel for RecurrentNet {
    fn fit(
        &mut self,
        examples: &ExampleSet,
        config: &TrainingConfig,
        rng: &mut PipelineRng,
        on_improve: &mut dyn FnMut(&Self, &EpochStats) -> Result<()>,
    ) -> Result<TrainingReport> {
        self.check_examples(examples, config)?;
        log::info!(
            "training {} weights on {} examples: up to {} epochs, batch {}",
            self.params.len(),
            examples.len(),
            config.epochs,
            config.batch_size
        );

        let mut adam = Adam::new(self.params.len(), config.learning_rate);
        let mut order: Vec<usize> = (0..examples.len()).collect();
        let mut report = TrainingReport {
            best_loss: f32::INFINITY,
            ..Default::default()
        };
        let mut best_params = self.params.clone();
        let mut stale_epochs = 0;

        for epoch in 1..=config.epochs {
            rng.shuffle(&mut order);
            let mut loss_sum = 0.0f32;
            let mut correct = 0usize;
            for batch in order.chunks(config.batch_size) {
                let mut acc = self.batch_gradient(examples, batch);
                loss_sum += acc.loss;
                correct += acc.correct;
                let scale = 1.0 / batch.len() as f32;
                acc.grad.iter_mut().for_each(|g| *g *= scale);
                clip_by_norm(&mut acc.grad, config.clip_norm);
                adam.step(&mut self.params, &acc.grad);
            }

            let loss = loss_sum / examples.len() as f32;
            if !loss.is_finite() {
                return Err(CadenzaError::Diverged { epoch, loss });
            }
            let improved = loss < report.best_loss - config.min_delta;
            let stats = EpochStats {
                epoch,
                loss,
                accuracy: correct as f32 / examples.len() as f32,
                improved,
            };
            log::info!(
                "epoch {}/{}: loss {:.4}, accuracy {:.3}{}",
                epoch,
                config.epochs,
                stats.loss,
                stats.accuracy,
                if improved { " (best)" } else { "" }
            );
            report.history.push(stats.clone());

            if improved {
                report.best_loss = loss;
                report.best_epoch = epoch;
                best_params.clone_from(&self.params);
                stale_epochs = 0;
                on_improve(self, &stats)?;
            } else {
                stale_epochs += 1;
                if config.patience > 0 && stale_epochs >= config.patience {
                    log::info!(
                        "no improvement for {stale_epochs} epochs; stopping after epoch {epoch}"
                    );
                    report.stopped_early = true;
                    break;
                }
            }
        }

        self.params = best_params;
        Ok(report)
    }
}

/// Per-thread partial sums for one minibatch.
struct BatchAccumulator {
    grad: Vec<f32>,
    loss: f32,
    correct: usize,
}

impl BatchAccumulator {
    fn zeros(size: usize) -> Self {
        BatchAccumulator {
            grad: vec![0.0; size],
            loss: 0.0,
            correct: 0,
        }
    }

    fn merge(mut self, other: Self) -> Self {
        for (a, b) in self.grad.iter_mut().zip(&other.grad) {
            *a += b;
        }
        self.loss += other.loss;
        self.correct += other.correct;
        self
    }
}

/// Adam optimizer state (Kingma & Ba), Keras default hyperparameters.
struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    m: Vec<f32>,
    v: Vec<f32>,
    t: i32,
}

impl Adam {
    fn new(size: usize, lr: f32) -> Self {
        Adam {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            m: vec![0.0; size],
            v: vec![0.0; size],
            t: 0,
        }
    }

    fn step(&mut self, params: &mut [f32], grad: &[f32]) {
        self.t = self.t.saturating_add(1);
        let correction1 = 1.0 - self.beta1.powi(self.t);
        let correction2 = 1.0 - self.beta2.powi(self.t);
        for (((p, g), m), v) in params
            .iter_mut()
            .zip(grad)
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            *m = self.beta1 * *m + (1.0 - self.beta1) * g;
            *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
            let m_hat = *m / correction1;
            let v_hat = *v / correction2;
            *p -= self.lr * m_hat / (v_hat.sqrt() + self.epsilon);
        }
    }
}

/// Scale `grad` down so its L2 norm is at most `max_norm`. Non-positive
/// `max_norm` disables clipping.
fn clip_by_norm(grad: &mut [f32], max_norm: f32) {
    if max_norm <= 0.0 {
        return;
    }
    let norm = grad.iter().map(|g| g * g).sum::<f32>().sqrt();
    if norm > max_norm {
        let scale = max_norm / norm;
        grad.iter_mut().for_each(|g| *g *= scale);
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&z| (z - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::make_example_set;

    fn small_config() -> TrainingConfig {
        TrainingConfig {
            sequence_length: 3,
            epochs: 60,
            batch_size: 8,
            patience: 0,
            hidden_size: 16,
            learning_rate: 0.02,
            ..Default::default()
        }
    }

    fn no_checkpoint() -> impl FnMut(&RecurrentNet, &EpochStats) -> Result<()> {
        |_, _| Ok(())
    }

    #[test]
    fn prediction_is_a_distribution() {
        let mut rng = PipelineRng::new(1);
        let net = RecurrentNet::new(4, 8, 5, &mut rng).unwrap();
        let probs = net.predict(&[0.0, 0.2, 0.4, 0.8]).unwrap();
        assert_eq!(probs.len(), 5);
        assert!(probs.iter().all(|&p| p >= 0.0));
        let total: f32 = probs.iter().sum();
        assert!((total - 1.0).abs() < 1e-5, "sum {total}");
    }

    #[test]
    fn wrong_window_length_is_rejected() {
        let mut rng = PipelineRng::new(1);
        let net = RecurrentNet::new(4, 8, 5, &mut rng).unwrap();
        assert!(matches!(
            net.predict(&[0.1, 0.2]),
            Err(CadenzaError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn layout_covers_every_weight_once() {
        let layout = Layout { hidden: 3, vocab: 4 };
        assert_eq!(layout.total(), 3 + 9 + 3 + 12 + 4);
        assert_eq!(layout.w_rec().start, layout.w_in().end);
        assert_eq!(layout.b_out().start, layout.w_out().end);
    }

    #[test]
    fn analytic_gradient_matches_finite_difference() {
        let mut rng = PipelineRng::new(7);
        let mut net = RecurrentNet::new(3, 4, 3, &mut rng).unwrap();
        let window = [0.1f32, 0.7, 0.4];
        let target = 2;
        let mut grad = vec![0.0f32; net.parameter_count()];
        net.accumulate_gradient(&window, target, &mut grad);

        let eps = 1e-2f32;
        for index in [0, 5, 13, 20, 30, net.parameter_count() - 1] {
            let original = net.params[index];
            net.params[index] = original + eps;
            let plus = -net.forward(&window).probs[target].ln();
            net.params[index] = original - eps;
            let minus = -net.forward(&window).probs[target].ln();
            net.params[index] = original;
            let numeric = (plus - minus) / (2.0 * eps);
            assert!(
                (numeric - grad[index]).abs() < 1e-2,
                "param {index}: numeric {numeric}, analytic {}",
                grad[index]
            );
        }
    }

    #[test]
    fn fit_learns_a_repeating_pattern() {
        let ids: Vec<usize> = (0..120).map(|i| [0, 1, 2, 3][i % 4]).collect();
        let examples = make_example_set(&ids, 3, 4).unwrap();
        let mut rng = PipelineRng::new(11);
        let mut net = RecurrentNet::new(3, 16, 4, &mut rng).unwrap();
        let report = net
            .fit(&examples, &small_config(), &mut rng, &mut no_checkpoint())
            .unwrap();

        let first = report.history[0].loss;
        assert!(report.best_loss < first * 0.5, "loss {first} -> {}", report.best_loss);
        let probs = net.predict(&examples.input(0)).unwrap();
        assert_eq!(argmax(&probs), examples.examples[0].target);
    }

    #[test]
    fn early_stopping_honours_patience() {
        // A constant stream converges almost immediately; with a tiny
        // learning rate and a large min_delta nothing counts as improvement.
        let ids = vec![0usize; 20];
        let examples = make_example_set(&ids, 3, 2).unwrap();
        let config = TrainingConfig {
            min_delta: 100.0,
            patience: 2,
            epochs: 50,
            ..small_config()
        };
        let mut rng = PipelineRng::new(3);
        let mut net = RecurrentNet::new(3, 4, 2, &mut rng).unwrap();
        let report = net.fit(&examples, &config, &mut rng, &mut no_checkpoint()).unwrap();
        assert!(report.stopped_early);
        // Epoch 1 always improves on infinity, then two stale epochs.
        assert_eq!(report.history.len(), 3);
        assert_eq!(report.best_epoch, 1);
    }

    #[test]
    fn checkpoint_runs_on_each_improvement() {
        let ids: Vec<usize> = (0..40).map(|i| i % 3).collect();
        let examples = make_example_set(&ids, 3, 3).unwrap();
        let mut rng = PipelineRng::new(5);
        let mut net = RecurrentNet::new(3, 8, 3, &mut rng).unwrap();
        let mut saved_epochs = Vec::new();
        let config = TrainingConfig { epochs: 5, ..small_config() };
        let report = net
            .fit(&examples, &config, &mut rng, &mut |_, stats| {
                saved_epochs.push(stats.epoch);
                Ok(())
            })
            .unwrap();
        let improved: Vec<usize> = report
            .history
            .iter()
            .filter(|s| s.improved)
            .map(|s| s.epoch)
            .collect();
        assert_eq!(saved_epochs, improved);
        assert_eq!(saved_epochs.first(), Some(&1));
    }

    #[test]
    fn mismatched_examples_are_rejected() {
        let examples = make_example_set(&[0, 1, 0, 1, 0], 2, 2).unwrap();
        let mut rng = PipelineRng::new(5);
        let mut net = RecurrentNet::new(3, 4, 2, &mut rng).unwrap();
        let err = net
            .fit(&examples, &small_config(), &mut rng, &mut no_checkpoint())
            .unwrap_err();
        assert!(matches!(err, CadenzaError::ShapeMismatch(_)));
    }

    #[test]
    fn save_load_reproduces_predictions() {
        let dir = tempdir::TempDir::new("cadenza-model").unwrap();
        let path = dir.path().join("model.json");
        let mut rng = PipelineRng::new(9);
        let net = RecurrentNet::new(5, 6, 7, &mut rng).unwrap();
        net.save(&path).unwrap();
        let restored = RecurrentNet::load(&path).unwrap();
        assert_eq!(restored, net);
        let window = [0.0, 0.1, 0.2, 0.3, 0.4];
        assert_eq!(restored.predict(&window).unwrap(), net.predict(&window).unwrap());
    }

    #[test]
    fn truncated_weights_fail_to_load() {
        let dir = tempdir::TempDir::new("cadenza-model").unwrap();
        let path = dir.path().join("model.json");
        let mut rng = PipelineRng::new(9);
        let mut net = RecurrentNet::new(2, 2, 2, &mut rng).unwrap();
        net.params.pop();
        net.save(&path).unwrap();
        assert!(matches!(
            RecurrentNet::load(&path),
            Err(CadenzaError::ArtifactMismatch(_))
        ));
    }

    #[test]
    fn clipping_bounds_the_norm() {
        let mut grad = vec![3.0f32, 4.0];
        clip_by_norm(&mut grad, 1.0);
        let norm = (grad[0] * grad[0] + grad[1] * grad[1]).sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        let mut small = vec![0.3f32, 0.4];
        clip_by_norm(&mut small, 1.0);
        assert_eq!(small, vec![0.3, 0.4]);
    }
}
