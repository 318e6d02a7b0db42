// Cadenza: symbolic music generation from a MIDI corpus.
//
// Turns a directory of MIDI files into a stream of note and chord tokens,
// trains a recurrent network to predict the next token from a fixed window
// of previous ones, then samples new token sequences from the trained model
// and writes them back out as MIDI.
//
// Architecture:
// - token.rs: Token codec (notes as pitch names, chords as normal-order pitch
//   classes) and decoding back to timed key groups
// - vocab.rs: Sorted token <-> id bijection
// - window.rs: Stride-1 training windows and input normalization
// - model.rs: `SequenceModel` / `TrainableModel` traits and the Elman
//   network that implements them (BPTT, Adam, early stopping)
// - generate.rs: Temperature-scheduled autoregressive sampling
// - serialize.rs: Event stream layout and MIDI file output
// - corpus.rs: MIDI corpus loading
// - artifacts.rs: JSON persistence of the token stream, vocabulary and model
// - config.rs: `PipelineConfig` and its JSON loading
// - pipeline.rs: The preprocess / train / generate entry points
// - error.rs: `CadenzaError` and exit codes
//
// All randomness flows through `cadenza_prng::PipelineRng`, so a fixed seed
// reproduces a run exactly.

pub mod artifacts;
pub mod config;
pub mod corpus;
pub mod error;
pub mod generate;
pub mod model;
pub mod pipeline;
pub mod serialize;
pub mod token;
pub mod vocab;
pub mod window;
