// Sequence windower: slices an id stream into training examples.
//
// Every contiguous run of `sequence_length` ids is a context and the id right
// after it is the target, stride 1, so a stream of N ids yields exactly
// N - sequence_length examples in corpus order. Contexts are stored as raw
// ids; `normalize_window` scales them by the vocabulary size at the point
// they are handed to a model. Targets stay raw because the model predicts a
// categorical distribution over ids.

use crate::error::{CadenzaError, Result};

/// One training example: a context window and the id that follows it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowedExample {
    pub context: Vec<usize>,
    pub target: usize,
}

/// All examples cut from one stream, plus the shape they share.
#[derive(Clone, Debug)]
pub struct ExampleSet {
    pub sequence_length: usize,
    pub vocab_size: usize,
    pub examples: Vec<WindowedExample>,
}

impl ExampleSet {
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Normalized model input for example `index`.
    pub fn input(&self, index: usize) -> Vec<f32> {
        normalize_window(&self.examples[index].context, self.vocab_size)
    }
}

/// Cut every stride-1 window of `sequence_length` ids from `ids`.
///
/// Requires `ids.len() > sequence_length`.
pub fn make_examples(ids: &[usize], sequence_length: usize) -> Result<Vec<WindowedExample>> {
    if sequence_length == 0 {
        return Err(CadenzaError::InvalidConfig(
            "sequence_length must be at least 1".into(),
        ));
    }
    if ids.len() <= sequence_length {
        return Err(CadenzaError::InsufficientData {
            found: ids.len(),
            needed: sequence_length + 1,
            sequence_length,
        });
    }
    Ok(ids
        .windows(sequence_length + 1)
        .map(|w| WindowedExample {
            context: w[..sequence_length].to_vec(),
            target: w[sequence_length],
        })
        .collect())
}

/// `make_examples` bundled with the vocabulary size used for normalization.
pub fn make_example_set(ids: &[usize], sequence_length: usize, vocab_size: usize) -> Result<ExampleSet> {
    let examples = make_examples(ids, sequence_length)?;
    log::info!(
        "created {} training windows of length {} (vocabulary size {})",
        examples.len(),
        sequence_length,
        vocab_size
    );
    Ok(ExampleSet {
        sequence_length,
        vocab_size,
        examples,
    })
}

/// Scale ids into [0, 1) by the vocabulary size.
pub fn normalize_window<'a>(ids: impl IntoIterator<Item = &'a usize>, vocab_size: usize) -> Vec<f32> {
    let scale = vocab_size.max(1) as f32;
    ids.into_iter().map(|&id| id as f32 / scale).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_token_windows_over_four_ids() {
        let examples = make_examples(&[0, 0, 2, 1], 2).unwrap();
        assert_eq!(
            examples,
            vec![
                WindowedExample { context: vec![0, 0], target: 2 },
                WindowedExample { context: vec![0, 2], target: 1 },
            ]
        );
    }

    #[test]
    fn example_count_is_length_minus_window() {
        let ids: Vec<usize> = (0..40).map(|i| i % 7).collect();
        for len in 1..ids.len() {
            let examples = make_examples(&ids, len).unwrap();
            assert_eq!(examples.len(), ids.len() - len, "window {len}");
        }
    }

    #[test]
    fn windows_are_contiguous_in_corpus_order() {
        let ids: Vec<usize> = (0..12).collect();
        for (i, ex) in make_examples(&ids, 4).unwrap().iter().enumerate() {
            assert_eq!(ex.context, ids[i..i + 4]);
            assert_eq!(ex.target, ids[i + 4]);
        }
    }

    #[test]
    fn short_stream_is_insufficient() {
        let err = make_examples(&[0, 1, 2], 3).unwrap_err();
        assert!(matches!(
            err,
            CadenzaError::InsufficientData { found: 3, needed: 4, sequence_length: 3 }
        ));
        assert!(make_examples(&[0, 1, 2, 3], 3).is_ok());
    }

    #[test]
    fn zero_window_is_rejected() {
        assert!(matches!(
            make_examples(&[0, 1], 0),
            Err(CadenzaError::InvalidConfig(_))
        ));
    }

    #[test]
    fn normalization_divides_by_vocab_size() {
        let set = make_example_set(&[0, 3, 1, 2], 2, 4).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.input(0), vec![0.0, 0.75]);
        assert_eq!(set.input(1), vec![0.75, 0.25]);
        assert_eq!(set.examples[1].target, 2);
    }
}
