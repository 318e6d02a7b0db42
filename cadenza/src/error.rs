// Error type shared by every pipeline phase.
//
// Only fatal conditions live here. Recoverable problems (a corpus file that
// fails to parse, a token that fails to decode during serialization) are
// logged where they happen and never surface as a `CadenzaError`.
//
// Variants that involve the filesystem carry the offending path so the CLI
// can print an actionable message. `exit_code()` groups variants into the
// process exit codes documented in `main.rs`.

use std::path::PathBuf;

/// Fatal pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum CadenzaError {
    /// No tokens could be extracted from the corpus.
    #[error("corpus produced no usable note or chord tokens")]
    EmptyCorpus,

    /// The token stream is too short to form a single training window.
    #[error(
        "need at least {needed} tokens for sequence length {sequence_length}, found {found}"
    )]
    InsufficientData {
        found: usize,
        needed: usize,
        sequence_length: usize,
    },

    /// A token outside the vocabulary was encoded.
    #[error("token {0:?} is not in the vocabulary")]
    UnknownToken(String),

    /// An id outside `[0, V)` was decoded.
    #[error("id {id} is outside the vocabulary (size {vocab_size})")]
    UnknownId { id: usize, vocab_size: usize },

    /// The model returned something that is not a usable distribution.
    #[error("malformed prediction at generation step {step}: {reason}")]
    MalformedPrediction { step: usize, reason: String },

    /// A model was asked to work with inputs of the wrong shape.
    #[error("model shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A persisted artifact needed for generation does not exist.
    #[error("missing {what} at {}; run `cadenza train` first", path.display())]
    MissingArtifact { what: &'static str, path: PathBuf },

    /// Artifacts exist but disagree with each other.
    #[error("inconsistent artifacts: {0}")]
    ArtifactMismatch(String),

    /// Training produced a non-finite loss.
    #[error("training diverged at epoch {epoch} (loss {loss})")]
    Diverged { epoch: usize, loss: f32 },

    /// Configuration or argument out of its valid range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("MIDI error in {}: {source}", path.display())]
    Midi {
        path: PathBuf,
        #[source]
        source: midly::Error,
    },
}

impl CadenzaError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CadenzaError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        CadenzaError::Json {
            path: path.into(),
            source,
        }
    }

    /// Process exit code for this error.
    ///
    /// 2: corpus data problems, 3: missing or inconsistent artifacts,
    /// 4: I/O and file-format problems, 5: model failures, 1: bad usage.
    pub fn exit_code(&self) -> i32 {
        match self {
            CadenzaError::EmptyCorpus
            | CadenzaError::InsufficientData { .. }
            | CadenzaError::UnknownToken(_) => 2,
            CadenzaError::MissingArtifact { .. } | CadenzaError::ArtifactMismatch(_) => 3,
            CadenzaError::Io { .. } | CadenzaError::Json { .. } | CadenzaError::Midi { .. } => 4,
            CadenzaError::MalformedPrediction { .. }
            | CadenzaError::ShapeMismatch(_)
            | CadenzaError::Diverged { .. }
            | CadenzaError::UnknownId { .. } => 5,
            CadenzaError::InvalidConfig(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, CadenzaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_path() {
        let err = CadenzaError::MissingArtifact {
            what: "model weights",
            path: PathBuf::from("models/model.json"),
        };
        let msg = err.to_string();
        assert!(msg.contains("models/model.json"), "{msg}");
        assert!(msg.contains("cadenza train"), "{msg}");
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn data_errors_share_an_exit_code() {
        let short = CadenzaError::InsufficientData {
            found: 3,
            needed: 5,
            sequence_length: 4,
        };
        assert_eq!(short.exit_code(), CadenzaError::EmptyCorpus.exit_code());
        assert!(short.to_string().contains("sequence length 4"));
    }
}
