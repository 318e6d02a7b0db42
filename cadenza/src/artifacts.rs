// Artifact store: the files that carry state between pipeline phases.
//
// All three artifacts are JSON under `PipelineConfig::artifacts_dir`:
// - `notes.json`: the full token stream in corpus order.
// - `vocab.json`: the vocabulary as a token list in id order.
// - `model.json`: the trained network's shape and weights.
//
// Saving creates the directory. Loading a file that does not exist is a
// `MissingArtifact` error pointing the user at `cadenza train`; a file that
// exists but does not parse is a `Json` error with the path.

use crate::config::PipelineConfig;
use crate::error::{CadenzaError, Result};
use crate::model::RecurrentNet;
use crate::token::Token;
use crate::vocab::Vocabulary;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| CadenzaError::io(parent, e))?;
    }
    Ok(())
}

fn require(path: &Path, what: &'static str) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(CadenzaError::MissingArtifact {
            what,
            path: path.to_path_buf(),
        })
    }
}

fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let json = serde_json::to_string(value).map_err(|e| CadenzaError::json(path, e))?;
    std::fs::write(path, json).map_err(|e| CadenzaError::io(path, e))
}

fn load_json<T: DeserializeOwned>(path: &Path, what: &'static str) -> Result<T> {
    require(path, what)?;
    let data = std::fs::read_to_string(path).map_err(|e| CadenzaError::io(path, e))?;
    serde_json::from_str(&data).map_err(|e| CadenzaError::json(path, e))
}

pub fn save_notes(config: &PipelineConfig, tokens: &[Token]) -> Result<()> {
    let path = config.notes_path();
    save_json(&path, tokens)?;
    log::info!("saved {} tokens to {}", tokens.len(), path.display());
    Ok(())
}

pub fn load_notes(config: &PipelineConfig) -> Result<Vec<Token>> {
    load_json(&config.notes_path(), "token stream")
}

pub fn save_vocab(config: &PipelineConfig, vocab: &Vocabulary) -> Result<()> {
    let path = config.vocab_path();
    save_json(&path, vocab)?;
    log::info!("saved {} vocabulary entries to {}", vocab.len(), path.display());
    Ok(())
}

pub fn load_vocab(config: &PipelineConfig) -> Result<Vocabulary> {
    load_json(&config.vocab_path(), "vocabulary")
}

pub fn save_model(config: &PipelineConfig, model: &RecurrentNet) -> Result<()> {
    let path = config.model_path();
    ensure_parent(&path)?;
    model.save(&path)
}

pub fn load_model(config: &PipelineConfig) -> Result<RecurrentNet> {
    let path = config.model_path();
    require(&path, "model weights")?;
    RecurrentNet::load(&path)
}
