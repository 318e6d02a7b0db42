// Corpus loader: MIDI files to a flat token stream.
//
// Every `.mid` / `.midi` file (extension matched case-insensitively) directly
// inside the corpus directory is parsed with `midly`, in sorted filename
// order so the stream is reproducible across platforms. Within a file, tracks
// are read in order; each note-on with non-zero velocity is an onset, and
// onsets that share an absolute tick in one track form a chord. Each onset
// group becomes one token through the token codec.
//
// A file that fails to read or parse is logged and skipped. Only a corpus
// that yields no tokens at all is an error.

use crate::error::{CadenzaError, Result};
use crate::token::{MusicalEvent, Token, encode_event};
use midly::{MidiMessage, Smf, TrackEventKind};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

const EXTENSIONS: [&str; 2] = ["mid", "midi"];

/// MIDI files directly inside `dir`, sorted by file name.
pub fn midi_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| CadenzaError::io(dir, e))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| CadenzaError::io(dir, e))?.path();
        let is_midi = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| EXTENSIONS.iter().any(|m| ext.eq_ignore_ascii_case(m)));
        if is_midi && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Tokens for every onset group in a parsed file, track by track.
pub fn extract_tokens(smf: &Smf<'_>) -> Vec<Token> {
    let mut tokens = Vec::new();
    for track in &smf.tracks {
        let mut tick: u64 = 0;
        let mut group_tick: u64 = 0;
        let mut group: BTreeSet<u8> = BTreeSet::new();
        for event in track {
            tick += u64::from(event.delta.as_int());
            let TrackEventKind::Midi {
                message: MidiMessage::NoteOn { key, vel },
                ..
            } = event.kind
            else {
                continue;
            };
            if vel.as_int() == 0 {
                continue;
            }
            if tick != group_tick && !group.is_empty() {
                flush(&mut group, &mut tokens);
            }
            group_tick = tick;
            group.insert(key.as_int());
        }
        flush(&mut group, &mut tokens);
    }
    tokens
}

fn flush(group: &mut BTreeSet<u8>, tokens: &mut Vec<Token>) {
    let keys: Vec<u8> = std::mem::take(group).into_iter().collect();
    if let Some(event) = MusicalEvent::from_keys(&keys) {
        tokens.push(encode_event(&event));
    }
}

/// Parse one file into tokens.
pub fn load_file(path: &Path) -> Result<Vec<Token>> {
    let bytes = std::fs::read(path).map_err(|e| CadenzaError::io(path, e))?;
    let smf = Smf::parse(&bytes).map_err(|source| CadenzaError::Midi {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(extract_tokens(&smf))
}

/// Load every MIDI file in `dir` and concatenate their tokens.
pub fn load_corpus(dir: &Path) -> Result<Vec<Token>> {
    let files = midi_files(dir)?;
    if files.is_empty() {
        log::warn!("no MIDI files found in {}", dir.display());
    }
    let mut tokens = Vec::new();
    let mut loaded = 0usize;
    for path in &files {
        match load_file(path) {
            Ok(file_tokens) => {
                log::debug!("{}: {} tokens", path.display(), file_tokens.len());
                tokens.extend(file_tokens);
                loaded += 1;
            }
            Err(e) => log::warn!("skipping {e}"),
        }
    }
    log::info!(
        "loaded {loaded}/{} MIDI files: {} tokens",
        files.len(),
        tokens.len()
    );
    if tokens.is_empty() {
        return Err(CadenzaError::EmptyCorpus);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use midly::{
        Format, Header, MetaMessage, Timing, TrackEvent,
        num::{u4, u7, u15, u28},
    };

    /// A one-track file from (delta, key, velocity) note-ons.
    fn midi_bytes(notes: &[(u32, u8, u8)]) -> Vec<u8> {
        let mut smf = Smf::new(Header::new(Format::SingleTrack, Timing::Metrical(u15::new(480))));
        let mut track: Vec<TrackEvent<'static>> = notes
            .iter()
            .map(|&(delta, key, vel)| TrackEvent {
                delta: u28::new(delta),
                kind: TrackEventKind::Midi {
                    channel: u4::new(0),
                    message: MidiMessage::NoteOn { key: u7::new(key), vel: u7::new(vel) },
                },
            })
            .collect();
        track.push(TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        });
        smf.tracks.push(track);
        let mut buf = Vec::new();
        smf.write_std(&mut buf).unwrap();
        buf
    }

    fn texts(tokens: &[Token]) -> Vec<&str> {
        tokens.iter().map(Token::as_str).collect()
    }

    #[test]
    fn simultaneous_onsets_form_chords() {
        // C4 alone, then C-E-G together (released C4 in between), then D4.
        let bytes = midi_bytes(&[
            (0, 60, 80),
            (480, 60, 0),
            (0, 64, 80),
            (0, 67, 80),
            (0, 60, 80),
            (480, 62, 80),
        ]);
        let smf = Smf::parse(&bytes).unwrap();
        assert_eq!(texts(&extract_tokens(&smf)), vec!["C4", "0.4.7", "D4"]);
    }

    #[test]
    fn files_are_filtered_and_sorted() {
        let dir = tempdir::TempDir::new("cadenza-corpus").unwrap();
        for name in ["b.mid", "a.MIDI", "c.txt", "d.Mid"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("e.mid")).unwrap();
        let names: Vec<String> = midi_files(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.MIDI", "b.mid", "d.Mid"]);
    }

    #[test]
    fn corrupt_file_is_skipped() {
        let dir = tempdir::TempDir::new("cadenza-corpus").unwrap();
        std::fs::write(dir.path().join("1.mid"), midi_bytes(&[(0, 60, 80), (240, 62, 80)])).unwrap();
        std::fs::write(dir.path().join("2.mid"), b"definitely not a midi file").unwrap();
        std::fs::write(dir.path().join("3.mid"), midi_bytes(&[(0, 69, 80)])).unwrap();
        let tokens = load_corpus(dir.path()).unwrap();
        assert_eq!(texts(&tokens), vec!["C4", "D4", "A4"]);
    }

    #[test]
    fn corpus_without_notes_is_empty() {
        let dir = tempdir::TempDir::new("cadenza-corpus").unwrap();
        assert!(matches!(load_corpus(dir.path()), Err(CadenzaError::EmptyCorpus)));
        std::fs::write(dir.path().join("silent.mid"), midi_bytes(&[(0, 60, 0)])).unwrap();
        assert!(matches!(load_corpus(dir.path()), Err(CadenzaError::EmptyCorpus)));
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let dir = tempdir::TempDir::new("cadenza-corpus").unwrap();
        let err = load_corpus(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, CadenzaError::Io { .. }));
        assert_eq!(err.exit_code(), 4);
    }
}
