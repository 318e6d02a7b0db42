// MIDI output from generated token sequences.
//
// Tokens are decoded into an `EventStream` of timed events spaced a fixed
// number of beats apart, then rendered as a Standard MIDI File (Format 1):
// track 0 carries the tempo, track 1 carries every note on channel 0 with a
// single program change up front. Tokens that fail to decode are skipped and
// do not consume a time slot.
//
// Each event sounds for `note_beats`, except that a note is cut off where the
// same key is struck again, so overlapping re-strikes never leave a key
// with two pending note-offs. At equal ticks note-offs are written before
// note-ons.
//
// Uses the `midly` crate for MIDI writing.

use crate::config::OutputConfig;
use crate::error::{CadenzaError, Result};
use crate::token::{Token, TimedEvent, decode_token};
use midly::{
    Format, Header, MetaMessage, MidiMessage, Smf, Timing, Track, TrackEvent, TrackEventKind,
    num::{u4, u7, u15, u24, u28},
};
use std::collections::BTreeSet;
use std::path::Path;

const CHANNEL: u8 = 0;

/// A quantized, single-instrument performance.
#[derive(Clone, Debug, PartialEq)]
pub struct EventStream {
    pub tempo_bpm: u16,
    /// General MIDI program number.
    pub program: u8,
    /// Beats between consecutive event onsets.
    pub step_beats: f64,
    /// Sounding length of each event before re-strike truncation.
    pub note_beats: f64,
    pub events: Vec<TimedEvent>,
}

/// Decode `tokens` into events at offsets 0, step, 2 * step, ...
pub fn to_event_stream(tokens: &[Token], config: &OutputConfig) -> EventStream {
    let mut events = Vec::with_capacity(tokens.len());
    for token in tokens {
        let offset = events.len() as f64 * config.step_beats;
        if let Some(event) = decode_token(token, offset) {
            events.push(event);
        }
    }
    let skipped = tokens.len() - events.len();
    if skipped > 0 {
        log::warn!("skipped {skipped} of {} tokens that did not decode", tokens.len());
    }
    EventStream {
        tempo_bpm: config.tempo_bpm,
        program: config.program,
        step_beats: config.step_beats,
        note_beats: config.note_beats,
        events,
    }
}

/// Render the stream as an in-memory SMF.
pub fn to_smf(stream: &EventStream, config: &OutputConfig) -> Smf<'static> {
    let tpq = config.ticks_per_quarter.clamp(1, 0x7fff);
    let mut smf = Smf::new(Header::new(Format::Parallel, Timing::Metrical(u15::new(tpq))));

    // Track 0: tempo track
    let mut tempo_track: Track<'static> = Vec::new();
    let tempo_microseconds = (60_000_000 / u32::from(stream.tempo_bpm.max(1))).min(0xff_ffff);
    tempo_track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(tempo_microseconds))),
    });
    tempo_track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });
    smf.tracks.push(tempo_track);

    // Track 1: the instrument
    let channel = u4::new(CHANNEL);
    let mut track: Track<'static> = vec![
        TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::TrackName(b"Cadenza")),
        },
        TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Midi {
                channel,
                message: MidiMessage::ProgramChange {
                    program: u7::new(stream.program.min(127)),
                },
            },
        },
    ];

    let velocity = u7::new(config.velocity.min(127));
    let mut last_tick = 0u32;
    for note in schedule_notes(stream, tpq) {
        let message = if note.on {
            MidiMessage::NoteOn { key: u7::new(note.key), vel: velocity }
        } else {
            MidiMessage::NoteOff { key: u7::new(note.key), vel: u7::new(0) }
        };
        track.push(TrackEvent {
            delta: u28::new((note.tick - last_tick).min(0x0fff_ffff)),
            kind: TrackEventKind::Midi { channel, message },
        });
        last_tick = note.tick;
    }
    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });
    smf.tracks.push(track);

    smf
}

/// Write the stream to `path`, creating parent directories as needed.
pub fn write(stream: &EventStream, path: &Path, config: &OutputConfig) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| CadenzaError::io(parent, e))?;
    }
    let smf = to_smf(stream, config);
    let mut buf = Vec::new();
    smf.write_std(&mut buf).map_err(|e| CadenzaError::io(path, e))?;
    std::fs::write(path, &buf).map_err(|e| CadenzaError::io(path, e))?;
    log::info!(
        "wrote {} events ({} bytes) to {}",
        stream.events.len(),
        buf.len(),
        path.display()
    );
    Ok(())
}

/// One note-on or note-off at an absolute tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct NoteEdge {
    tick: u32,
    /// false sorts first: offs precede ons at the same tick.
    on: bool,
    key: u8,
}

fn beats_to_ticks(beats: f64, tpq: u16) -> u32 {
    (beats * f64::from(tpq)).round().clamp(0.0, f64::from(u32::MAX)) as u32
}

/// Absolute-time note edges for every event, sorted for emission.
fn schedule_notes(stream: &EventStream, tpq: u16) -> Vec<NoteEdge> {
    let onsets: Vec<(u32, BTreeSet<u8>)> = stream
        .events
        .iter()
        .map(|e| {
            let keys = e.keys.iter().map(|&k| k.min(127)).collect();
            (beats_to_ticks(e.offset, tpq), keys)
        })
        .collect();

    let mut edges = Vec::new();
    // Ticks at which each key is next struck, filled walking backwards.
    let mut next_strike: [Option<u32>; 128] = [None; 128];
    let length = beats_to_ticks(stream.note_beats, tpq).max(1);
    for (start, keys) in onsets.iter().rev() {
        for &key in keys {
            let natural_end = start.saturating_add(length);
            let end = match next_strike[usize::from(key)] {
                Some(next) => natural_end.min(next),
                None => natural_end,
            };
            edges.push(NoteEdge { tick: *start, on: true, key });
            edges.push(NoteEdge { tick: end, on: false, key });
            next_strike[usize::from(key)] = Some(*start);
        }
    }
    edges.sort();
    edges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(texts: &[&str]) -> Vec<Token> {
        texts.iter().map(|&t| Token::from(t)).collect()
    }

    /// (tick, on, key) for every note message in the instrument track.
    fn note_messages(smf: &Smf<'_>) -> Vec<(u32, bool, u8)> {
        let mut tick = 0;
        let mut out = Vec::new();
        for event in &smf.tracks[1] {
            tick += event.delta.as_int();
            if let TrackEventKind::Midi { message, .. } = event.kind {
                match message {
                    MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                        out.push((tick, true, key.as_int()))
                    }
                    MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                        out.push((tick, false, key.as_int()))
                    }
                    _ => {}
                }
            }
        }
        out
    }

    #[test]
    fn offsets_advance_by_the_step() {
        let config = OutputConfig::default();
        let stream = to_event_stream(&tokens(&["C4", "0.4.7", "E-4", "G#3", "60.64"]), &config);
        assert_eq!(stream.events.len(), 5);
        for (i, event) in stream.events.iter().enumerate() {
            assert_eq!(event.offset, i as f64 * 0.5);
        }
        assert!(stream.events.windows(2).all(|w| w[1].offset > w[0].offset));
        assert_eq!(stream.tempo_bpm, 100);
        assert_eq!(stream.program, 0);
    }

    #[test]
    fn fine_steps_do_not_accumulate_drift() {
        let config = OutputConfig { step_beats: 0.1, ..Default::default() };
        let texts: Vec<&str> = std::iter::repeat_n("C4", 1000).collect();
        let stream = to_event_stream(&tokens(&texts), &config);
        for (i, event) in stream.events.iter().enumerate() {
            assert_eq!(event.offset, i as f64 * 0.1);
        }
        assert_eq!(stream.events[999].offset, 999.0 * 0.1);
    }

    #[test]
    fn undecodable_tokens_do_not_consume_a_slot() {
        let config = OutputConfig::default();
        let stream = to_event_stream(&tokens(&["C4", "", "H9", "D4"]), &config);
        assert_eq!(stream.events.len(), 2);
        assert_eq!(stream.events[0].keys, vec![60]);
        assert_eq!(stream.events[1].keys, vec![62]);
        assert_eq!(stream.events[1].offset, 0.5);
    }

    #[test]
    fn smf_has_tempo_and_instrument_tracks() {
        let config = OutputConfig::default();
        let stream = to_event_stream(&tokens(&["C4", "0.4.7"]), &config);
        let smf = to_smf(&stream, &config);
        assert_eq!(smf.header.format, Format::Parallel);
        assert_eq!(smf.tracks.len(), 2);
        assert!(smf.tracks[0].iter().any(|e| matches!(
            e.kind,
            TrackEventKind::Meta(MetaMessage::Tempo(t)) if t.as_int() == 600_000
        )));
        assert!(smf.tracks[1].iter().any(|e| matches!(
            e.kind,
            TrackEventKind::Midi { message: MidiMessage::ProgramChange { program }, .. }
                if program.as_int() == 0
        )));
    }

    #[test]
    fn chord_sounds_together_for_a_quarter() {
        let config = OutputConfig::default();
        let stream = to_event_stream(&tokens(&["0.4.7"]), &config);
        let notes = note_messages(&to_smf(&stream, &config));
        assert_eq!(
            notes,
            vec![
                (0, true, 60),
                (0, true, 64),
                (0, true, 67),
                (480, false, 60),
                (480, false, 64),
                (480, false, 67),
            ]
        );
    }

    #[test]
    fn restruck_key_is_cut_short() {
        let config = OutputConfig::default();
        let stream = to_event_stream(&tokens(&["C4", "C4", "D4"]), &config);
        let notes = note_messages(&to_smf(&stream, &config));
        assert_eq!(
            notes,
            vec![
                (0, true, 60),
                (240, false, 60),
                (240, true, 60),
                (480, true, 62),
                (720, false, 60),
                (960, false, 62),
            ]
        );
    }

    #[test]
    fn written_file_parses_back() {
        let dir = tempdir::TempDir::new("cadenza-serialize").unwrap();
        let path = dir.path().join("nested/out/song.mid");
        let config = OutputConfig::default();
        let stream = to_event_stream(&tokens(&["C4", "E4", "0.4.7", "G4"]), &config);
        write(&stream, &path, &config).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let smf = Smf::parse(&bytes).unwrap();
        assert_eq!(smf.tracks.len(), 2);
        let ons = note_messages(&smf).iter().filter(|n| n.1).count();
        assert_eq!(ons, 6);

        // Overwriting gives the same bytes.
        write(&stream, &path, &config).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
    }

    #[test]
    fn empty_stream_still_writes_a_valid_file() {
        let dir = tempdir::TempDir::new("cadenza-serialize").unwrap();
        let path = dir.path().join("empty.mid");
        let config = OutputConfig::default();
        let stream = to_event_stream(&tokens(&["", "??"]), &config);
        assert!(stream.events.is_empty());
        write(&stream, &path, &config).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert!(note_messages(&Smf::parse(&bytes).unwrap()).is_empty());
    }
}
