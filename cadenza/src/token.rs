// Token codec: musical events to canonical string tokens and back.
//
// A token is the unit the model predicts. Two shapes exist:
// - Note: a single pitch spelled as a name with octave, e.g. `C4`, `F#3`,
//   `B-2` (`-` is a flat).
// - Chord: the pitch classes of the sounding keys in normal order, joined by
//   `.`, e.g. `0.4.7` for any voicing of a C major triad.
//
// Chords are deliberately lossy: octave and doubling information is dropped
// so that every voicing of the same harmony collapses to one token, which
// keeps the vocabulary small. Decoding puts pitch classes back in octave 4.
// Integer parts of 12 and above are accepted as absolute MIDI keys so that
// hand-written tokens such as `60.64.67` also decode.
//
// Decoding never fails hard. Empty or malformed tokens decode to `None` and
// are logged; the event serializer (serialize.rs) skips them without
// advancing time.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between the parts of a chord token.
pub const CHORD_SEPARATOR: char = '.';

/// Octave that chord pitch classes are placed in when decoded.
pub const CHORD_OCTAVE: i32 = 4;

/// Default spelling of the twelve pitch classes.
const PITCH_CLASS_NAMES: [&str; 12] = [
    "C", "C#", "D", "E-", "E", "F", "F#", "G", "G#", "A", "B-", "B",
];

/// A canonical string token. Equality and ordering are by string value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    pub fn new(text: impl Into<String>) -> Self {
        Token(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the token holds more than one pitch identifier.
    pub fn is_chord(&self) -> bool {
        self.0.contains(CHORD_SEPARATOR)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Token {
    fn from(text: &str) -> Self {
        Token::new(text)
    }
}

/// A musical event as extracted from a corpus file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MusicalEvent {
    /// One sounding key.
    Note { key: u8 },
    /// Several keys struck together, in any order.
    Chord { keys: Vec<u8> },
}

impl MusicalEvent {
    /// Classify a group of simultaneous keys. Returns `None` for no keys.
    pub fn from_keys(keys: &[u8]) -> Option<Self> {
        match keys {
            [] => None,
            [key] => Some(MusicalEvent::Note { key: *key }),
            _ => Some(MusicalEvent::Chord {
                keys: keys.to_vec(),
            }),
        }
    }
}

/// A decoded event placed in time. Offsets are in beats (quarter notes).
#[derive(Clone, Debug, PartialEq)]
pub struct TimedEvent {
    pub offset: f64,
    /// Keys sounding together; more than one means a chord.
    pub keys: Vec<u8>,
}

impl TimedEvent {
    pub fn is_chord(&self) -> bool {
        self.keys.len() > 1
    }
}

/// Encode a musical event as its canonical token.
pub fn encode_event(event: &MusicalEvent) -> Token {
    match event {
        MusicalEvent::Note { key } => Token(pitch_name(*key)),
        MusicalEvent::Chord { keys } => {
            let parts: Vec<String> = normal_order(keys).iter().map(u8::to_string).collect();
            Token(parts.join(&CHORD_SEPARATOR.to_string()))
        }
    }
}

/// Decode a token into an event starting at `offset` beats.
///
/// Returns `None` (and logs) for empty or malformed tokens.
pub fn decode_token(token: &Token, offset: f64) -> Option<TimedEvent> {
    let text = token.as_str().trim();
    if text.is_empty() {
        log::warn!("skipping empty token");
        return None;
    }
    let keys = if token.is_chord() {
        text.split(CHORD_SEPARATOR)
            .map(chord_part_key)
            .collect::<Option<Vec<u8>>>()
    } else if text.bytes().all(|b| b.is_ascii_digit()) {
        // A chord that collapsed to a single pitch class has no separator.
        chord_part_key(text).map(|key| vec![key])
    } else {
        parse_pitch_name(text).map(|key| vec![key])
    };
    match keys {
        Some(keys) => Some(TimedEvent { offset, keys }),
        None => {
            log::warn!("skipping malformed token {text:?}");
            None
        }
    }
}

/// Pitch classes of `keys` in normal order.
///
/// The distinct pitch classes are sorted, then the rotation with the smallest
/// span from first to last element wins. Ties go to the rotation with the
/// smaller span from the first element to the second-to-last, then to the
/// third-to-last, and so on; a remaining tie goes to the lowest first pitch
/// class.
pub fn normal_order(keys: &[u8]) -> Vec<u8> {
    let mut pcs: Vec<u8> = keys.iter().map(|k| k % 12).collect();
    pcs.sort_unstable();
    pcs.dedup();
    let n = pcs.len();
    if n <= 1 {
        return pcs;
    }

    let best = (0..n)
        .map(|r| (0..n).map(|i| pcs[(r + i) % n]).collect::<Vec<u8>>())
        .min_by_key(|rotation| {
            let span = |j: usize| (rotation[j] + 12 - rotation[0]) % 12;
            let mut key: Vec<u8> = (1..n).rev().map(span).collect();
            key.push(rotation[0]);
            key
        });
    best.unwrap_or(pcs)
}

/// Spell a MIDI key as a pitch name with octave, e.g. 60 -> `C4`.
pub fn pitch_name(key: u8) -> String {
    let octave = i32::from(key / 12) - 1;
    format!("{}{}", PITCH_CLASS_NAMES[usize::from(key % 12)], octave)
}

/// Parse a pitch name such as `C4`, `F#3`, `B-2` or `Bb2` into a MIDI key.
///
/// Accidentals are consumed greedily, so a `-` directly before the octave
/// digits is read as a flat rather than a negative sign.
pub fn parse_pitch_name(name: &str) -> Option<u8> {
    let mut chars = name.chars().peekable();
    let base: i32 = match chars.next()? {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return None,
    };
    let mut alter = 0i32;
    while let Some(&c) = chars.peek() {
        match c {
            '#' => alter += 1,
            '-' | 'b' => alter -= 1,
            _ => break,
        }
        chars.next();
    }
    let octave: i32 = chars.collect::<String>().parse().ok()?;
    let key = 12 * (octave + 1) + base + alter;
    u8::try_from(key).ok().filter(|k| *k <= 127)
}

/// Key for one `.`-separated part of a chord token.
fn chord_part_key(part: &str) -> Option<u8> {
    let value: u8 = part.trim().parse().ok()?;
    match value {
        0..=11 => u8::try_from(12 * (CHORD_OCTAVE + 1) + i32::from(value)).ok(),
        12..=127 => Some(value),
        _ => None,
    }
}
