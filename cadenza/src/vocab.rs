// Vocabulary: deterministic bijection between tokens and dense ids.
//
// Built from the set of distinct tokens sorted by byte order, so the same
// token set always gets the same ids no matter how the corpus was ordered or
// how often each token occurs. Serialized as the plain token list in id
// order; deserialization re-checks that the list is sorted and duplicate
// free, which is what makes a reloaded vocabulary identical to a rebuilt one.

use crate::error::{CadenzaError, Result};
use crate::token::Token;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeSet, HashMap};

/// Token <-> id mapping with ids in `[0, len)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vocabulary {
    tokens: Vec<Token>,
    ids: HashMap<Token, usize>,
}

impl Vocabulary {
    /// Build from a token stream. Fails with `EmptyCorpus` if it is empty.
    pub fn build<'a>(stream: impl IntoIterator<Item = &'a Token>) -> Result<Self> {
        let distinct: BTreeSet<&Token> = stream.into_iter().collect();
        if distinct.is_empty() {
            return Err(CadenzaError::EmptyCorpus);
        }
        Ok(Self::from_sorted(distinct.into_iter().cloned().collect()))
    }

    /// Rebuild from a persisted token list, validating its order.
    pub fn from_token_list(tokens: Vec<Token>) -> Result<Self> {
        if tokens.is_empty() {
            return Err(CadenzaError::EmptyCorpus);
        }
        if let Some(pair) = tokens.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(CadenzaError::ArtifactMismatch(format!(
                "vocabulary list is not strictly sorted at {:?} / {:?}",
                pair[0].as_str(),
                pair[1].as_str()
            )));
        }
        Ok(Self::from_sorted(tokens))
    }

    fn from_sorted(tokens: Vec<Token>) -> Self {
        let ids = tokens
            .iter()
            .enumerate()
            .map(|(id, token)| (token.clone(), id))
            .collect();
        Vocabulary { tokens, ids }
    }

    /// Number of tokens, `V`.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn encode(&self, token: &Token) -> Result<usize> {
        self.ids
            .get(token)
            .copied()
            .ok_or_else(|| CadenzaError::UnknownToken(token.as_str().to_string()))
    }

    pub fn decode_id(&self, id: usize) -> Result<&Token> {
        self.tokens.get(id).ok_or(CadenzaError::UnknownId {
            id,
            vocab_size: self.tokens.len(),
        })
    }

    /// Encode a whole stream, failing on the first unknown token.
    pub fn encode_all<'a>(&self, stream: impl IntoIterator<Item = &'a Token>) -> Result<Vec<usize>> {
        stream.into_iter().map(|t| self.encode(t)).collect()
    }

    /// Decode a whole id sequence, failing on the first out-of-range id.
    pub fn decode_all(&self, ids: &[usize]) -> Result<Vec<Token>> {
        ids.iter().map(|&id| self.decode_id(id).cloned()).collect()
    }

    /// Tokens in id order.
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }
}

impl Serialize for Vocabulary {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.tokens.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Vocabulary {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let tokens = Vec::<Token>::deserialize(deserializer)?;
        Vocabulary::from_token_list(tokens).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(texts: &[&str]) -> Vec<Token> {
        texts.iter().map(|t| Token::from(*t)).collect()
    }

    #[test]
    fn ids_follow_lexicographic_order() {
        let stream = tokens(&["C4", "C4", "E4.G4", "D4"]);
        let vocab = Vocabulary::build(&stream).unwrap();
        assert_eq!(vocab.len(), 3);
        assert_eq!(vocab.encode(&Token::from("C4")).unwrap(), 0);
        assert_eq!(vocab.encode(&Token::from("D4")).unwrap(), 1);
        assert_eq!(vocab.encode(&Token::from("E4.G4")).unwrap(), 2);
    }

    #[test]
    fn build_ignores_order_and_multiplicity() {
        let a = Vocabulary::build(&tokens(&["C4", "C4", "E4.G4", "D4"])).unwrap();
        let b = Vocabulary::build(&tokens(&["D4", "E4.G4", "C4"])).unwrap();
        let c = Vocabulary::build(&tokens(&["E4.G4", "D4", "D4", "C4", "E4.G4"])).unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&c).unwrap()
        );
    }

    #[test]
    fn every_permutation_of_a_multiset_agrees() {
        let base = tokens(&["G4", "0.4.7", "C#4", "G4", "B-3", "0.4.7"]);
        let reference = Vocabulary::build(&base).unwrap();
        for rotate in 0..base.len() {
            let mut shuffled = base.clone();
            shuffled.rotate_left(rotate);
            shuffled.reverse();
            assert_eq!(Vocabulary::build(&shuffled).unwrap(), reference);
        }
    }

    #[test]
    fn encode_decode_roundtrip_for_every_token() {
        let vocab = Vocabulary::build(&tokens(&["A3", "9.0.4", "F#5", "E-4", "7.11.2"])).unwrap();
        for token in vocab.tokens() {
            let id = vocab.encode(token).unwrap();
            assert_eq!(vocab.decode_id(id).unwrap(), token);
        }
    }

    #[test]
    fn empty_stream_is_empty_corpus() {
        let err = Vocabulary::build(&Vec::<Token>::new()).unwrap_err();
        assert!(matches!(err, CadenzaError::EmptyCorpus));
    }

    #[test]
    fn unknown_token_and_id_are_errors() {
        let vocab = Vocabulary::build(&tokens(&["C4"])).unwrap();
        assert!(matches!(
            vocab.encode(&Token::from("D4")),
            Err(CadenzaError::UnknownToken(t)) if t == "D4"
        ));
        assert!(matches!(
            vocab.decode_id(1),
            Err(CadenzaError::UnknownId { id: 1, vocab_size: 1 })
        ));
    }

    #[test]
    fn json_roundtrip_preserves_ids() {
        let vocab = Vocabulary::build(&tokens(&["E4", "C4", "0.4.7"])).unwrap();
        let json = serde_json::to_string(&vocab).unwrap();
        assert_eq!(json, r#"["0.4.7","C4","E4"]"#);
        let restored: Vocabulary = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, vocab);
    }

    #[test]
    fn unsorted_persisted_list_is_rejected() {
        let err = serde_json::from_str::<Vocabulary>(r#"["E4","C4"]"#).unwrap_err();
        assert!(err.to_string().contains("not strictly sorted"), "{err}");
        assert!(serde_json::from_str::<Vocabulary>(r#"["C4","C4"]"#).is_err());
    }

    #[test]
    fn encode_all_maps_stream() {
        let stream = tokens(&["C4", "C4", "E4.G4", "D4"]);
        let vocab = Vocabulary::build(&stream).unwrap();
        assert_eq!(vocab.encode_all(&stream).unwrap(), vec![0, 0, 2, 1]);
        assert_eq!(vocab.decode_all(&[2, 1]).unwrap(), tokens(&["E4.G4", "D4"]));
    }
}
