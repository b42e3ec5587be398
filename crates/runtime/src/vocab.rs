// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Vocabulary and greedy longest-match tokenizer.
//!
//! The model file stores `n_vocab` records of `u32 len`, `len` UTF-8 bytes
//! and, when the header says so, an `f32` score. Record `i` is token id `i`.

use std::collections::HashMap;
use std::io::{self, Write};
use tensor_core::{InputFile, StreamError};

/// Index of a token in the vocabulary.
pub type TokenId = i32;

/// A token's text and its score.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenScore {
    pub text: String,
    pub score: f32,
}

/// Bidirectional token table.
#[derive(Debug, Clone, Default)]
pub struct Vocab {
    token_to_id: HashMap<String, TokenId>,
    id_to_token: Vec<TokenScore>,
    /// Longest token in bytes, bounds the tokenizer's lookahead.
    max_token_len: usize,
}

impl Vocab {
    /// Reads `size` records from `stream`.
    ///
    /// A `size` the rest of the file cannot hold is `Truncated` before
    /// anything is allocated.
    pub fn load(stream: &InputFile, size: usize, with_scores: bool) -> Result<Self, StreamError> {
        let offset = stream.tell()?;
        let min_record = if with_scores { 8 } else { 4 };
        let needed = size.saturating_mul(min_record);
        if offset.saturating_add(needed as u64) > stream.len() {
            return Err(StreamError::Truncated {
                offset,
                needed,
                len: stream.len(),
            });
        }
        let mut tokens = Vec::with_capacity(size);
        for _ in 0..size {
            let len = stream.read_u32()? as usize;
            let text = stream.read_string(len)?;
            let score = if with_scores { stream.read_f32()? } else { 0.0 };
            tokens.push(TokenScore { text, score });
        }
        Ok(Self::from_tokens(tokens))
    }

    /// Builds a vocabulary; a repeated text maps to its last id.
    pub fn from_tokens(tokens: impl IntoIterator<Item = TokenScore>) -> Self {
        let mut vocab = Self::default();
        for (id, tok) in tokens.into_iter().enumerate() {
            vocab.max_token_len = vocab.max_token_len.max(tok.text.len());
            vocab.token_to_id.insert(tok.text.clone(), id as TokenId);
            vocab.id_to_token.push(tok);
        }
        vocab
    }

    /// Writes the records in the model-file layout.
    pub fn write(&self, out: &mut impl Write, with_scores: bool) -> io::Result<()> {
        for tok in &self.id_to_token {
            out.write_all(&(tok.text.len() as u32).to_le_bytes())?;
            out.write_all(tok.text.as_bytes())?;
            if with_scores {
                out.write_all(&tok.score.to_le_bytes())?;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }

    pub fn map_to_id(&self, text: &str) -> Option<TokenId> {
        self.token_to_id.get(text).copied()
    }

    pub fn unmap_to_token(&self, id: TokenId) -> Option<&str> {
        self.get(id).map(|t| t.text.as_str())
    }

    pub fn score(&self, id: TokenId) -> Option<f32> {
        self.get(id).map(|t| t.score)
    }

    fn get(&self, id: TokenId) -> Option<&TokenScore> {
        usize::try_from(id).ok().and_then(|i| self.id_to_token.get(i))
    }

    /// Splits `text` into the longest matching tokens, left to right.
    ///
    /// Characters no token starts with are dropped.
    pub fn tokenize(&self, text: &str) -> Vec<TokenId> {
        let mut ids = Vec::new();
        let mut pos = 0;
        while pos < text.len() {
            let rest = &text[pos..];
            let longest = (1..=self.max_token_len.min(rest.len()))
                .rev()
                .filter(|&n| rest.is_char_boundary(n))
                .find_map(|n| self.map_to_id(&rest[..n]).map(|id| (id, n)));

            match longest {
                Some((id, n)) => {
                    ids.push(id);
                    pos += n;
                }
                None => {
                    let skip = rest.chars().next().map_or(1, char::len_utf8);
                    tracing::debug!(unknown = &rest[..skip], "no token for input; skipping");
                    pos += skip;
                }
            }
        }
        ids
    }

    /// Concatenates the text of `ids`; unknown ids are skipped.
    pub fn detokenize(&self, ids: &[TokenId]) -> String {
        ids.iter().filter_map(|&id| self.unmap_to_token(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn vocab(words: &[&str]) -> Vocab {
        Vocab::from_tokens(words.iter().enumerate().map(|(i, w)| TokenScore {
            text: w.to_string(),
            score: -(i as f32),
        }))
    }

    #[test]
    fn test_longest_match_wins() {
        let v = vocab(&["a", "b", "ab", "abc", " "]);
        assert_eq!(v.tokenize("abcab a"), vec![3, 2, 4, 0]);
        assert_eq!(v.detokenize(&[3, 2, 4, 0]), "abcab a");
    }

    #[test]
    fn test_unknown_characters_are_skipped() {
        let v = vocab(&["h", "i"]);
        assert_eq!(v.tokenize("hé!i"), vec![0, 1]);
        assert!(v.tokenize("").is_empty());
    }

    #[test]
    fn test_multibyte_tokens() {
        let v = vocab(&["é", "ét", "t"]);
        assert_eq!(v.tokenize("étét"), vec![1, 1]);
    }

    #[test]
    fn test_lookup_bounds() {
        let v = vocab(&["x"]);
        assert_eq!(v.map_to_id("x"), Some(0));
        assert_eq!(v.map_to_id("y"), None);
        assert_eq!(v.unmap_to_token(-1), None);
        assert_eq!(v.unmap_to_token(1), None);
    }

    fn round_trip(with_scores: bool) {
        let v = vocab(&["hello", " ", "wörld"]);
        let mut f = tempfile::NamedTempFile::new().unwrap();
        v.write(f.as_file_mut(), with_scores).unwrap();

        let stream = Arc::new(InputFile::open(f.path(), false).unwrap());
        let back = Vocab::load(&stream, 3, with_scores).unwrap();
        assert!(stream.is_eof().unwrap());
        assert_eq!(back.len(), 3);
        assert_eq!(back.map_to_id("wörld"), Some(2));
        let expected = if with_scores { -2.0 } else { 0.0 };
        assert_eq!(back.score(2), Some(expected));
    }

    #[test]
    fn test_load_with_scores() {
        round_trip(true);
    }

    #[test]
    fn test_load_without_scores() {
        round_trip(false);
    }

    #[test]
    fn test_size_beyond_file_is_truncated() {
        let v = vocab(&["a", "b"]);
        let mut f = tempfile::NamedTempFile::new().unwrap();
        v.write(f.as_file_mut(), true).unwrap();

        let stream = InputFile::open(f.path(), false).unwrap();
        let err = Vocab::load(&stream, u32::MAX as usize, true).unwrap_err();
        assert!(matches!(err, StreamError::Truncated { offset: 0, .. }));
        // Two scored records are 18 bytes; a third cannot fit.
        assert!(Vocab::load(&stream, 3, true).is_err());
    }

    #[test]
    fn test_duplicate_text_maps_to_last_id() {
        let v = vocab(&["a", "a"]);
        assert_eq!(v.map_to_id("a"), Some(1));
        assert_eq!(v.len(), 2);
    }
}
