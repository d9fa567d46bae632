//! Unigram tokenization: Viterbi best-path segmentation over character
//! boundaries.
//!
//! The lattice walks the input one character at a time. At each start
//! position every vocab token matching the remaining bytes proposes a
//! transition scored by its log-probability; when no token covers the next
//! character, an unknown transition of one character is recorded at
//! `min_score - UNK_PENALTY`. Backtracking from the end of the input
//! yields the best path, with runs of consecutive unknowns collapsed to
//! one.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

use crate::byte_level::byte_to_piece;
use crate::charsmap::utf8_char_len;
use crate::error::OpError;
use crate::tensor::{RaggedStringTensor, RaggedTensor, StringTensor};
use crate::trie::Trie;

/// Score penalty below the minimum vocab score for unknown transitions.
const UNK_PENALTY: f32 = 10.0;

/// Static attributes of [`UnigramTokenizer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnigramOptions {
    pub unk_token_id: i32,
    pub byte_fallback: bool,
    pub fuse_unk: bool,
}

impl Default for UnigramOptions {
    fn default() -> Self {
        Self { unk_token_id: 0, byte_fallback: false, fuse_unk: true }
    }
}

/// The built model: trie over vocab tokens plus their scores.
pub struct UnigramModel {
    trie: Trie,
    scores: Vec<f32>,
    min_score: f32,
    unk_token_id: i32,
    byte_fallback: bool,
    fuse_unk: bool,
    byte_ids: [i32; 256],
}

impl UnigramModel {
    pub fn build(
        vocab: &StringTensor,
        scores: &[f32],
        opts: &UnigramOptions,
    ) -> Result<Self, OpError> {
        if vocab.len() != scores.len() {
            return Err(OpError::Shape(format!(
                "UnigramTokenizer: {} vocab tokens but {} scores",
                vocab.len(),
                scores.len()
            )));
        }
        let mut trie = Trie::new();
        let mut min_score = f32::MAX;
        let mut byte_ids = [-1i32; 256];
        for id in 0..vocab.len() {
            let token = vocab.element(id);
            if !token.is_empty() {
                trie.add(token, id as i32);
            }
            min_score = min_score.min(scores[id]);
        }
        if opts.byte_fallback {
            let byte_map: rustc_hash::FxHashMap<&[u8], i32> =
                (0..vocab.len()).map(|id| (vocab.element(id), id as i32)).collect();
            for (byte, slot) in byte_ids.iter_mut().enumerate() {
                if let Some(&id) = byte_map.get(byte_to_piece(byte as u8).as_bytes()) {
                    *slot = id;
                }
            }
        }
        Ok(Self {
            trie,
            scores: scores.to_vec(),
            min_score,
            unk_token_id: opts.unk_token_id,
            byte_fallback: opts.byte_fallback,
            fuse_unk: opts.fuse_unk,
            byte_ids,
        })
    }

    /// Segments one element into token IDs.
    pub fn tokenize(&self, text: &[u8]) -> Vec<i32> {
        if text.is_empty() {
            return Vec::new();
        }

        #[derive(Clone, Copy)]
        struct BestPathNode {
            token_id: i32,
            best_score: f32,
            starts_at: i32,
        }

        let input_length = text.len();
        let unk_score = self.min_score - UNK_PENALTY;
        let mut best_path = vec![
            BestPathNode { token_id: self.unk_token_id, best_score: 0.0, starts_at: -1 };
            input_length + 1
        ];

        let mut starts_at = 0usize;
        while starts_at < input_length {
            let best_score_so_far = best_path[starts_at].best_score;
            let next_char_input_length =
                utf8_char_len(text[starts_at]).min(input_length - starts_at);
            let mut found_next_char_token = false;

            for (length, token_id) in self.trie.prefix_matches(&text[starts_at..]) {
                let ends_at = starts_at + length;
                let candidate = self.scores[token_id as usize] + best_score_so_far;
                let target = &mut best_path[ends_at];
                if target.starts_at == -1 || candidate > target.best_score {
                    target.best_score = candidate;
                    target.starts_at = starts_at as i32;
                    target.token_id = token_id;
                }
                if length == next_char_input_length {
                    found_next_char_token = true;
                }
            }

            if !found_next_char_token {
                let candidate = unk_score + best_score_so_far;
                let target = &mut best_path[starts_at + next_char_input_length];
                if target.starts_at == -1 || candidate > target.best_score {
                    target.best_score = candidate;
                    target.starts_at = starts_at as i32;
                    target.token_id = self.unk_token_id;
                }
            }
            starts_at += next_char_input_length;
        }

        // Backtrack, collapsing consecutive unknowns.
        let mut segments: Vec<(i32, usize, usize)> = Vec::new();
        let mut ends_at = input_length;
        let mut prev_token_id = -1;
        while ends_at > 0 {
            let node = best_path[ends_at];
            let starts = node.starts_at.max(0) as usize;
            let fused = self.fuse_unk
                && !segments.is_empty()
                && node.token_id == self.unk_token_id
                && prev_token_id == self.unk_token_id;
            if fused {
                // Extend the previously collected unknown leftward.
                if let Some(last) = segments.last_mut() {
                    last.1 = starts;
                }
            } else {
                segments.push((node.token_id, starts, ends_at));
                prev_token_id = node.token_id;
            }
            ends_at = starts;
        }
        segments.reverse();

        let mut result = Vec::with_capacity(segments.len());
        for (token_id, starts, ends) in segments {
            if token_id == self.unk_token_id && self.byte_fallback {
                if let Some(byte_tokens) = self.bytes_as_pieces(&text[starts..ends]) {
                    result.extend_from_slice(&byte_tokens);
                    continue;
                }
            }
            result.push(token_id);
        }
        result
    }

    /// The `<0xHH>` piece IDs for a byte stretch, if every byte has one.
    fn bytes_as_pieces(&self, bytes: &[u8]) -> Option<Vec<i32>> {
        bytes
            .iter()
            .map(|&b| {
                let id = self.byte_ids[b as usize];
                (id >= 0).then_some(id)
            })
            .collect()
    }
}

/// Unigram tokenizer over pre-tokenized ragged strings.
pub struct UnigramTokenizer {
    opts: UnigramOptions,
    state: OnceLock<Arc<UnigramModel>>,
}

impl UnigramTokenizer {
    pub fn new(opts: UnigramOptions) -> Self {
        Self { opts, state: OnceLock::new() }
    }

    pub fn evaluate(
        &self,
        input: &RaggedStringTensor,
        vocab: &StringTensor,
        scores: &[f32],
    ) -> Result<RaggedTensor<i32>, OpError> {
        input.validate("UnigramTokenizer")?;
        let model = match self.state.get() {
            Some(model) => model,
            None => {
                let built = Arc::new(UnigramModel::build(vocab, scores, &self.opts)?);
                self.state.get_or_init(|| built)
            }
        };

        let mut begins = Vec::with_capacity(input.num_rows());
        let mut ends = Vec::with_capacity(input.num_rows());
        let mut data = Vec::new();
        for i in 0..input.num_rows() {
            begins.push(data.len() as i32);
            for j in input.row(i) {
                data.extend_from_slice(&model.tokenize(input.element(j)));
            }
            ends.push(data.len() as i32);
        }
        Ok(RaggedTensor { begins, ends, data })
    }
}

impl Clone for UnigramTokenizer {
    fn clone(&self) -> Self {
        let state = OnceLock::new();
        if let Some(built) = self.state.get() {
            let _ = state.set(Arc::clone(built));
        }
        Self { opts: self.opts.clone(), state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(vocab: &[(&str, f32)], opts: UnigramOptions) -> UnigramModel {
        let tokens: Vec<&str> = vocab.iter().map(|(t, _)| *t).collect();
        let scores: Vec<f32> = vocab.iter().map(|(_, s)| *s).collect();
        UnigramModel::build(&StringTensor::from_strings(&tokens), &scores, &opts).unwrap()
    }

    #[test]
    fn test_prefers_high_score_segmentation() {
        // "ab" as one token scores better than "a" + "b".
        let m = model(
            &[("<unk>", -10.0), ("a", -1.0), ("b", -1.0), ("ab", -1.5)],
            UnigramOptions::default(),
        );
        assert_eq!(m.tokenize(b"ab"), vec![3]);
    }

    #[test]
    fn test_splits_when_parts_score_better() {
        let m = model(
            &[("<unk>", -10.0), ("a", -0.5), ("b", -0.5), ("ab", -2.0)],
            UnigramOptions::default(),
        );
        assert_eq!(m.tokenize(b"ab"), vec![1, 2]);
    }

    #[test]
    fn test_unknown_char_emits_unk() {
        let m = model(&[("<unk>", -10.0), ("a", -1.0)], UnigramOptions::default());
        assert_eq!(m.tokenize(b"axa"), vec![1, 0, 1]);
    }

    #[test]
    fn test_consecutive_unks_collapse() {
        let m = model(&[("<unk>", -10.0), ("a", -1.0)], UnigramOptions::default());
        assert_eq!(m.tokenize(b"axxya"), vec![1, 0, 1]);
    }

    #[test]
    fn test_no_fuse_keeps_unks() {
        let opts = UnigramOptions { fuse_unk: false, ..UnigramOptions::default() };
        let m = model(&[("<unk>", -10.0), ("a", -1.0)], opts);
        assert_eq!(m.tokenize(b"axx"), vec![1, 0, 0]);
    }

    #[test]
    fn test_multibyte_unknown_consumes_whole_char() {
        let m = model(&[("<unk>", -10.0), ("a", -1.0)], UnigramOptions::default());
        // The kanji spans three bytes but yields a single unk.
        assert_eq!(m.tokenize("a日a".as_bytes()), vec![1, 0, 1]);
    }

    #[test]
    fn test_byte_fallback() {
        let mut vocab: Vec<(String, f32)> =
            vec![("<unk>".to_string(), -10.0), ("a".to_string(), -1.0)];
        for b in 0u16..256 {
            vocab.push((byte_to_piece(b as u8), -12.0));
        }
        let tokens: Vec<&str> = vocab.iter().map(|(t, _)| t.as_str()).collect();
        let scores: Vec<f32> = vocab.iter().map(|(_, s)| *s).collect();
        let opts = UnigramOptions { byte_fallback: true, ..UnigramOptions::default() };
        let m =
            UnigramModel::build(&StringTensor::from_strings(&tokens), &scores, &opts).unwrap();
        // "日" (E6 97 A5) has no piece of its own, so its bytes fall back.
        let ids = m.tokenize("a日".as_bytes());
        assert_eq!(ids.len(), 4);
        assert_eq!(ids[0], 1);
        assert_eq!(ids[1], 2 + 0xE6);
        assert_eq!(ids[2], 2 + 0x97);
        assert_eq!(ids[3], 2 + 0xA5);
    }

    #[test]
    fn test_empty_input() {
        let m = model(&[("<unk>", -10.0)], UnigramOptions::default());
        assert_eq!(m.tokenize(b""), Vec::<i32>::new());
    }

    #[test]
    fn test_scores_length_mismatch() {
        let vocab = StringTensor::from_strings(&["a", "b"]);
        assert!(UnigramModel::build(&vocab, &[-1.0], &UnigramOptions::default()).is_err());
    }

    #[test]
    fn test_evaluate_rows() {
        let vocab = StringTensor::from_strings(&["<unk>", "hello", "world", "hell", "o"]);
        let scores = [-10.0, -1.0, -1.0, -2.0, -2.0];
        let tokenizer = UnigramTokenizer::new(UnigramOptions::default());
        let input = RaggedStringTensor::from_rows(&[vec!["hello", "world"], vec!["hello"]]);
        let out = tokenizer.evaluate(&input, &vocab, &scores).unwrap();
        assert_eq!(out.row(0), &[1, 2]);
        assert_eq!(out.row(1), &[1]);
    }
}
