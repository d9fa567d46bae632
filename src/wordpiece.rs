//! WordPiece tokenization: longest match with a continuation prefix.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

use crate::error::OpError;
use crate::tensor::{RaggedStringTensor, RaggedTensor, StringTensor};
use crate::trie::Trie;

/// Static attributes of [`WordpieceTokenizer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordpieceOptions {
    pub suffix_indicator: String,
    pub max_bytes_per_word: usize,
}

impl Default for WordpieceOptions {
    fn default() -> Self {
        Self { suffix_indicator: "##".to_string(), max_bytes_per_word: 100 }
    }
}

struct WordpieceState {
    /// Vocab entries that do not start with the suffix indicator.
    trie_root: Trie,
    /// Continuation entries, keyed with the indicator stripped.
    trie_subwords: Trie,
    unk_token_id: i32,
}

/// WordPiece tokenizer over pre-tokenized ragged strings.
///
/// Each element either becomes a `[head, ##cont, ##cont, ...]` chain that
/// reassembles to the input byte-exactly, or exactly `[unk_token_id]`.
pub struct WordpieceTokenizer {
    opts: WordpieceOptions,
    state: OnceLock<Arc<WordpieceState>>,
}

impl WordpieceTokenizer {
    pub fn new(opts: WordpieceOptions) -> Self {
        Self { opts, state: OnceLock::new() }
    }

    pub fn evaluate(
        &self,
        input: &RaggedStringTensor,
        vocab: &StringTensor,
        unk_token_id: i32,
    ) -> Result<RaggedTensor<i32>, OpError> {
        input.validate("WordpieceTokenizer")?;
        let state = match self.state.get() {
            Some(state) => state,
            None => {
                let built = Arc::new(self.build_state(vocab, unk_token_id));
                self.state.get_or_init(|| built)
            }
        };

        let mut begins = Vec::with_capacity(input.num_rows());
        let mut ends = Vec::with_capacity(input.num_rows());
        let mut data = Vec::new();
        for i in 0..input.num_rows() {
            begins.push(data.len() as i32);
            for j in input.row(i) {
                tokenize_word(state, &self.opts, input.element(j), &mut data);
            }
            ends.push(data.len() as i32);
        }
        Ok(RaggedTensor { begins, ends, data })
    }

    fn build_state(&self, vocab: &StringTensor, unk_token_id: i32) -> WordpieceState {
        // A negative unk id counts back from the end of the vocab.
        let unk_token_id =
            if unk_token_id < 0 { unk_token_id + vocab.len() as i32 } else { unk_token_id };

        let indicator = self.opts.suffix_indicator.as_bytes();
        let mut trie_root = Trie::new();
        let mut trie_subwords = Trie::new();
        for id in 0..vocab.len() {
            let token = vocab.element(id);
            if token.starts_with(indicator) && token.len() > indicator.len() {
                trie_subwords.add(&token[indicator.len()..], id as i32);
            } else {
                trie_root.add(token, id as i32);
            }
        }
        WordpieceState { trie_root, trie_subwords, unk_token_id }
    }
}

impl Clone for WordpieceTokenizer {
    fn clone(&self) -> Self {
        let state = OnceLock::new();
        if let Some(built) = self.state.get() {
            let _ = state.set(Arc::clone(built));
        }
        Self { opts: self.opts.clone(), state }
    }
}

fn tokenize_word(
    state: &WordpieceState,
    opts: &WordpieceOptions,
    word: &[u8],
    out: &mut Vec<i32>,
) {
    if word.len() > opts.max_bytes_per_word {
        out.push(state.unk_token_id);
        return;
    }

    let checkpoint = out.len();
    let mut idx = 0;
    let head = state.trie_root.find_longest(word, &mut idx);
    if head < 0 {
        out.push(state.unk_token_id);
        return;
    }
    out.push(head);

    while idx < word.len() {
        let before = idx;
        let id = state.trie_subwords.find_longest(word, &mut idx);
        if id < 0 || idx == before {
            // Any failure reverts the whole word to a single unk.
            out.truncate(checkpoint);
            out.push(state.unk_token_id);
            return;
        }
        out.push(id);
    }
}
