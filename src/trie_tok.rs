//! Trie-based longest-prefix tokenization with explicit token IDs.

use std::sync::{Arc, OnceLock};

use crate::error::OpError;
use crate::tensor::{RaggedStringTensor, RaggedTensor, StringTensor};
use crate::trie::Trie;

/// Tokenizer that repeatedly longest-matches a vocab trie. The vocabulary
/// carries explicit IDs instead of positional ones. A byte no vocab entry
/// covers emits the -1 sentinel and consumes one byte.
pub struct TrieTokenizer {
    state: OnceLock<Arc<Trie>>,
}

impl Default for TrieTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl TrieTokenizer {
    pub fn new() -> Self {
        Self { state: OnceLock::new() }
    }

    pub fn evaluate(
        &self,
        input: &RaggedStringTensor,
        vocab: &StringTensor,
        indices: &[i32],
    ) -> Result<RaggedTensor<i32>, OpError> {
        input.validate("TrieTokenizer")?;
        if vocab.len() != indices.len() {
            return Err(OpError::Shape(format!(
                "TrieTokenizer: vocab size {} must be equal to indices size {}",
                vocab.len(),
                indices.len()
            )));
        }
        let trie = match self.state.get() {
            Some(trie) => trie,
            None => {
                let mut built = Trie::new();
                for j in 0..vocab.len() {
                    built.add(vocab.element(j), indices[j]);
                }
                self.state.get_or_init(|| Arc::new(built))
            }
        };

        let mut begins = Vec::with_capacity(input.num_rows());
        let mut ends = Vec::with_capacity(input.num_rows());
        let mut data = Vec::new();
        for i in 0..input.num_rows() {
            begins.push(data.len() as i32);
            for j in input.row(i) {
                let element = input.element(j);
                let mut idx = 0;
                while idx < element.len() {
                    let id = trie.find_longest(element, &mut idx);
                    data.push(id);
                    if id < 0 {
                        idx += 1;
                    }
                }
            }
            ends.push(data.len() as i32);
        }
        Ok(RaggedTensor { begins, ends, data })
    }
}

impl Clone for TrieTokenizer {
    fn clone(&self) -> Self {
        let state = OnceLock::new();
        if let Some(built) = self.state.get() {
            let _ = state.set(Arc::clone(built));
        }
        Self { state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_match_with_explicit_ids() {
        let vocab = StringTensor::from_strings(&["a", "ab", "c"]);
        let indices = [10, 20, 30];
        let input = RaggedStringTensor::from_rows(&[vec!["abc", "a"]]);
        let out = TrieTokenizer::new().evaluate(&input, &vocab, &indices).unwrap();
        assert_eq!(out.row(0), &[20, 30, 10]);
    }

    #[test]
    fn test_uncovered_byte_emits_sentinel() {
        let vocab = StringTensor::from_strings(&["a"]);
        let input = RaggedStringTensor::from_rows(&[vec!["axa"]]);
        let out = TrieTokenizer::new().evaluate(&input, &vocab, &[5]).unwrap();
        assert_eq!(out.row(0), &[5, -1, 5]);
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let vocab = StringTensor::from_strings(&["a", "b"]);
        let input = RaggedStringTensor::from_rows(&[vec!["a"]]);
        assert!(TrieTokenizer::new().evaluate(&input, &vocab, &[1]).is_err());
    }
}
