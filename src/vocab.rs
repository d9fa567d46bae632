//! Vocabulary lookup operators and elementwise string comparison.

use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

use crate::error::OpError;
use crate::tensor::{DenseTensor, RaggedStringTensor, StringTensor};

/// Maps each input string to its vocabulary ID, emitting a default value
/// for misses. The hash table is built lazily from the key/value inputs on
/// the first `evaluate` call.
pub struct VocabEncoder {
    state: OnceLock<Arc<FxHashMap<Vec<u8>, i32>>>,
}

impl Default for VocabEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VocabEncoder {
    pub fn new() -> Self {
        Self { state: OnceLock::new() }
    }

    pub fn evaluate(
        &self,
        input: &StringTensor,
        vocab_keys: &StringTensor,
        vocab_values: &[i32],
        default_value: i32,
    ) -> Result<Vec<i32>, OpError> {
        input.validate("VocabEncoder")?;
        if vocab_keys.len() != vocab_values.len() {
            return Err(OpError::Shape(format!(
                "VocabEncoder: expected equal number of vocab keys and values, got {} and {}",
                vocab_keys.len(),
                vocab_values.len()
            )));
        }
        let vocab = match self.state.get() {
            Some(vocab) => vocab,
            None => {
                let built: FxHashMap<Vec<u8>, i32> = (0..vocab_keys.len())
                    .map(|j| (vocab_keys.element(j).to_vec(), vocab_values[j]))
                    .collect();
                self.state.get_or_init(|| Arc::new(built))
            }
        };

        Ok((0..input.len())
            .into_par_iter()
            .map(|j| vocab.get(input.element(j)).copied().unwrap_or(default_value))
            .collect())
    }
}

impl Clone for VocabEncoder {
    fn clone(&self) -> Self {
        let state = OnceLock::new();
        if let Some(built) = self.state.get() {
            let _ = state.set(Arc::clone(built));
        }
        Self { state }
    }
}

/// Maps token IDs back to their vocabulary strings as a ragged string
/// tensor, one row per batch entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VocabDecoder {
    /// IDs to drop from the output; overridden by the runtime input when
    /// one is supplied.
    pub skip_tokens: Vec<i32>,
}

impl VocabDecoder {
    pub fn new(skip_tokens: Vec<i32>) -> Self {
        Self { skip_tokens }
    }

    pub fn evaluate(
        &self,
        ids: &DenseTensor<i32>,
        vocab: &StringTensor,
        runtime_skip_tokens: Option<&[i32]>,
    ) -> Result<RaggedStringTensor, OpError> {
        vocab.validate("VocabDecoder")?;
        let skip_tokens = runtime_skip_tokens.unwrap_or(&self.skip_tokens);
        let vocab_size = vocab.len() as i32;

        let mut ragged_begins = Vec::with_capacity(ids.rows);
        let mut ragged_ends = Vec::with_capacity(ids.rows);
        let mut begins = Vec::new();
        let mut ends = Vec::new();
        let mut chars = Vec::new();
        for row in 0..ids.rows {
            ragged_begins.push(begins.len() as i32);
            for &token_id in ids.row(row) {
                begins.push(chars.len() as i32);
                if (0..vocab_size).contains(&token_id) && !skip_tokens.contains(&token_id) {
                    chars.extend_from_slice(vocab.element(token_id as usize));
                }
                ends.push(chars.len() as i32);
            }
            ragged_ends.push(begins.len() as i32);
        }
        Ok(RaggedStringTensor { ragged_begins, ragged_ends, begins, ends, chars, skips: None })
    }
}

/// Elementwise equality of two string tensors with broadcasting over
/// size-1 axes. The output is i32 {0, 1} rather than boolean for
/// downstream graph compatibility; an empty side yields an empty output.
pub struct EqualStr;

impl EqualStr {
    pub fn evaluate(&self, left: &StringTensor, right: &StringTensor) -> Result<Vec<i32>, OpError> {
        left.validate("EqualStr")?;
        right.validate("EqualStr")?;

        let num_elems = if left.is_empty() || right.is_empty() {
            0
        } else {
            left.len().max(right.len())
        };

        Ok((0..num_elems)
            .into_par_iter()
            .map(|idx| {
                let l = left.element(if idx < left.len() { idx } else { 0 });
                let r = right.element(if idx < right.len() { idx } else { 0 });
                (l == r) as i32
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_hits_and_default() {
        let keys = StringTensor::from_strings(&["cat", "dog"]);
        let input = StringTensor::from_strings(&["dog", "bird", "cat"]);
        let encoder = VocabEncoder::new();
        let ids = encoder.evaluate(&input, &keys, &[1, 2], -7).unwrap();
        assert_eq!(ids, vec![2, -7, 1]);
    }

    #[test]
    fn test_encoder_key_value_mismatch() {
        let keys = StringTensor::from_strings(&["cat"]);
        let input = StringTensor::from_strings(&["cat"]);
        assert!(VocabEncoder::new().evaluate(&input, &keys, &[1, 2], 0).is_err());
    }

    #[test]
    fn test_decoder_basic() {
        let vocab = StringTensor::from_strings(&["a", "b", "c"]);
        let ids = DenseTensor::new(2, 2, vec![0, 2, 1, 1]).unwrap();
        let out = VocabDecoder::default().evaluate(&ids, &vocab, None).unwrap();
        assert_eq!(out.to_string_rows(), vec![
            vec!["a".to_string(), "c".to_string()],
            vec!["b".to_string(), "b".to_string()],
        ]);
    }

    #[test]
    fn test_decoder_skips_and_out_of_range() {
        let vocab = StringTensor::from_strings(&["a", "b"]);
        let ids = DenseTensor::new(1, 3, vec![0, 1, 9]).unwrap();
        let decoder = VocabDecoder::new(vec![1]);
        let out = decoder.evaluate(&ids, &vocab, None).unwrap();
        // Skipped and out-of-range IDs become empty elements.
        assert_eq!(out.to_string_rows(), vec![vec![
            "a".to_string(),
            String::new(),
            String::new(),
        ]]);
    }

    #[test]
    fn test_decoder_runtime_override() {
        let vocab = StringTensor::from_strings(&["a", "b"]);
        let ids = DenseTensor::new(1, 2, vec![0, 1]).unwrap();
        let decoder = VocabDecoder::new(vec![0]);
        let out = decoder.evaluate(&ids, &vocab, Some(&[1])).unwrap();
        assert_eq!(out.to_string_rows(), vec![vec!["a".to_string(), String::new()]]);
    }

    #[test]
    fn test_equal_str_broadcast() {
        let left = StringTensor::from_strings(&["x"]);
        let right = StringTensor::from_strings(&["x", "y", "x"]);
        assert_eq!(EqualStr.evaluate(&left, &right).unwrap(), vec![1, 0, 1]);
    }

    #[test]
    fn test_equal_str_empty_side() {
        let left = StringTensor::from_strings::<&str>(&[]);
        let right = StringTensor::from_strings(&["x"]);
        assert_eq!(EqualStr.evaluate(&left, &right).unwrap(), Vec::<i32>::new());
    }

    #[test]
    fn test_equal_str_empty_strings_equal() {
        let left = StringTensor::from_strings(&["", "a"]);
        let right = StringTensor::from_strings(&["", "b"]);
        assert_eq!(EqualStr.evaluate(&left, &right).unwrap(), vec![1, 0]);
    }
}
