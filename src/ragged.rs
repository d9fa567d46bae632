//! Shape-bridging operators between ragged and dense representations.

use serde::{Deserialize, Serialize};

use crate::error::OpError;
use crate::tensor::{DenseTensor, RaggedTensor};

/// Pads or truncates each ragged row to a target dimension, producing a
/// dense tensor and a boolean attention mask of the same shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaggedToDense {
    /// Pad on the right (default) or on the left.
    pub pad_right: bool,
    /// When set, rows always pad out to the target dimension; otherwise a
    /// row shorter than the target keeps its own length of data and the
    /// rest is default-filled.
    pub pad_max_length: bool,
}

impl Default for RaggedToDense {
    fn default() -> Self {
        Self { pad_right: true, pad_max_length: false }
    }
}

impl RaggedToDense {
    pub fn evaluate<T: Copy>(
        &self,
        input: &RaggedTensor<T>,
        target_dim: usize,
        default_value: T,
        pad_right_override: Option<bool>,
    ) -> Result<(DenseTensor<T>, DenseTensor<bool>), OpError> {
        let pad_right = pad_right_override.unwrap_or(self.pad_right);
        let rows = input.num_rows();
        let mut data = Vec::with_capacity(rows * target_dim);
        let mut mask = Vec::with_capacity(rows * target_dim);

        for i in 0..rows {
            let row = input.row(i);
            let data_len = row.len().min(target_dim);
            // With pad_max_length the whole target width counts as data in
            // the mask; otherwise only the row's own values do.
            let mask_len = if self.pad_max_length { target_dim } else { data_len };
            let pad_len = target_dim - data_len;
            if pad_right {
                data.extend_from_slice(&row[..data_len]);
                data.extend(std::iter::repeat(default_value).take(pad_len));
                mask.extend(std::iter::repeat(true).take(mask_len));
                mask.extend(std::iter::repeat(false).take(target_dim - mask_len));
            } else {
                data.extend(std::iter::repeat(default_value).take(pad_len));
                data.extend_from_slice(&row[..data_len]);
                mask.extend(std::iter::repeat(false).take(target_dim - mask_len));
                mask.extend(std::iter::repeat(true).take(mask_len));
            }
        }
        Ok((
            DenseTensor::new(rows, target_dim, data)?,
            DenseTensor::new(rows, target_dim, mask)?,
        ))
    }
}

/// Emits a `(total_values, 2)` tensor of `(row, col)` indices for every
/// ragged value.
pub struct RaggedToSparse;

impl RaggedToSparse {
    pub fn evaluate(&self, begins: &[i32], ends: &[i32]) -> Result<DenseTensor<i32>, OpError> {
        if begins.len() != ends.len() {
            return Err(OpError::Shape(format!(
                "RaggedToSparse: begins/ends length mismatch: {} vs {}",
                begins.len(),
                ends.len()
            )));
        }
        let mut indices = Vec::new();
        for (row, (&b, &e)) in begins.iter().zip(ends).enumerate() {
            if b > e {
                return Err(OpError::Shape(format!(
                    "RaggedToSparse: row {row} has begin {b} after end {e}"
                )));
            }
            for col in 0..(e - b) {
                indices.push(row as i32);
                indices.push(col);
            }
        }
        let rows = indices.len() / 2;
        DenseTensor::new(rows, 2, indices)
    }
}

/// Converts the row-IDs ragged representation to `(begins, ends)`.
///
/// Rows with no entries get empty spans anchored at the first value index
/// of the next populated row, or at the end of the values for trailing
/// empties.
pub struct RaggedToRagged;

impl RaggedToRagged {
    pub fn evaluate(
        &self,
        rowids: &[i32],
        first_dim_size: i32,
    ) -> Result<(Vec<i32>, Vec<i32>), OpError> {
        let batch_size = first_dim_size.max(0) as usize;
        let mut begins = vec![0i32; batch_size];
        let mut ends = vec![0i32; batch_size];

        let mut prev_row_id_idx = 0i32;
        let mut prev_row_id = -1i32;
        for (rowids_idx, &curr_row_id) in rowids.iter().enumerate() {
            let rowids_idx = rowids_idx as i32;
            if curr_row_id < 0 {
                return Err(OpError::Data(format!(
                    "RaggedToRagged: row id must be non-negative, got {curr_row_id}"
                )));
            }
            if curr_row_id as usize >= batch_size {
                break;
            }

            if prev_row_id != curr_row_id {
                if prev_row_id != -1 {
                    begins[prev_row_id as usize] = prev_row_id_idx;
                    ends[prev_row_id as usize] = rowids_idx;
                }
                // Rows skipped over are empty, anchored here.
                for idx in (prev_row_id + 1)..curr_row_id {
                    begins[idx as usize] = rowids_idx;
                    ends[idx as usize] = rowids_idx;
                }
                prev_row_id_idx = rowids_idx;
                prev_row_id = curr_row_id;
            }

            if rowids_idx + 1 == rowids.len() as i32 {
                begins[curr_row_id as usize] = prev_row_id_idx;
                ends[curr_row_id as usize] = rowids.len() as i32;
                prev_row_id = curr_row_id;
                prev_row_id_idx = rowids.len() as i32;
            }
        }

        let first_trailing = if prev_row_id < 0 { 0 } else { prev_row_id + 1 };
        for idx in first_trailing..batch_size as i32 {
            begins[idx as usize] = prev_row_id_idx;
            ends[idx as usize] = prev_row_id_idx;
        }

        Ok((begins, ends))
    }
}

/// Flattens one level of raggedness: the new element `i` spans from the
/// first inner element's begin to the last inner element's end.
pub struct FuzeRagged;

impl FuzeRagged {
    pub fn evaluate(
        &self,
        ragged_begins: &[i32],
        ragged_ends: &[i32],
        begins: &[i32],
        ends: &[i32],
    ) -> Result<(Vec<i32>, Vec<i32>), OpError> {
        if ragged_begins.len() != ragged_ends.len() {
            return Err(OpError::Shape(format!(
                "FuzeRagged: ragged_begins/ragged_ends length mismatch: {} vs {}",
                ragged_begins.len(),
                ragged_ends.len()
            )));
        }
        let mut new_begins = Vec::with_capacity(ragged_begins.len());
        let mut new_ends = Vec::with_capacity(ragged_begins.len());
        for i in 0..ragged_begins.len() {
            let (rb, re) = (ragged_begins[i] as usize, ragged_ends[i] as usize);
            if re > rb {
                new_begins.push(begins[rb]);
                new_ends.push(ends[re - 1]);
            } else {
                // An empty row collapses to an empty span.
                let anchor = begins.get(rb).copied().unwrap_or(0);
                new_begins.push(anchor);
                new_ends.push(anchor);
            }
        }
        Ok((new_begins, new_ends))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ragged_to_dense_right_padding() {
        let input = RaggedTensor { begins: vec![0, 2], ends: vec![2, 5], data: vec![1, 2, 3, 4, 5] };
        let (dense, mask) =
            RaggedToDense::default().evaluate(&input, 4, 0, None).unwrap();
        assert_eq!(dense.data, vec![1, 2, 0, 0, 3, 4, 5, 0]);
        assert_eq!(
            mask.data,
            vec![true, true, false, false, true, true, true, false]
        );
        assert_eq!((dense.rows, dense.cols), (2, 4));
    }

    #[test]
    fn test_ragged_to_dense_left_padding() {
        let input = RaggedTensor::from_rows(&[vec![7, 8]]);
        let op = RaggedToDense { pad_right: false, pad_max_length: false };
        let (dense, mask) = op.evaluate(&input, 4, 0, None).unwrap();
        assert_eq!(dense.data, vec![0, 0, 7, 8]);
        assert_eq!(mask.data, vec![false, false, true, true]);
    }

    #[test]
    fn test_ragged_to_dense_truncates() {
        let input = RaggedTensor::from_rows(&[vec![1, 2, 3, 4, 5]]);
        let (dense, mask) = RaggedToDense::default().evaluate(&input, 3, 0, None).unwrap();
        assert_eq!(dense.data, vec![1, 2, 3]);
        assert_eq!(mask.data, vec![true, true, true]);
    }

    #[test]
    fn test_ragged_to_dense_pad_max_length_masks_padding() {
        let input = RaggedTensor::from_rows(&[vec![1, 2]]);
        let op = RaggedToDense { pad_right: true, pad_max_length: true };
        let (dense, mask) = op.evaluate(&input, 4, 0, None).unwrap();
        assert_eq!(dense.data, vec![1, 2, 0, 0]);
        assert_eq!(mask.data, vec![true, true, true, true]);
    }

    #[test]
    fn test_ragged_to_dense_runtime_override() {
        let input = RaggedTensor::from_rows(&[vec![9]]);
        let (dense, _) = RaggedToDense::default().evaluate(&input, 2, 0, Some(false)).unwrap();
        assert_eq!(dense.data, vec![0, 9]);
    }

    #[test]
    fn test_ragged_to_sparse() {
        let sparse = RaggedToSparse.evaluate(&[0, 3], &[3, 4]).unwrap();
        assert_eq!((sparse.rows, sparse.cols), (4, 2));
        assert_eq!(sparse.data, vec![0, 0, 0, 1, 0, 2, 1, 0]);
    }

    #[test]
    fn test_ragged_to_sparse_empty_rows() {
        let sparse = RaggedToSparse.evaluate(&[0, 2, 2], &[2, 2, 3]).unwrap();
        assert_eq!(sparse.data, vec![0, 0, 0, 1, 2, 0]);
    }

    #[test]
    fn test_ragged_to_ragged_basic() {
        let (begins, ends) = RaggedToRagged.evaluate(&[0, 0, 1, 2, 2], 3).unwrap();
        assert_eq!(begins, vec![0, 2, 3]);
        assert_eq!(ends, vec![2, 3, 5]);
    }

    #[test]
    fn test_ragged_to_ragged_empty_middle_row() {
        let (begins, ends) = RaggedToRagged.evaluate(&[0, 2], 3).unwrap();
        assert_eq!(begins, vec![0, 1, 1]);
        assert_eq!(ends, vec![1, 1, 2]);
    }

    #[test]
    fn test_ragged_to_ragged_trailing_empties() {
        let (begins, ends) = RaggedToRagged.evaluate(&[0], 3).unwrap();
        assert_eq!(begins, vec![0, 1, 1]);
        assert_eq!(ends, vec![1, 1, 1]);
    }

    #[test]
    fn test_ragged_to_ragged_all_empty() {
        let (begins, ends) = RaggedToRagged.evaluate(&[], 2).unwrap();
        assert_eq!(begins, vec![0, 0]);
        assert_eq!(ends, vec![0, 0]);
    }

    #[test]
    fn test_fuze_ragged() {
        // Two rows over four inner elements.
        let (begins, ends) =
            FuzeRagged.evaluate(&[0, 2], &[2, 4], &[0, 5, 10, 15], &[5, 10, 15, 20]).unwrap();
        assert_eq!(begins, vec![0, 10]);
        assert_eq!(ends, vec![10, 20]);
    }

    #[test]
    fn test_fuze_ragged_empty_row() {
        let (begins, ends) = FuzeRagged.evaluate(&[0, 1], &[1, 1], &[3], &[7]).unwrap();
        assert_eq!(begins, vec![3, 0]);
        assert_eq!(ends, vec![7, 0]);
    }
}
