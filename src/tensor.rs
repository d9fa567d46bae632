//! The ragged string data model.
//!
//! Every operator in this crate speaks one of three tensor conventions:
//!
//! - [`StringTensor`]: a flat batch of strings decomposed into parallel
//!   `begins`/`ends` offset arrays and one concatenated `chars` buffer.
//! - [`RaggedStringTensor`]: one more level of nesting, where
//!   `ragged_begins`/`ragged_ends` slice rows out of the element arrays.
//!   An optional parallel `skips` array marks elements (isolated special
//!   tokens) that downstream stages must pass through unchanged.
//! - [`RaggedTensor<T>`]: the same ragged layout over integer payloads,
//!   produced by the tokenizer operators.
//!
//! All offsets are `i32` indices into the flat buffers, never row-local.
//! The half-open invariants are `begins[j] <= ends[j] <= chars.len()` and
//! `ragged_begins[i] <= ragged_ends[i] <= begins.len()`.

use crate::error::OpError;

/// A batch of strings in decomposed `(begins, ends, chars)` form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringTensor {
    pub begins: Vec<i32>,
    pub ends: Vec<i32>,
    pub chars: Vec<u8>,
}

impl StringTensor {
    /// Builds a tensor from string slices, concatenating their bytes.
    pub fn from_strings<S: AsRef<str>>(strings: &[S]) -> Self {
        Self::from_byte_slices(strings.iter().map(|s| s.as_ref().as_bytes()))
    }

    /// Builds a tensor from byte slices.
    pub fn from_byte_slices<'a, I: IntoIterator<Item = &'a [u8]>>(slices: I) -> Self {
        let mut begins = Vec::new();
        let mut ends = Vec::new();
        let mut chars = Vec::new();
        for slice in slices {
            begins.push(chars.len() as i32);
            chars.extend_from_slice(slice);
            ends.push(chars.len() as i32);
        }
        Self { begins, ends, chars }
    }

    /// Number of string elements.
    pub fn len(&self) -> usize {
        self.begins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.begins.is_empty()
    }

    /// Bytes of the `j`-th element.
    pub fn element(&self, j: usize) -> &[u8] {
        &self.chars[self.begins[j] as usize..self.ends[j] as usize]
    }

    /// Copies all elements out as owned byte vectors.
    pub fn to_byte_vecs(&self) -> Vec<Vec<u8>> {
        (0..self.len()).map(|j| self.element(j).to_vec()).collect()
    }

    /// Lossily decodes all elements to strings.
    pub fn to_strings(&self) -> Vec<String> {
        (0..self.len())
            .map(|j| String::from_utf8_lossy(self.element(j)).into_owned())
            .collect()
    }

    /// Checks the offset invariants.
    pub fn validate(&self, op: &str) -> Result<(), OpError> {
        if self.begins.len() != self.ends.len() {
            return Err(OpError::Shape(format!(
                "{op}: begins/ends length mismatch: {} vs {}",
                self.begins.len(),
                self.ends.len()
            )));
        }
        for j in 0..self.begins.len() {
            let (b, e) = (self.begins[j], self.ends[j]);
            if b < 0 || b > e || e as usize > self.chars.len() {
                return Err(OpError::Shape(format!(
                    "{op}: element {j} has invalid span [{b}, {e}) over {} chars",
                    self.chars.len()
                )));
            }
        }
        Ok(())
    }
}

/// A batch of rows of strings, with an optional `skips` flag per element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaggedStringTensor {
    pub ragged_begins: Vec<i32>,
    pub ragged_ends: Vec<i32>,
    pub begins: Vec<i32>,
    pub ends: Vec<i32>,
    pub chars: Vec<u8>,
    pub skips: Option<Vec<bool>>,
}

impl RaggedStringTensor {
    /// Promotes a flat string tensor to a ragged one with one element per
    /// row. This is how raw input enters a tokenization pipeline.
    pub fn from_string_tensor(tensor: StringTensor) -> Self {
        let n = tensor.len() as i32;
        Self {
            ragged_begins: (0..n).collect(),
            ragged_ends: (1..=n).collect(),
            begins: tensor.begins,
            ends: tensor.ends,
            chars: tensor.chars,
            skips: None,
        }
    }

    /// Builds a ragged tensor from rows of strings.
    pub fn from_rows<S: AsRef<str>>(rows: &[Vec<S>]) -> Self {
        let mut ragged_begins = Vec::with_capacity(rows.len());
        let mut ragged_ends = Vec::with_capacity(rows.len());
        let mut begins = Vec::new();
        let mut ends = Vec::new();
        let mut chars = Vec::new();
        for row in rows {
            ragged_begins.push(begins.len() as i32);
            for s in row {
                begins.push(chars.len() as i32);
                chars.extend_from_slice(s.as_ref().as_bytes());
                ends.push(chars.len() as i32);
            }
            ragged_ends.push(begins.len() as i32);
        }
        Self { ragged_begins, ragged_ends, begins, ends, chars, skips: None }
    }

    /// Number of rows.
    pub fn num_rows(&self) -> usize {
        self.ragged_begins.len()
    }

    /// Number of string elements across all rows.
    pub fn num_elements(&self) -> usize {
        self.begins.len()
    }

    /// Element index range of row `i`.
    pub fn row(&self, i: usize) -> std::ops::Range<usize> {
        self.ragged_begins[i] as usize..self.ragged_ends[i] as usize
    }

    /// Bytes of the `j`-th element.
    pub fn element(&self, j: usize) -> &[u8] {
        &self.chars[self.begins[j] as usize..self.ends[j] as usize]
    }

    /// Whether element `j` is flagged as an isolated special token.
    pub fn skip(&self, j: usize) -> bool {
        self.skips.as_ref().map_or(false, |s| s[j])
    }

    /// Rows decoded to strings, mostly for tests and diagnostics.
    pub fn to_string_rows(&self) -> Vec<Vec<String>> {
        (0..self.num_rows())
            .map(|i| {
                self.row(i)
                    .map(|j| String::from_utf8_lossy(self.element(j)).into_owned())
                    .collect()
            })
            .collect()
    }

    /// Checks the offset invariants on both nesting levels.
    pub fn validate(&self, op: &str) -> Result<(), OpError> {
        if self.ragged_begins.len() != self.ragged_ends.len() {
            return Err(OpError::Shape(format!(
                "{op}: ragged_begins/ragged_ends length mismatch: {} vs {}",
                self.ragged_begins.len(),
                self.ragged_ends.len()
            )));
        }
        for i in 0..self.ragged_begins.len() {
            let (b, e) = (self.ragged_begins[i], self.ragged_ends[i]);
            if b < 0 || b > e || e as usize > self.begins.len() {
                return Err(OpError::Shape(format!(
                    "{op}: row {i} has invalid element span [{b}, {e}) over {} elements",
                    self.begins.len()
                )));
            }
        }
        if let Some(skips) = &self.skips {
            if skips.len() != self.begins.len() {
                return Err(OpError::Shape(format!(
                    "{op}: skips length {} does not match {} elements",
                    skips.len(),
                    self.begins.len()
                )));
            }
        }
        StringTensor {
            begins: self.begins.clone(),
            ends: self.ends.clone(),
            chars: self.chars.clone(),
        }
        .validate(op)
    }
}

/// A ragged tensor over integer (or other POD) payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaggedTensor<T> {
    pub begins: Vec<i32>,
    pub ends: Vec<i32>,
    pub data: Vec<T>,
}

impl<T: Clone> RaggedTensor<T> {
    pub fn from_rows(rows: &[Vec<T>]) -> Self {
        let mut begins = Vec::with_capacity(rows.len());
        let mut ends = Vec::with_capacity(rows.len());
        let mut data = Vec::new();
        for row in rows {
            begins.push(data.len() as i32);
            data.extend_from_slice(row);
            ends.push(data.len() as i32);
        }
        Self { begins, ends, data }
    }

    pub fn num_rows(&self) -> usize {
        self.begins.len()
    }

    /// Values of row `i`.
    pub fn row(&self, i: usize) -> &[T] {
        &self.data[self.begins[i] as usize..self.ends[i] as usize]
    }

    pub fn to_rows(&self) -> Vec<Vec<T>> {
        (0..self.num_rows()).map(|i| self.row(i).to_vec()).collect()
    }
}

/// A dense 2D tensor in row-major order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DenseTensor<T> {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<T>,
}

impl<T: Clone> DenseTensor<T> {
    pub fn new(rows: usize, cols: usize, data: Vec<T>) -> Result<Self, OpError> {
        if data.len() != rows * cols {
            return Err(OpError::Shape(format!(
                "DenseTensor: {rows}x{cols} shape does not match {} values",
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    pub fn row(&self, i: usize) -> &[T] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }
}

/// Serializes a string tensor into the legacy packed layout: an `i32` batch
/// size, `batch_size + 1` cumulative `i32` offsets, then the concatenated
/// bytes. Elements must already be contiguous in `chars`.
pub fn pack_strings(tensor: &StringTensor) -> Vec<u8> {
    let batch_size = tensor.len() as i32;
    let mut packed = Vec::with_capacity(4 * (tensor.len() + 2) + tensor.chars.len());
    packed.extend_from_slice(&batch_size.to_le_bytes());
    let mut offset = 0i32;
    packed.extend_from_slice(&offset.to_le_bytes());
    for j in 0..tensor.len() {
        offset += tensor.ends[j] - tensor.begins[j];
        packed.extend_from_slice(&offset.to_le_bytes());
    }
    for j in 0..tensor.len() {
        packed.extend_from_slice(tensor.element(j));
    }
    packed
}

/// Parses the legacy packed layout back into a string tensor.
pub fn unpack_strings(packed: &[u8]) -> Result<StringTensor, OpError> {
    let read_i32 = |at: usize| -> Result<i32, OpError> {
        packed
            .get(at..at + 4)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or_else(|| {
                OpError::Shape("unpack_strings: packed buffer is truncated".to_string())
            })
    };

    let batch_size = read_i32(0)?;
    if batch_size < 0 {
        return Err(OpError::Shape(format!(
            "unpack_strings: negative batch size {batch_size}"
        )));
    }
    let batch_size = batch_size as usize;
    let header_len = 4 + 4 * (batch_size + 1);
    if packed.len() < header_len {
        return Err(OpError::Shape(
            "unpack_strings: packed buffer does not hold all offsets".to_string(),
        ));
    }

    let mut begins = Vec::with_capacity(batch_size);
    let mut ends = Vec::with_capacity(batch_size);
    for j in 0..batch_size {
        begins.push(read_i32(4 + 4 * j)?);
        ends.push(read_i32(4 + 4 * (j + 1))?);
    }
    let chars = packed[header_len..].to_vec();

    let tensor = StringTensor { begins, ends, chars };
    tensor.validate("unpack_strings")?;
    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_tensor_roundtrip() {
        let tensor = StringTensor::from_strings(&["hello", "", "world"]);
        assert_eq!(tensor.len(), 3);
        assert_eq!(tensor.element(0), b"hello");
        assert_eq!(tensor.element(1), b"");
        assert_eq!(tensor.element(2), b"world");
        tensor.validate("test").unwrap();
    }

    #[test]
    fn test_ragged_promotion() {
        let tensor = StringTensor::from_strings(&["a", "bc"]);
        let ragged = RaggedStringTensor::from_string_tensor(tensor);
        assert_eq!(ragged.num_rows(), 2);
        assert_eq!(ragged.row(0), 0..1);
        assert_eq!(ragged.row(1), 1..2);
        assert_eq!(ragged.element(1), b"bc");
        ragged.validate("test").unwrap();
    }

    #[test]
    fn test_ragged_from_rows() {
        let ragged = RaggedStringTensor::from_rows(&[vec!["a", "b"], vec![], vec!["c"]]);
        assert_eq!(ragged.to_string_rows(), vec![
            vec!["a".to_string(), "b".to_string()],
            vec![],
            vec!["c".to_string()],
        ]);
    }

    #[test]
    fn test_validate_rejects_bad_offsets() {
        let tensor = StringTensor { begins: vec![0], ends: vec![5], chars: vec![b'a'] };
        assert!(tensor.validate("test").is_err());
    }

    #[test]
    fn test_packed_roundtrip() {
        let tensor = StringTensor::from_strings(&["first", "", "second"]);
        let packed = pack_strings(&tensor);
        let unpacked = unpack_strings(&packed).unwrap();
        assert_eq!(unpacked.to_strings(), vec!["first", "", "second"]);
    }

    #[test]
    fn test_unpack_rejects_truncated() {
        assert!(unpack_strings(&[1, 0]).is_err());
        // Batch size of 2 but only one offset present.
        let mut packed = Vec::new();
        packed.extend_from_slice(&2i32.to_le_bytes());
        packed.extend_from_slice(&0i32.to_le_bytes());
        assert!(unpack_strings(&packed).is_err());
    }

    #[test]
    fn test_ragged_tensor_rows() {
        let t = RaggedTensor::from_rows(&[vec![1, 2], vec![3]]);
        assert_eq!(t.row(0), &[1, 2]);
        assert_eq!(t.row(1), &[3]);
    }
}
