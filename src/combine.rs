//! Post-tokenization assembly: segment combination and truncation.

use serde::{Deserialize, Serialize};

use crate::error::OpError;
use crate::tensor::RaggedTensor;

/// One entry of a [`CombineSegments`] template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemplateEntry {
    /// Emit this token ID once per row.
    Literal(i32),
    /// Splice in the row of this segment group.
    Segment(usize),
}

impl TemplateEntry {
    /// Decodes the tensor form: non-negative entries are literal IDs,
    /// `-(g + 1)` selects segment group `g`.
    pub fn from_encoded(value: i32) -> Self {
        if value >= 0 {
            Self::Literal(value)
        } else {
            Self::Segment((-value - 1) as usize)
        }
    }
}

/// Interleaves tokenized segments with literal IDs according to a
/// template, e.g. `[CLS] A [SEP] B [SEP]`.
pub struct CombineSegments;

impl CombineSegments {
    pub fn evaluate(
        &self,
        segments: &[&RaggedTensor<i32>],
        template: &[i32],
    ) -> Result<RaggedTensor<i32>, OpError> {
        let entries: Vec<TemplateEntry> =
            template.iter().map(|&v| TemplateEntry::from_encoded(v)).collect();

        let num_rows = segments.first().map_or(0, |s| s.num_rows());
        for (g, segment) in segments.iter().enumerate() {
            if segment.num_rows() != num_rows {
                return Err(OpError::Shape(format!(
                    "CombineSegments: segment group {g} has {} rows, expected {num_rows}",
                    segment.num_rows()
                )));
            }
        }
        for entry in &entries {
            if let TemplateEntry::Segment(g) = entry {
                if *g >= segments.len() {
                    return Err(OpError::Config(format!(
                        "CombineSegments: template refers to segment group {g} but only {} groups were passed",
                        segments.len()
                    )));
                }
            }
        }

        let mut begins = Vec::with_capacity(num_rows);
        let mut ends = Vec::with_capacity(num_rows);
        let mut data = Vec::new();
        for row in 0..num_rows {
            begins.push(data.len() as i32);
            for entry in &entries {
                match entry {
                    TemplateEntry::Literal(id) => data.push(*id),
                    TemplateEntry::Segment(g) => data.extend_from_slice(segments[*g].row(row)),
                }
            }
            ends.push(data.len() as i32);
        }
        Ok(RaggedTensor { begins, ends, data })
    }
}

/// Which end of a row truncation crops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TruncationSide {
    Left,
    Right,
}

impl TruncationSide {
    pub fn from_name(name: &str) -> Result<Self, OpError> {
        match name {
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            _ => Err(OpError::Config(format!("Truncate: unknown truncation side {name:?}"))),
        }
    }
}

/// How a two-input truncation shares the length budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TruncationMode {
    OnlyFirst,
    OnlySecond,
    LongestFirst,
}

impl TruncationMode {
    pub fn from_name(name: &str) -> Result<Self, OpError> {
        match name {
            "only_first" => Ok(Self::OnlyFirst),
            "only_second" => Ok(Self::OnlySecond),
            "longest_first" => Ok(Self::LongestFirst),
            _ => Err(OpError::Config(format!("Truncate: unknown truncation mode {name:?}"))),
        }
    }
}

/// Crops ragged rows to a maximum length. Only the offsets move; the value
/// buffer is untouched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Truncate {
    pub side: TruncationSide,
    pub mode: TruncationMode,
}

impl Truncate {
    pub fn new(side: TruncationSide, mode: TruncationMode) -> Self {
        Self { side, mode }
    }

    /// Single-input contract: every row is cropped to `max_length`.
    pub fn evaluate_single(
        &self,
        begins: &[i32],
        ends: &[i32],
        max_length: i32,
    ) -> Result<(Vec<i32>, Vec<i32>), OpError> {
        check_rows("Truncate", begins, ends)?;
        let mut new_begins = begins.to_vec();
        let mut new_ends = ends.to_vec();
        for i in 0..begins.len() {
            let length = (ends[i] - begins[i]).min(max_length);
            self.crop(&mut new_begins[i], &mut new_ends[i], length);
        }
        Ok((new_begins, new_ends))
    }

    /// Two-input contract: per row, the pair is cropped so the lengths sum
    /// to at most `max_length`, per the configured mode.
    #[allow(clippy::type_complexity)]
    pub fn evaluate_pair(
        &self,
        first: (&[i32], &[i32]),
        second: (&[i32], &[i32]),
        max_length: i32,
    ) -> Result<((Vec<i32>, Vec<i32>), (Vec<i32>, Vec<i32>)), OpError> {
        check_rows("Truncate", first.0, first.1)?;
        check_rows("Truncate", second.0, second.1)?;
        if first.0.len() != second.0.len() {
            return Err(OpError::Shape(format!(
                "Truncate: first input has {} rows but second has {}",
                first.0.len(),
                second.0.len()
            )));
        }

        let mut first_begins = first.0.to_vec();
        let mut first_ends = first.1.to_vec();
        let mut second_begins = second.0.to_vec();
        let mut second_ends = second.1.to_vec();

        for i in 0..first_begins.len() {
            let first_len = first_ends[i] - first_begins[i];
            let second_len = second_ends[i] - second_begins[i];
            if first_len + second_len <= max_length {
                continue;
            }
            let (first_target, second_target) = match self.mode {
                TruncationMode::OnlyFirst => (first_len.min(max_length), second_len),
                TruncationMode::OnlySecond => (first_len, second_len.min(max_length)),
                TruncationMode::LongestFirst => {
                    split_budget(first_len, second_len, max_length)
                }
            };
            self.crop(&mut first_begins[i], &mut first_ends[i], first_target);
            self.crop(&mut second_begins[i], &mut second_ends[i], second_target);
        }
        Ok(((first_begins, first_ends), (second_begins, second_ends)))
    }

    fn crop(&self, begin: &mut i32, end: &mut i32, length: i32) {
        match self.side {
            TruncationSide::Right => *end = *begin + length,
            TruncationSide::Left => *begin = *end - length,
        }
    }
}

/// Shares `max_length` between two over-budget rows: the longer side
/// donates slack to the shorter until both fit; when both exceed half the
/// budget the split is even, with an odd budget's leftover going to
/// whichever side was longer before truncation.
fn split_budget(first_len: i32, second_len: i32, max_length: i32) -> (i32, i32) {
    let half = max_length / 2;
    if first_len <= half {
        (first_len, max_length - first_len)
    } else if second_len <= half {
        (max_length - second_len, second_len)
    } else {
        let leftover = max_length - 2 * half;
        if first_len >= second_len {
            (half + leftover, half)
        } else {
            (half, half + leftover)
        }
    }
}

fn check_rows(op: &str, begins: &[i32], ends: &[i32]) -> Result<(), OpError> {
    if begins.len() != ends.len() {
        return Err(OpError::Shape(format!(
            "{op}: begins/ends length mismatch: {} vs {}",
            begins.len(),
            ends.len()
        )));
    }
    Ok(())
}
