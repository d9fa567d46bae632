//! Pre-tokenization splitters: `SpecialTokensSplit` and `RegexSplit`.
//!
//! Both operate on ragged string tensors and emit spans into the *input*
//! character buffer, so splitting never copies string bytes. Elements
//! already flagged by `skips` pass through untouched.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::error::OpError;
use crate::regex::PcreMatcher;
use crate::tensor::{RaggedStringTensor, StringTensor};

/// Isolates registered special tokens as standalone elements.
///
/// The pattern alternates every special token, each inside its own capture
/// group; the group span distinguishes the token proper from any guard
/// syntax around it. Matched spans come out with `skip = true` so
/// downstream normalizers and tokenizers leave them alone.
pub struct SpecialTokensSplit {
    matcher: PcreMatcher,
}

impl SpecialTokensSplit {
    pub fn new(split_pattern: &str) -> Self {
        Self { matcher: PcreMatcher::new(split_pattern) }
    }

    pub fn evaluate(&self, input: &RaggedStringTensor) -> Result<RaggedStringTensor, OpError> {
        input.validate("SpecialTokensSplit")?;

        let mut ragged_begins = Vec::with_capacity(input.num_rows());
        let mut ragged_ends = Vec::with_capacity(input.num_rows());
        let mut begins = Vec::new();
        let mut ends = Vec::new();
        let mut skips = Vec::new();

        for i in 0..input.num_rows() {
            ragged_begins.push(begins.len() as i32);
            for j in input.row(i) {
                if input.skip(j) {
                    begins.push(input.begins[j]);
                    ends.push(input.ends[j]);
                    skips.push(true);
                    continue;
                }

                let base = input.begins[j] as usize;
                let element = input.element(j);
                let mut cursor = 0usize;
                while let Some(m) = self.matcher.match_with_group(element, cursor) {
                    if cursor < m.start {
                        begins.push((base + cursor) as i32);
                        ends.push((base + m.start) as i32);
                        skips.push(false);
                    }
                    begins.push((base + m.group_start) as i32);
                    ends.push((base + m.group_end) as i32);
                    skips.push(true);
                    cursor = m.end;
                }
                if cursor < element.len() {
                    begins.push((base + cursor) as i32);
                    ends.push((base + element.len()) as i32);
                    skips.push(false);
                }
            }
            ragged_ends.push(begins.len() as i32);
        }

        Ok(RaggedStringTensor {
            ragged_begins,
            ragged_ends,
            begins,
            ends,
            chars: input.chars.clone(),
            skips: Some(skips),
        })
    }
}

/// How [`RegexSplit`] treats matched spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitBehaviour {
    Removed,
    Isolated,
    Contiguous,
    MergedWithPrevious,
    MergedWithNext,
}

impl SplitBehaviour {
    pub fn from_name(name: &str) -> Result<Self, OpError> {
        match name {
            "removed" => Ok(Self::Removed),
            "isolated" => Ok(Self::Isolated),
            "contiguous" => Ok(Self::Contiguous),
            "merged_with_previous" => Ok(Self::MergedWithPrevious),
            "merged_with_next" => Ok(Self::MergedWithNext),
            _ => Err(OpError::Config(format!("RegexSplit: unknown split mode {name:?}"))),
        }
    }
}

/// Regex-driven pre-tokenization over ragged strings.
pub struct RegexSplit {
    matcher: PcreMatcher,
    behaviour: SplitBehaviour,
    invert: bool,
    max_splits: i32,
    skip_tokens: Option<FxHashSet<Vec<u8>>>,
}

impl RegexSplit {
    pub fn new(
        split_pattern: &str,
        behaviour: SplitBehaviour,
        invert: bool,
        max_splits: i32,
    ) -> Result<Self, OpError> {
        if max_splits != -1 && max_splits <= 0 {
            return Err(OpError::Config(format!(
                "RegexSplit: max_splits must be greater than 0 or equal to -1, got {max_splits}"
            )));
        }
        // Contiguous runs of matches behave like one isolated match; wrap
        // the pattern unless it already repeats.
        let (pattern, behaviour) = if behaviour == SplitBehaviour::Contiguous {
            if split_pattern.ends_with('+') {
                (split_pattern.to_string(), SplitBehaviour::Isolated)
            } else {
                (format!("({split_pattern})+"), SplitBehaviour::Isolated)
            }
        } else {
            (split_pattern.to_string(), behaviour)
        };
        Ok(Self {
            matcher: PcreMatcher::new(&pattern),
            behaviour,
            invert,
            max_splits,
            skip_tokens: None,
        })
    }

    /// Registers the legacy skip-token set: elements equal to one of these
    /// strings are passed through unsplit.
    pub fn with_skip_tokens(mut self, skip_tokens: &StringTensor) -> Self {
        self.skip_tokens =
            Some((0..skip_tokens.len()).map(|j| skip_tokens.element(j).to_vec()).collect());
        self
    }

    pub fn evaluate(&self, input: &RaggedStringTensor) -> Result<RaggedStringTensor, OpError> {
        input.validate("RegexSplit")?;

        let mut ragged_begins = Vec::with_capacity(input.num_rows());
        let mut ragged_ends = Vec::with_capacity(input.num_rows());
        let mut begins = Vec::new();
        let mut ends = Vec::new();
        let has_skips = input.skips.is_some();
        let mut skips = Vec::new();

        for i in 0..input.num_rows() {
            ragged_begins.push(begins.len() as i32);
            for j in input.row(i) {
                let element = input.element(j);
                let passthrough = input.skip(j)
                    || self.skip_tokens.as_ref().map_or(false, |set| set.contains(element));
                if passthrough {
                    begins.push(input.begins[j]);
                    ends.push(input.ends[j]);
                    skips.push(input.skip(j));
                    continue;
                }

                let base = input.begins[j] as usize;
                let spans = self.split_spans(element);
                let cap =
                    if self.max_splits >= 0 { self.max_splits as usize } else { usize::MAX };
                for (k, &(b, e)) in spans.iter().enumerate() {
                    // Piece number max_splits is the last one emitted; its
                    // end extends to end-of-string when pieces remain.
                    let capped = k == cap;
                    let e = if capped && k + 1 < spans.len() { element.len() } else { e };
                    begins.push((base + b.min(element.len())) as i32);
                    ends.push((base + e.min(element.len())) as i32);
                    skips.push(false);
                    if capped {
                        break;
                    }
                }
            }
            ragged_ends.push(begins.len() as i32);
        }

        Ok(RaggedStringTensor {
            ragged_begins,
            ragged_ends,
            begins,
            ends,
            chars: input.chars.clone(),
            skips: if has_skips { Some(skips) } else { None },
        })
    }

    /// Splits one element into output spans per the configured behaviour.
    fn split_spans(&self, element: &[u8]) -> Vec<(usize, usize)> {
        // Alternating non-match/match segments over the whole element.
        let mut segments: Vec<(usize, usize, bool)> = Vec::new();
        let mut cursor = 0usize;
        while let Some((s, e)) = self.matcher.find_at(element, cursor) {
            if cursor < s {
                segments.push((cursor, s, self.invert));
            }
            segments.push((s, e, !self.invert));
            cursor = e;
        }
        if cursor < element.len() {
            segments.push((cursor, element.len(), self.invert));
        }

        let mut spans = Vec::with_capacity(segments.len());
        match self.behaviour {
            SplitBehaviour::Removed => {
                for &(s, e, matched) in &segments {
                    if !matched {
                        spans.push((s, e));
                    }
                }
            }
            SplitBehaviour::Isolated | SplitBehaviour::Contiguous => {
                for &(s, e, _) in &segments {
                    spans.push((s, e));
                }
            }
            SplitBehaviour::MergedWithPrevious => {
                let mut start: Option<usize> = None;
                for &(s, e, matched) in &segments {
                    let piece_start = start.take().unwrap_or(s);
                    if matched {
                        spans.push((piece_start, e));
                    } else {
                        start = Some(piece_start);
                    }
                }
                if let Some(s) = start {
                    spans.push((s, element.len()));
                }
            }
            SplitBehaviour::MergedWithNext => {
                let mut start: Option<usize> = None;
                for &(s, _e, matched) in &segments {
                    if matched {
                        if let Some(piece_start) = start.take() {
                            if piece_start < s {
                                spans.push((piece_start, s));
                            }
                        }
                        start = Some(s);
                    } else {
                        start.get_or_insert(s);
                    }
                }
                if let Some(s) = start {
                    if s < element.len() {
                        spans.push((s, element.len()));
                    }
                }
            }
        }
        spans
    }
}
