//! SentencePiece-compatible charsmap normalization.
//!
//! The operator either consumes a precompiled charsmap blob (a double-array
//! trie over source sequences plus a replacement-string pool, the format
//! the SentencePiece normalizer ships) or falls back to a named Unicode
//! form. On top of the character mapping it applies the SentencePiece
//! whitespace treatment: optional run collapsing, the dummy prefix, and
//! whitespace escaping to `▁` (U+2581).

use serde::{Deserialize, Serialize};

use crate::error::OpError;
use crate::normalize::{normalize_elements, UnicodeForm};
use crate::tensor::StringTensor;

/// The whitespace marker SentencePiece models use in place of a space.
pub const WHITESPACE_PIECE: &str = "\u{2581}";

/// Attributes shared by the charsmap constructors.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CharsMapAttrs {
    pub add_dummy_prefix: bool,
    pub remove_extra_whitespaces: bool,
    pub escape_whitespaces: bool,
    pub case_fold: bool,
}

/// A parsed precompiled charsmap: a double-array trie whose values index
/// into a pool of NUL-terminated replacement strings.
pub struct PrecompiledCharsMap {
    units: Vec<u32>,
    normalized: Vec<u8>,
}

impl PrecompiledCharsMap {
    /// Parses the `[u32 trie_size][trie units][replacement pool]` blob.
    pub fn parse(blob: &[u8]) -> Result<Self, OpError> {
        if blob.len() < 4 {
            return Err(OpError::Shape(
                "CharsMapNormalization: precompiled charsmap is truncated".to_string(),
            ));
        }
        let trie_size = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]) as usize;
        if trie_size % 4 != 0 || blob.len() < 4 + trie_size {
            return Err(OpError::Shape(format!(
                "CharsMapNormalization: charsmap declares a {trie_size}-byte trie but only {} bytes follow",
                blob.len() - 4
            )));
        }
        let units = blob[4..4 + trie_size]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let normalized = blob[4 + trie_size..].to_vec();
        Ok(Self { units, normalized })
    }

    /// Longest-prefix lookup at the start of `key`, returning the matched
    /// length and the replacement bytes.
    fn longest_match<'a>(&'a self, key: &[u8]) -> Option<(usize, &'a [u8])> {
        let mut best: Option<(usize, u32)> = None;
        let mut node_pos = 0usize;
        let mut unit = *self.units.first()?;
        node_pos ^= unit_offset(unit);
        for (i, &byte) in key.iter().enumerate() {
            node_pos ^= byte as usize;
            unit = *self.units.get(node_pos)?;
            if unit_label(unit) != byte as u32 {
                break;
            }
            node_pos ^= unit_offset(unit);
            if unit_has_leaf(unit) {
                let leaf = *self.units.get(node_pos)?;
                best = Some((i + 1, unit_value(leaf)));
            }
        }
        let (len, value) = best?;
        let start = value as usize;
        let tail = self.normalized.get(start..)?;
        let end = start + tail.iter().position(|&b| b == 0)?;
        Some((len, &self.normalized[start..end]))
    }

    /// Rewrites `input` by repeated longest-match replacement; bytes not
    /// covered by the map are copied one character at a time.
    pub fn transform(&self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len());
        let mut pos = 0;
        while pos < input.len() {
            match self.longest_match(&input[pos..]) {
                Some((len, replacement)) => {
                    out.extend_from_slice(replacement);
                    pos += len;
                }
                None => {
                    let char_len = utf8_char_len(input[pos]).min(input.len() - pos);
                    out.extend_from_slice(&input[pos..pos + char_len]);
                    pos += char_len;
                }
            }
        }
        out
    }
}

// Double-array unit accessors, matching the layout the SentencePiece
// normalizer's trie is built with.
fn unit_has_leaf(unit: u32) -> bool {
    (unit >> 8) & 1 == 1
}

fn unit_value(unit: u32) -> u32 {
    unit & 0x7fff_ffff
}

fn unit_label(unit: u32) -> u32 {
    unit & (0x8000_0000 | 0xff)
}

fn unit_offset(unit: u32) -> usize {
    ((unit >> 10) << ((unit & 0x200) >> 6)) as usize
}

/// Length of the UTF-8 character starting with `lead`, as the lattice ops
/// count it (invalid leads count as one byte).
pub(crate) fn utf8_char_len(lead: u8) -> usize {
    const LENGTHS: [usize; 16] = [1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 3, 4];
    LENGTHS[(lead >> 4) as usize]
}

enum CharsMapSource {
    Precompiled(PrecompiledCharsMap),
    Named(Option<UnicodeForm>),
}

/// Configurable normalization via a SentencePiece-compatible charsmap.
pub struct CharsMapNormalization {
    source: CharsMapSource,
    attrs: CharsMapAttrs,
}

impl CharsMapNormalization {
    /// Builds the operator from a precompiled charsmap blob (the legacy
    /// tensor-input path).
    pub fn from_precompiled(blob: &[u8], attrs: CharsMapAttrs) -> Result<Self, OpError> {
        Ok(Self { source: CharsMapSource::Precompiled(PrecompiledCharsMap::parse(blob)?), attrs })
    }

    /// Builds the operator from a named form: `identity`, `nfc`, `nfd`,
    /// `nfkc` or `nfkd`.
    pub fn from_named_form(name: &str, attrs: CharsMapAttrs) -> Result<Self, OpError> {
        let form = match name {
            "identity" => None,
            "nfc" | "nfd" | "nfkc" | "nfkd" => Some(UnicodeForm::from_name(name)?),
            _ => {
                return Err(OpError::Config(format!(
                    "CharsMapNormalization: unknown normalization form {name:?}"
                )))
            }
        };
        Ok(Self { source: CharsMapSource::Named(form), attrs })
    }

    pub fn evaluate(
        &self,
        input: &StringTensor,
        skips: Option<&[bool]>,
    ) -> Result<StringTensor, OpError> {
        input.validate("CharsMapNormalization")?;
        Ok(normalize_elements(input, skips, |bytes| self.normalize(bytes)))
    }

    fn normalize(&self, bytes: &[u8]) -> Vec<u8> {
        let mapped = match &self.source {
            CharsMapSource::Precompiled(map) => map.transform(bytes),
            CharsMapSource::Named(None) => bytes.to_vec(),
            CharsMapSource::Named(Some(form)) => {
                form.apply(&String::from_utf8_lossy(bytes)).into_bytes()
            }
        };

        let mut text = String::from_utf8_lossy(&mapped).into_owned();
        if self.attrs.case_fold {
            text = text.to_lowercase();
        }
        if self.attrs.remove_extra_whitespaces {
            text = collapse_whitespace(&text);
        }
        if self.attrs.add_dummy_prefix && !text.is_empty() {
            text.insert(0, ' ');
        }
        if self.attrs.escape_whitespaces {
            text = text.replace(' ', WHITESPACE_PIECE);
        }
        text.into_bytes()
    }
}

/// Trims leading/trailing spaces and collapses internal runs to one.
fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for ch in text.trim_matches(' ').chars() {
        if ch == ' ' {
            pending_space = true;
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(ch);
        }
    }
    out
}
