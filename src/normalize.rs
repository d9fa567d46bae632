//! Normalization operators: `CaseFold`, `NormalizeUnicode`,
//! `RegexNormalization`, and the shared per-element helper they (and the
//! charsmap normalizer) are built on.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::error::OpError;
use crate::regex::{rewrite_replacement, PcreMatcher};
use crate::tensor::StringTensor;

/// Applies `normalizer` to every element of `input` in parallel and packs
/// the results contiguously. Elements with `skips[j] == true` are copied
/// verbatim.
pub fn normalize_elements<F>(
    input: &StringTensor,
    skips: Option<&[bool]>,
    normalizer: F,
) -> StringTensor
where
    F: Fn(&[u8]) -> Vec<u8> + Sync,
{
    let buffers: Vec<Vec<u8>> = (0..input.len())
        .into_par_iter()
        .map(|j| {
            let element = input.element(j);
            if skips.map_or(false, |s| s[j]) {
                element.to_vec()
            } else {
                normalizer(element)
            }
        })
        .collect();

    let total: usize = buffers.iter().map(Vec::len).sum();
    let mut begins = Vec::with_capacity(buffers.len());
    let mut ends = Vec::with_capacity(buffers.len());
    let mut chars = Vec::with_capacity(total);
    for buffer in &buffers {
        begins.push(chars.len() as i32);
        chars.extend_from_slice(buffer);
        ends.push(chars.len() as i32);
    }
    StringTensor { begins, ends, chars }
}

/// Case folding over a string tensor.
///
/// With the empty encoding only ASCII `A..Z` bytes are lowered; everything
/// else passes through byte-for-byte. With `"utf-8"` the whole element is
/// lowercased as Unicode text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseFold {
    encoding: String,
}

impl CaseFold {
    pub fn new(encoding: &str) -> Result<Self, OpError> {
        if encoding != "" && encoding != "utf-8" {
            return Err(OpError::Config(format!(
                "CaseFold: `encoding` attribute must be one of [\"\", \"utf-8\"], got {encoding:?}"
            )));
        }
        Ok(Self { encoding: encoding.to_string() })
    }

    pub fn evaluate(
        &self,
        input: &StringTensor,
        skips: Option<&[bool]>,
    ) -> Result<StringTensor, OpError> {
        input.validate("CaseFold")?;
        if self.encoding.is_empty() {
            Ok(normalize_elements(input, skips, |bytes| {
                bytes
                    .iter()
                    .map(|&b| if b.is_ascii_uppercase() { b + 0x20 } else { b })
                    .collect()
            }))
        } else {
            Ok(normalize_elements(input, skips, |bytes| {
                String::from_utf8_lossy(bytes).to_lowercase().into_bytes()
            }))
        }
    }
}

/// Unicode normalization forms supported by [`NormalizeUnicode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnicodeForm {
    Nfc,
    Nfd,
    Nfkc,
    Nfkd,
}

impl UnicodeForm {
    pub fn from_name(name: &str) -> Result<Self, OpError> {
        match name {
            "NFC" | "nfc" => Ok(Self::Nfc),
            "NFD" | "nfd" => Ok(Self::Nfd),
            "NFKC" | "nfkc" => Ok(Self::Nfkc),
            "NFKD" | "nfkd" => Ok(Self::Nfkd),
            _ => Err(OpError::Config(format!(
                "NormalizeUnicode: unknown normalization form {name:?}"
            ))),
        }
    }

    pub(crate) fn apply(self, text: &str) -> String {
        match self {
            Self::Nfc => text.nfc().collect(),
            Self::Nfd => text.nfd().collect(),
            Self::Nfkc => text.nfkc().collect(),
            Self::Nfkd => text.nfkd().collect(),
        }
    }
}

/// Unicode normalization over a string tensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizeUnicode {
    form: UnicodeForm,
}

impl NormalizeUnicode {
    pub fn new(form: &str) -> Result<Self, OpError> {
        Ok(Self { form: UnicodeForm::from_name(form)? })
    }

    pub fn evaluate(
        &self,
        input: &StringTensor,
        skips: Option<&[bool]>,
    ) -> Result<StringTensor, OpError> {
        input.validate("NormalizeUnicode")?;
        let form = self.form;
        Ok(normalize_elements(input, skips, |bytes| {
            form.apply(&String::from_utf8_lossy(bytes)).into_bytes()
        }))
    }
}

/// Regex search-and-replace over a string tensor.
///
/// The replacement accepts legacy `\1`..`\9` back-references, which are
/// rewritten to the `$N` form at construction. An invalid search pattern
/// turns the whole operator into a pass-through.
pub struct RegexNormalization {
    matcher: PcreMatcher,
    replacement: Vec<u8>,
    global_replace: bool,
}

impl RegexNormalization {
    pub fn new(search_pattern: &str, replacement: &[u8], global_replace: bool) -> Self {
        Self {
            matcher: PcreMatcher::new(search_pattern),
            replacement: rewrite_replacement(replacement),
            global_replace,
        }
    }

    pub fn evaluate(
        &self,
        input: &StringTensor,
        skips: Option<&[bool]>,
    ) -> Result<StringTensor, OpError> {
        input.validate("RegexNormalization")?;
        Ok(normalize_elements(input, skips, |bytes| {
            self.matcher.substitute(bytes, &self.replacement, self.global_replace)
        }))
    }
}
