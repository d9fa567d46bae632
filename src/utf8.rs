//! UTF-8 validation over string tensors.
//!
//! The validator walks each element byte by byte. A lead byte is
//! classified by its high bits; continuation bytes must match `10xxxxxx`.
//! When a continuation check fails the offending byte is re-examined as a
//! fresh lead, so a single corrupt byte never swallows the character after
//! it. Completed sequences are checked against the minimum code point for
//! their length, which rejects overlong encodings.

use serde::{Deserialize, Serialize};

use crate::error::OpError;
use crate::tensor::StringTensor;

/// The UTF-8 encoding of U+FFFD, emitted per invalidation in replace mode.
const REPLACEMENT: [u8; 3] = [0xEF, 0xBF, 0xBD];

/// Lowest code point expressible by a 1-, 2-, 3- and 4-byte sequence.
const CODE_POINT_STARTS: [u32; 4] = [0x0, 0x80, 0x800, 0x10000];

/// What to do with an invalid sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Utf8ReplaceMode {
    /// Drop the offending bytes.
    Skip,
    /// Emit U+FFFD in their place.
    Replace,
}

/// Scans each element and skips or replaces invalid UTF-8 sequences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utf8Validate {
    mode: Utf8ReplaceMode,
}

impl Utf8Validate {
    pub fn new(mode: Utf8ReplaceMode) -> Self {
        Self { mode }
    }

    pub fn evaluate(&self, input: &StringTensor) -> Result<StringTensor, OpError> {
        input.validate("UTF8Validate")?;
        let replace = self.mode == Utf8ReplaceMode::Replace;

        let mut begins = Vec::with_capacity(input.len());
        let mut ends = Vec::with_capacity(input.len());
        // Worst case every byte is invalid and expands to U+FFFD.
        let mut chars = Vec::with_capacity(input.chars.len() * 3);
        for j in 0..input.len() {
            begins.push(chars.len() as i32);
            validate_into(input.element(j), replace, &mut chars);
            ends.push(chars.len() as i32);
        }
        chars.shrink_to_fit();
        Ok(StringTensor { begins, ends, chars })
    }
}

/// Appends the validated form of `bytes` to `out`.
fn validate_into(bytes: &[u8], replace: bool, out: &mut Vec<u8>) {
    let mut invalid = |out: &mut Vec<u8>| {
        if replace {
            out.extend_from_slice(&REPLACEMENT);
        }
    };

    let mut i = 0;
    while i < bytes.len() {
        let lead = bytes[i];
        if lead < 0x80 {
            out.push(lead);
            i += 1;
            continue;
        }

        let (num_bytes, lead_bits) = match lead {
            b if b >> 5 == 0b110 => (2, (b & 0b1_1111) as u32),
            b if b >> 4 == 0b1110 => (3, (b & 0b1111) as u32),
            b if b >> 3 == 0b1_1110 => (4, (b & 0b111) as u32),
            _ => {
                // Stray continuation byte or invalid lead.
                invalid(out);
                i += 1;
                continue;
            }
        };

        let mut code_point = lead_bits;
        let mut consumed = 1;
        let mut complete = true;
        for k in 1..num_bytes {
            match bytes.get(i + k) {
                Some(&b) if b >> 6 == 0b10 => {
                    code_point = (code_point << 6) | (b & 0b11_1111) as u32;
                    consumed += 1;
                }
                Some(_) => {
                    // Rewind: the offending byte becomes the next lead.
                    complete = false;
                    break;
                }
                None => {
                    // Truncated sequence at end of element.
                    consumed = bytes.len() - i;
                    complete = false;
                    break;
                }
            }
        }

        if complete && code_point >= CODE_POINT_STARTS[num_bytes - 1] {
            out.extend_from_slice(&bytes[i..i + num_bytes]);
            i += num_bytes;
        } else {
            invalid(out);
            i += consumed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(bytes: &[u8], mode: Utf8ReplaceMode) -> Vec<u8> {
        let input = StringTensor::from_byte_slices([bytes]);
        let out = Utf8Validate::new(mode).evaluate(&input).unwrap();
        out.element(0).to_vec()
    }

    #[test]
    fn test_valid_passes_through() {
        let text = "ascii, кот, 日本, 🦀".as_bytes();
        assert_eq!(run(text, Utf8ReplaceMode::Replace), text);
        assert_eq!(run(text, Utf8ReplaceMode::Skip), text);
    }

    #[test]
    fn test_replace_mode_scenario() {
        // A, invalid 2-byte start, '(', B.
        let input = [0x41, 0xC3, 0x28, 0x42];
        let expected = [0x41, 0xEF, 0xBF, 0xBD, 0x28, 0x42];
        assert_eq!(run(&input, Utf8ReplaceMode::Replace), expected);
    }

    #[test]
    fn test_skip_mode_drops() {
        let input = [0x41, 0xC3, 0x28, 0x42];
        assert_eq!(run(&input, Utf8ReplaceMode::Skip), [0x41, 0x28, 0x42]);
    }

    #[test]
    fn test_stray_continuation() {
        let input = [0x80, 0x41];
        assert_eq!(run(&input, Utf8ReplaceMode::Replace), [0xEF, 0xBF, 0xBD, 0x41]);
    }

    #[test]
    fn test_overlong_rejected() {
        // 0xC0 0x80 is an overlong encoding of NUL.
        let input = [0xC0, 0x80, 0x41];
        assert_eq!(run(&input, Utf8ReplaceMode::Skip), [0x41]);
    }

    #[test]
    fn test_truncated_tail() {
        // Lead of a 3-byte sequence with one continuation, then end.
        let input = [0x41, 0xE4, 0xB8];
        assert_eq!(run(&input, Utf8ReplaceMode::Replace), [0x41, 0xEF, 0xBF, 0xBD]);
    }

    #[test]
    fn test_idempotent() {
        let input = [0x41, 0xC3, 0x28, 0xF0, 0x9F, 0xA6, 0x80, 0xFF];
        let once = run(&input, Utf8ReplaceMode::Replace);
        let twice = run(&once, Utf8ReplaceMode::Replace);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_four_byte_sequence() {
        let crab = "🦀".as_bytes();
        assert_eq!(run(crab, Utf8ReplaceMode::Replace), crab);
    }
}
