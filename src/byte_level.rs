//! Byte-level reversible encoding and the SentencePiece byte-token codec.
//!
//! `BytesToChars` implements the GPT-2 byte-to-visible-character remap: each
//! of the 256 byte values expands to a fixed 1- or 2-byte UTF-8 sequence so
//! byte-level BPE can operate on displayable text. `CharsToBytes` inverts
//! the mapping on the decode path. `ByteFallback` handles the other
//! convention for out-of-alphabet bytes, SentencePiece's literal `<0xHH>`
//! piece strings.
//!
//! # Mapping Strategy
//!
//! Printable ASCII and most of Latin-1 map to themselves; the remaining
//! bytes (0x00-0x20, 0x7F-0xA0, 0xAD) are assigned code points from U+0100
//! upward. The image of the mapping is always valid UTF-8 and the mapping
//! is bijective, so `CharsToBytes(BytesToChars(x)) == x` for every `x`.

use rustc_hash::FxHashMap;
use std::sync::LazyLock;

use crate::error::OpError;
use crate::tensor::RaggedStringTensor;

/// Byte to Unicode character mapping (256 entries).
static BYTE_TO_CHAR: LazyLock<[char; 256]> = LazyLock::new(|| {
    let mut mapping = ['\0'; 256];
    let mut next_char = 0x100u32;
    for b in 0u16..256 {
        mapping[b as usize] = match b as u8 {
            // Ranges that map to themselves.
            0x21..=0x7E | 0xA1..=0xAC | 0xAE..=0xFF => b as u8 as char,
            _ => {
                let ch = char::from_u32(next_char).unwrap();
                next_char += 1;
                ch
            }
        };
    }
    mapping
});

/// Unicode character to byte mapping (reverse of [`BYTE_TO_CHAR`]).
static CHAR_TO_BYTE: LazyLock<FxHashMap<char, u8>> = LazyLock::new(|| {
    BYTE_TO_CHAR
        .iter()
        .enumerate()
        .map(|(byte, &ch)| (ch, byte as u8))
        .collect()
});

/// Encodes raw bytes into their visible-character representation.
#[inline]
pub fn byte_level_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| BYTE_TO_CHAR[b as usize]).collect()
}

/// Decodes a visible-character string back to raw bytes. Characters outside
/// the byte-level alphabet pass through as their UTF-8 bytes.
#[inline]
pub fn byte_level_decode(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for ch in text.chars() {
        match CHAR_TO_BYTE.get(&ch) {
            Some(&byte) => out.push(byte),
            None => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out
}

/// Formats a byte as its SentencePiece piece string, e.g. `0x3A` -> `<0x3A>`.
pub fn byte_to_piece(byte: u8) -> String {
    format!("<0x{byte:02X}>")
}

/// Parses a SentencePiece byte piece back to its byte. The form check is
/// literal: length 6, `<0x` prefix, `>` suffix, two hex digits.
pub fn piece_to_byte(piece: &[u8]) -> Option<u8> {
    if piece.len() != 6 || !piece.starts_with(b"<0x") || piece[5] != b'>' {
        return None;
    }
    let hex = std::str::from_utf8(&piece[3..5]).ok()?;
    u8::from_str_radix(hex, 16).ok()
}

/// Applies the byte-to-character expansion to every element of a ragged
/// string tensor. Elements flagged in `skips` are copied verbatim.
pub struct BytesToChars;

impl BytesToChars {
    pub fn evaluate(&self, input: &RaggedStringTensor) -> Result<RaggedStringTensor, OpError> {
        input.validate("BytesToChars")?;
        remap_elements(input, |bytes| byte_level_encode(bytes).into_bytes())
    }
}

/// Inverts [`BytesToChars`] on every element of a ragged string tensor.
pub struct CharsToBytes;

impl CharsToBytes {
    pub fn evaluate(&self, input: &RaggedStringTensor) -> Result<RaggedStringTensor, OpError> {
        input.validate("CharsToBytes")?;
        remap_elements(input, |bytes| byte_level_decode(&String::from_utf8_lossy(bytes)))
    }
}

fn remap_elements<F>(
    input: &RaggedStringTensor,
    remap: F,
) -> Result<RaggedStringTensor, OpError>
where
    F: Fn(&[u8]) -> Vec<u8>,
{
    let mut begins = Vec::with_capacity(input.num_elements());
    let mut ends = Vec::with_capacity(input.num_elements());
    let mut chars = Vec::with_capacity(input.chars.len() * 2);
    for j in 0..input.num_elements() {
        begins.push(chars.len() as i32);
        if input.skip(j) {
            chars.extend_from_slice(input.element(j));
        } else {
            chars.extend_from_slice(&remap(input.element(j)));
        }
        ends.push(chars.len() as i32);
    }
    Ok(RaggedStringTensor {
        ragged_begins: input.ragged_begins.clone(),
        ragged_ends: input.ragged_ends.clone(),
        begins,
        ends,
        chars,
        skips: input.skips.clone(),
    })
}

/// Replaces elements holding a literal `<0xHH>` byte token with the single
/// byte `0xHH`; all other elements pass through.
pub struct ByteFallback;

impl ByteFallback {
    pub fn evaluate(
        &self,
        input: &crate::tensor::StringTensor,
    ) -> Result<crate::tensor::StringTensor, OpError> {
        input.validate("ByteFallback")?;
        let mut begins = Vec::with_capacity(input.len());
        let mut ends = Vec::with_capacity(input.len());
        let mut chars = Vec::with_capacity(input.chars.len());
        for j in 0..input.len() {
            let token = input.element(j);
            begins.push(chars.len() as i32);
            match piece_to_byte(token) {
                Some(byte) => chars.push(byte),
                None => chars.extend_from_slice(token),
            }
            ends.push(chars.len() as i32);
        }
        Ok(crate::tensor::StringTensor { begins, ends, chars })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::StringTensor;

    #[test]
    fn test_byte_level_mapping_is_bijective() {
        let mut seen = std::collections::HashSet::new();
        for b in 0u16..256 {
            assert!(seen.insert(BYTE_TO_CHAR[b as usize]), "duplicate mapping for byte {b}");
        }
        assert_eq!(seen.len(), 256);
    }

    #[test]
    fn test_byte_level_roundtrip_all_bytes() {
        for b in 0u16..256 {
            let encoded = byte_level_encode(&[b as u8]);
            assert_eq!(byte_level_decode(&encoded), vec![b as u8]);
        }
    }

    #[test]
    fn test_space_maps_to_g_with_dot() {
        // Space (0x20) becomes 'Ġ' (U+0120).
        assert_eq!(byte_level_encode(b" hello"), "Ġhello");
    }

    #[test]
    fn test_encoded_image_is_valid_utf8() {
        let all_bytes: Vec<u8> = (0u16..256).map(|b| b as u8).collect();
        let encoded = byte_level_encode(&all_bytes);
        assert!(std::str::from_utf8(encoded.as_bytes()).is_ok());
    }

    #[test]
    fn test_bytes_to_chars_op_roundtrip() {
        let input = RaggedStringTensor::from_rows(&[vec!["hi there"], vec!["日本"]]);
        let encoded = BytesToChars.evaluate(&input).unwrap();
        let decoded = CharsToBytes.evaluate(&encoded).unwrap();
        assert_eq!(decoded.to_string_rows(), input.to_string_rows());
    }

    #[test]
    fn test_bytes_to_chars_honors_skips() {
        let mut input = RaggedStringTensor::from_rows(&[vec!["<|eot|>", " x"]]);
        input.skips = Some(vec![true, false]);
        let out = BytesToChars.evaluate(&input).unwrap();
        assert_eq!(out.to_string_rows(), vec![vec!["<|eot|>".to_string(), "Ġx".to_string()]]);
    }

    #[test]
    fn test_piece_codec() {
        assert_eq!(byte_to_piece(0x3A), "<0x3A>");
        assert_eq!(piece_to_byte(b"<0x3A>"), Some(0x3A));
        assert_eq!(piece_to_byte(b"<0x3a>"), Some(0x3A));
        assert_eq!(piece_to_byte(b"<tok>"), None);
        assert_eq!(piece_to_byte(b"<0xZZ>"), None);
    }

    #[test]
    fn test_byte_fallback_op() {
        let input = StringTensor::from_strings(&["<0x41>", "plain", "<0xE4>"]);
        let out = ByteFallback.evaluate(&input).unwrap();
        assert_eq!(out.element(0), b"A");
        assert_eq!(out.element(1), b"plain");
        assert_eq!(out.element(2), &[0xE4]);
    }
}
