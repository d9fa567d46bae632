//! Adapters over serialized SentencePiece models.
//!
//! The model arrives as a `u8` buffer holding the serialized model proto;
//! `sentencepiece-model` parses out the pieces and scores, which feed the
//! crate's own Unigram engine. Control pieces are excluded from text
//! matching, and byte pieces (`<0xHH>`) participate through the byte
//! fallback path.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

use sentencepiece_model::SentencePieceModel;

use crate::byte_level::piece_to_byte;
use crate::charsmap::WHITESPACE_PIECE;
use crate::error::OpError;
use crate::regex::PcreMatcher;
use crate::tensor::{DenseTensor, RaggedTensor, StringTensor};
use crate::unigram::{UnigramModel, UnigramOptions};

/// Static attributes of [`SentencepieceTokenizer`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SentencepieceOptions {
    pub add_bos: bool,
    pub add_eos: bool,
    pub reverse: bool,
}

struct SpModel {
    pieces: Vec<Vec<u8>>,
    engine: UnigramModel,
    unk_id: i32,
    bos_id: i32,
    eos_id: i32,
}

impl SpModel {
    fn parse(model_bytes: &[u8]) -> Result<Self, OpError> {
        let proto = SentencePieceModel::from_slice(model_bytes).map_err(|err| {
            OpError::Config(format!("SentencepieceTokenizer: cannot parse model: {err}"))
        })?;

        let mut pieces: Vec<Vec<u8>> = Vec::new();
        let mut scores: Vec<f32> = Vec::new();
        for piece in proto.pieces() {
            pieces.push(piece.piece().as_bytes().to_vec());
            scores.push(piece.score());
        }
        if pieces.is_empty() {
            return Err(OpError::Config(
                "SentencepieceTokenizer: model holds no pieces".to_string(),
            ));
        }

        let find = |needle: &[u8], default: i32| {
            pieces.iter().position(|p| p == needle).map_or(default, |p| p as i32)
        };
        let unk_id = find(b"<unk>", 0);
        let bos_id = find(b"<s>", 1);
        let eos_id = find(b"</s>", 2);

        // Byte fallback is available when the model carries all 256 byte
        // pieces.
        let byte_fallback =
            (0u16..256).all(|b| pieces.iter().any(|p| piece_to_byte(p) == Some(b as u8)));

        // Control pieces must not match text; blanking them keeps their
        // IDs while keeping them out of the matching trie.
        let control: [&[u8]; 4] = [b"<unk>", b"<s>", b"</s>", b"<pad>"];
        let match_pieces: Vec<&[u8]> = pieces
            .iter()
            .map(|p| {
                if control.contains(&p.as_slice()) {
                    &b""[..]
                } else {
                    p.as_slice()
                }
            })
            .collect();
        let vocab = StringTensor::from_byte_slices(match_pieces);
        let engine = UnigramModel::build(
            &vocab,
            &scores,
            &UnigramOptions { unk_token_id: unk_id, byte_fallback, fuse_unk: true },
        )?;

        Ok(Self { pieces, engine, unk_id, bos_id, eos_id })
    }

    /// Applies the SentencePiece input normalization: the dummy prefix and
    /// whitespace escaping to `▁`.
    fn normalize(&self, text: &[u8]) -> Vec<u8> {
        let mut normalized = String::with_capacity(text.len() + 4);
        normalized.push(' ');
        normalized.push_str(&String::from_utf8_lossy(text));
        normalized.replace(' ', WHITESPACE_PIECE).into_bytes()
    }

    fn encode_text(&self, text: &[u8]) -> Vec<i32> {
        if text.is_empty() {
            return Vec::new();
        }
        self.engine.tokenize(&self.normalize(text))
    }
}

/// Encodes strings with a serialized SentencePiece model, optionally
/// isolating registered special tokens first.
pub struct SentencepieceTokenizer {
    opts: SentencepieceOptions,
    state: OnceLock<Arc<SpModel>>,
    specials: OnceLock<Arc<(PcreMatcher, FxHashMap<Vec<u8>, i32>)>>,
}

impl SentencepieceTokenizer {
    pub fn new(opts: SentencepieceOptions) -> Self {
        Self { opts, state: OnceLock::new(), specials: OnceLock::new() }
    }

    pub fn evaluate(
        &self,
        model_bytes: &[u8],
        input: &StringTensor,
        special_tokens: Option<(&StringTensor, &[i32])>,
    ) -> Result<RaggedTensor<i32>, OpError> {
        input.validate("SentencepieceTokenizer")?;
        let model = match self.state.get() {
            Some(model) => model,
            None => {
                let built = Arc::new(SpModel::parse(model_bytes)?);
                self.state.get_or_init(|| built)
            }
        };
        let specials = match special_tokens {
            Some((tokens, ids)) => {
                if tokens.len() != ids.len() {
                    return Err(OpError::Shape(format!(
                        "SentencepieceTokenizer: {} special tokens but {} ids",
                        tokens.len(),
                        ids.len()
                    )));
                }
                Some(match self.specials.get() {
                    Some(state) => state,
                    None => {
                        let built = Arc::new(build_specials(tokens, ids));
                        self.specials.get_or_init(|| built)
                    }
                })
            }
            None => None,
        };

        let mut begins = Vec::with_capacity(input.len());
        let mut ends = Vec::with_capacity(input.len());
        let mut data = Vec::new();
        for j in 0..input.len() {
            begins.push(data.len() as i32);
            let sentence = input.element(j);

            let mut ids = Vec::new();
            if self.opts.add_bos {
                ids.push(model.bos_id);
            }
            match specials {
                Some(state) => {
                    let (matcher, id_map) = state.as_ref();
                    let mut cursor = 0usize;
                    while let Some((s, e)) = matcher.find_at(sentence, cursor) {
                        ids.extend_from_slice(&model.encode_text(&sentence[cursor..s]));
                        match id_map.get(&sentence[s..e]) {
                            Some(&id) => ids.push(id),
                            // No id registered; treat the span as text.
                            None => ids.extend_from_slice(&model.encode_text(&sentence[s..e])),
                        }
                        cursor = e;
                    }
                    ids.extend_from_slice(&model.encode_text(&sentence[cursor..]));
                }
                None => ids.extend_from_slice(&model.encode_text(sentence)),
            }
            if self.opts.add_eos {
                ids.push(model.eos_id);
            }
            if self.opts.reverse {
                ids.reverse();
            }

            data.extend_from_slice(&ids);
            ends.push(data.len() as i32);
        }
        Ok(RaggedTensor { begins, ends, data })
    }

    /// The model's unknown-piece ID, once a model has been parsed.
    pub fn unk_id(&self) -> Option<i32> {
        self.state.get().map(|m| m.unk_id)
    }
}

impl Clone for SentencepieceTokenizer {
    fn clone(&self) -> Self {
        let state = OnceLock::new();
        if let Some(built) = self.state.get() {
            let _ = state.set(Arc::clone(built));
        }
        let specials = OnceLock::new();
        if let Some(built) = self.specials.get() {
            let _ = specials.set(Arc::clone(built));
        }
        Self { opts: self.opts, state, specials }
    }
}

/// Compiles the special-tokens alternation. Fully alphanumeric tokens get
/// word-boundary guards so they cannot split ordinary words.
fn build_specials(
    tokens: &StringTensor,
    ids: &[i32],
) -> (PcreMatcher, FxHashMap<Vec<u8>, i32>) {
    let mut alternation = String::new();
    let mut id_map = FxHashMap::default();
    for j in 0..tokens.len() {
        let token = tokens.element(j);
        let quoted = quote_meta(&String::from_utf8_lossy(token));
        if !alternation.is_empty() {
            alternation.push('|');
        }
        if token.iter().all(|b| b.is_ascii_alphanumeric()) {
            alternation.push_str(&format!("\\b{quoted}|{quoted}\\b"));
        } else {
            alternation.push_str(&quoted);
        }
        id_map.insert(token.to_vec(), ids[j]);
    }
    (PcreMatcher::new(&format!("({alternation})")), id_map)
}

fn quote_meta(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch.is_ascii() && !ch.is_ascii_alphanumeric() && ch != '_' {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Decodes dense token IDs back to strings with a serialized model.
pub struct SentencepieceDetokenizer {
    state: OnceLock<Arc<SpModel>>,
}

impl Default for SentencepieceDetokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl SentencepieceDetokenizer {
    pub fn new() -> Self {
        Self { state: OnceLock::new() }
    }

    pub fn evaluate(
        &self,
        model_bytes: &[u8],
        ids: &DenseTensor<i32>,
    ) -> Result<StringTensor, OpError> {
        let model = match self.state.get() {
            Some(model) => model,
            None => {
                let built = Arc::new(SpModel::parse(model_bytes)?);
                self.state.get_or_init(|| built)
            }
        };

        let vocab_size = model.pieces.len() as i32;
        let mut begins = Vec::with_capacity(ids.rows);
        let mut ends = Vec::with_capacity(ids.rows);
        let mut chars = Vec::new();
        for row in 0..ids.rows {
            begins.push(chars.len() as i32);
            let mut detokenized: Vec<u8> = Vec::new();
            for &token_id in ids.row(row) {
                if !(0..vocab_size).contains(&token_id) {
                    continue;
                }
                let piece = &model.pieces[token_id as usize];
                match piece_to_byte(piece) {
                    Some(byte) => detokenized.push(byte),
                    None => {
                        let text = String::from_utf8_lossy(piece)
                            .replace(WHITESPACE_PIECE, " ");
                        detokenized.extend_from_slice(text.as_bytes());
                    }
                }
            }
            // Drop the dummy prefix the encoder added.
            let skip = if detokenized.first() == Some(&b' ') { 1 } else { 0 };
            chars.extend_from_slice(&detokenized[skip..]);
            ends.push(chars.len() as i32);
        }
        Ok(StringTensor { begins, ends, chars })
    }
}

impl Clone for SentencepieceDetokenizer {
    fn clone(&self) -> Self {
        let state = OnceLock::new();
        if let Some(built) = self.state.get() {
            let _ = state.set(Arc::clone(built));
        }
        Self { state }
    }
}

/// Decodes one token at a time: byte pieces become raw bytes, every other
/// piece is concatenated verbatim. Presentation (the `▁` marker) is left
/// to the streaming consumer.
pub struct SentencepieceStreamDetokenizer {
    state: OnceLock<Arc<SpModel>>,
}

impl Default for SentencepieceStreamDetokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl SentencepieceStreamDetokenizer {
    pub fn new() -> Self {
        Self { state: OnceLock::new() }
    }

    pub fn evaluate(
        &self,
        model_bytes: &[u8],
        ids: &DenseTensor<i32>,
    ) -> Result<StringTensor, OpError> {
        let model = match self.state.get() {
            Some(model) => model,
            None => {
                let built = Arc::new(SpModel::parse(model_bytes)?);
                self.state.get_or_init(|| built)
            }
        };

        let vocab_size = model.pieces.len() as i32;
        let mut begins = Vec::with_capacity(ids.rows);
        let mut ends = Vec::with_capacity(ids.rows);
        let mut chars = Vec::new();
        for row in 0..ids.rows {
            begins.push(chars.len() as i32);
            for &token_id in ids.row(row) {
                if !(0..vocab_size).contains(&token_id) {
                    continue;
                }
                let piece = &model.pieces[token_id as usize];
                match piece_to_byte(piece) {
                    Some(byte) => chars.push(byte),
                    None => chars.extend_from_slice(piece),
                }
            }
            ends.push(chars.len() as i32);
        }
        Ok(StringTensor { begins, ends, chars })
    }
}

impl Clone for SentencepieceStreamDetokenizer {
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
    fn test_quote_meta() {
        assert_eq!(quote_meta("[PAD]"), "\\[PAD\\]");
        assert_eq!(quote_meta("sop"), "sop");
        assert_eq!(quote_meta("a.b"), "a\\.b");
    }

    #[test]
    fn test_specials_alternation_word_boundaries() {
        let tokens = StringTensor::from_strings(&["eop", "<|x|>"]);
        let (matcher, id_map) = build_specials(&tokens, &[7, 8]);
        // "eop" strictly inside "people" must not match.
        assert_eq!(matcher.find_at(b"people", 0), None);
        let m = matcher.find_at(b"eop here", 0).unwrap();
        assert_eq!(m, (0, 3));
        assert_eq!(id_map.get(&b"eop"[..]), Some(&7));
        assert!(matcher.find_at(b"a<|x|>b", 0).is_some());
        assert_eq!(id_map.get(&b"<|x|>"[..]), Some(&8));
    }
}
