//! Ragtok - text tokenization and detokenization primitives over ragged
//! string tensors.
//!
//! The crate reproduces, bit-identically, the tokenization behavior of the
//! modern language-model tokenizer families. Each operator is a pure
//! function over a fixed ragged-tensor calling convention; a pipeline
//! composes them from raw strings to integer token IDs and back:
//!
//! ```text
//! raw strings
//!   -> SpecialTokensSplit
//!   -> CaseFold / NormalizeUnicode / CharsMapNormalization
//!   -> RegexSplit
//!   -> BytesToChars
//!   -> {Bpe | Wordpiece | Unigram | Trie}Tokenizer
//!   -> CombineSegments / Truncate / RaggedToDense
//! ```
//!
//! # Architecture
//!
//! - [`tensor`]: the decomposed `(begins, ends, chars)` string tensors and
//!   their ragged and dense relatives
//! - [`bpe`], [`wordpiece`], [`unigram`], [`trie_tok`]: the tokenizer
//!   engines
//! - [`split`], [`normalize`], [`charsmap`], [`byte_level`], [`utf8`]:
//!   the segmentation and normalization stages in front of them
//! - [`sentencepiece`]: adapters over serialized SentencePiece models
//! - [`combine`], [`ragged`], [`vocab`], [`hash`]: shape bridging and
//!   vocabulary lookup around the integer outputs
//!
//! # Performance Characteristics
//!
//! - PCRE2 with JIT compilation for all pattern matching
//! - Rayon parallelism across batch elements in the normalization,
//!   lookup and hashing operators
//! - FxHashMap for vocab tables and caches
//! - Linked-list BPE merges over an index arena (avoids O(N^2) rescans
//!   on pathological inputs)
//! - LRU cache for repeatedly tokenized pre-tokens
//!
//! Operators build their internal caches at most once, on the first
//! `evaluate` call, and are safe to call concurrently afterwards; cloning
//! an operator shares the built caches.

pub mod bpe;
pub mod byte_level;
pub mod charsmap;
pub mod combine;
mod error;
pub mod hash;
pub mod normalize;
pub mod ragged;
pub mod regex;
pub mod sentencepiece;
pub mod split;
pub mod tensor;
pub mod trie;
pub mod trie_tok;
pub mod unigram;
pub mod utf8;
pub mod vocab;
pub mod wordpiece;

pub use bpe::{BpeInputs, BpeOptions, BpeTokenizer, MergesInput};
pub use byte_level::{ByteFallback, BytesToChars, CharsToBytes};
pub use charsmap::{CharsMapAttrs, CharsMapNormalization, PrecompiledCharsMap};
pub use combine::{CombineSegments, Truncate, TruncationMode, TruncationSide};
pub use error::OpError;
pub use hash::StringToHashBucket;
pub use normalize::{CaseFold, NormalizeUnicode, RegexNormalization};
pub use ragged::{FuzeRagged, RaggedToDense, RaggedToRagged, RaggedToSparse};
pub use regex::PcreMatcher;
pub use sentencepiece::{
    SentencepieceDetokenizer, SentencepieceOptions, SentencepieceStreamDetokenizer,
    SentencepieceTokenizer,
};
pub use split::{RegexSplit, SpecialTokensSplit, SplitBehaviour};
pub use tensor::{DenseTensor, RaggedStringTensor, RaggedTensor, StringTensor};
pub use trie::Trie;
pub use trie_tok::TrieTokenizer;
pub use unigram::{UnigramOptions, UnigramTokenizer};
pub use utf8::{Utf8ReplaceMode, Utf8Validate};
pub use vocab::{EqualStr, VocabDecoder, VocabEncoder};
pub use wordpiece::{WordpieceOptions, WordpieceTokenizer};
