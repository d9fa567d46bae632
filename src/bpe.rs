//! BPE tokenization with ranked-merge selection.
//!
//! The tokenizer is configured with static attributes and builds its state
//! (vocab map, merge table, seed trie) once, on the first `evaluate` call.
//! Seeding walks the input with a longest-prefix trie over the vocabulary
//! minus the merge products, so the initial segmentation cannot pre-emit
//! merged tokens. The merge loop then repeatedly applies the eligible pair
//! with the lowest merge rank, breaking ties by earliest position.
//!
//! The merge loop runs over an index arena: tokens live in a `Vec` of
//! nodes with `prev`/`next` links, and candidate pairs sit in a min-heap
//! keyed by `(rank, seq)`. A splice never invalidates indices, so stale
//! heap entries are detected on pop by re-checking liveness, adjacency and
//! the token IDs the entry was created for.
//!
//! Tokenization results for a pre-token are cached in an LRU map keyed by
//! a fast hash of its bytes; the cache only changes latency, never output.

use lru::LruCache;
use rustc_hash::{FxHashMap, FxHasher};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, OnceLock};

use crate::byte_level::byte_to_piece;
use crate::error::OpError;
use crate::tensor::{RaggedStringTensor, RaggedTensor, StringTensor};
use crate::trie::Trie;

/// Default capacity of the per-string result cache.
const DEFAULT_CACHE_CAPACITY: usize = 20_000;

/// Static attributes of [`BpeTokenizer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BpeOptions {
    pub unk_token: String,
    pub fuse_unk: bool,
    pub suffix_indicator: String,
    pub end_suffix: String,
    pub byte_fallback: bool,
    pub cache_capacity: usize,
}

impl Default for BpeOptions {
    fn default() -> Self {
        Self {
            unk_token: String::new(),
            fuse_unk: false,
            suffix_indicator: String::new(),
            end_suffix: String::new(),
            byte_fallback: false,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// The merges input: either one tensor of space-separated `left right`
/// lines, or two parallel tensors for tokenizers whose merges are stored
/// pre-split.
#[derive(Clone, Copy)]
pub enum MergesInput<'a> {
    Joined(&'a StringTensor),
    Pairs(&'a StringTensor, &'a StringTensor),
}

/// All `evaluate` inputs besides the strings themselves.
#[derive(Clone, Copy)]
pub struct BpeInputs<'a> {
    pub vocab: &'a StringTensor,
    pub merges: MergesInput<'a>,
    /// Added tokens and their IDs; matched whole before tokenization.
    pub added_tokens: Option<(&'a StringTensor, &'a [i32])>,
}

struct BpeState {
    trie: Trie,
    merges: FxHashMap<(i32, i32), (u32, i32)>,
    added_tokens: FxHashMap<Vec<u8>, i32>,
    unk_token_id: i32,
    byte_ids: [i32; 256],
}

/// BPE tokenizer over pre-tokenized ragged strings.
pub struct BpeTokenizer {
    opts: BpeOptions,
    state: OnceLock<Arc<BpeState>>,
    cache: Mutex<LruCache<u64, Vec<i32>>>,
}

impl BpeTokenizer {
    pub fn new(opts: BpeOptions) -> Self {
        let capacity = NonZeroUsize::new(opts.cache_capacity.max(1)).unwrap();
        Self { opts, state: OnceLock::new(), cache: Mutex::new(LruCache::new(capacity)) }
    }

    pub fn evaluate(
        &self,
        input: &RaggedStringTensor,
        inputs: BpeInputs,
    ) -> Result<RaggedTensor<i32>, OpError> {
        input.validate("BPETokenizer")?;
        let state = match self.state.get() {
            Some(state) => state,
            None => {
                let built = Arc::new(BpeState::build(&self.opts, inputs)?);
                self.state.get_or_init(|| built)
            }
        };

        let mut begins = Vec::with_capacity(input.num_rows());
        let mut ends = Vec::with_capacity(input.num_rows());
        let mut data = Vec::new();
        for i in 0..input.num_rows() {
            begins.push(data.len() as i32);
            for j in input.row(i) {
                let element = input.element(j);
                if let Some(&id) = state.added_tokens.get(element) {
                    data.push(id);
                    continue;
                }
                data.extend_from_slice(&self.tokenize(state, element));
            }
            ends.push(data.len() as i32);
        }
        Ok(RaggedTensor { begins, ends, data })
    }

    /// Tokenizes one pre-token, consulting and feeding the result cache.
    fn tokenize(&self, state: &BpeState, bytes: &[u8]) -> Vec<i32> {
        let mut text = bytes.to_vec();
        text.extend_from_slice(self.opts.end_suffix.as_bytes());

        let hash = hash_bytes(&text);
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(cached) = cache.get(&hash) {
                return cached.clone();
            }
        }

        let seeded = self.seed(state, &text);
        let seeded_len = seeded.len();
        let tokens = merge_tokens(&state.merges, seeded);

        if seeded_len > 2 {
            if let Ok(mut cache) = self.cache.lock() {
                cache.put(hash, tokens.clone());
            }
        }
        tokens
    }

    /// Longest-prefix seeding with byte-fallback / unk handling.
    fn seed(&self, state: &BpeState, text: &[u8]) -> Vec<i32> {
        let mut tokens = Vec::with_capacity(text.len());
        let mut idx = 0;
        while idx < text.len() {
            let id = state.trie.find_longest(text, &mut idx);
            if id >= 0 {
                tokens.push(id);
                continue;
            }
            if self.opts.byte_fallback && state.byte_ids[text[idx] as usize] >= 0 {
                tokens.push(state.byte_ids[text[idx] as usize]);
            } else if !self.opts.fuse_unk || tokens.last() != Some(&state.unk_token_id) {
                tokens.push(state.unk_token_id);
            }
            idx += 1;
        }
        tokens
    }
}

impl Clone for BpeTokenizer {
    /// The clone shares the constructed state but starts with an empty
    /// cache, mirroring how a re-wired operator instance behaves.
    fn clone(&self) -> Self {
        let capacity = NonZeroUsize::new(self.opts.cache_capacity.max(1)).unwrap();
        let state = OnceLock::new();
        if let Some(built) = self.state.get() {
            let _ = state.set(Arc::clone(built));
        }
        Self { opts: self.opts.clone(), state, cache: Mutex::new(LruCache::new(capacity)) }
    }
}

impl BpeState {
    fn build(opts: &BpeOptions, inputs: BpeInputs) -> Result<Self, OpError> {
        let vocab: FxHashMap<Vec<u8>, i32> = (0..inputs.vocab.len())
            .map(|id| (inputs.vocab.element(id).to_vec(), id as i32))
            .collect();

        let pairs = collect_merge_pairs(inputs.merges)?;
        let mut merges = FxHashMap::default();
        let mut root_vocab = vocab.clone();
        for (rank, (left, right)) in pairs.iter().enumerate() {
            let left_id = *vocab.get(left).ok_or_else(|| {
                OpError::Config(format!(
                    "BPETokenizer: merge operand {:?} is not in the vocab",
                    String::from_utf8_lossy(left)
                ))
            })?;
            let right_id = *vocab.get(right).ok_or_else(|| {
                OpError::Config(format!(
                    "BPETokenizer: merge operand {:?} is not in the vocab",
                    String::from_utf8_lossy(right)
                ))
            })?;
            let mut merged = left.clone();
            merged.extend_from_slice(right);
            let merged_id = *vocab.get(&merged).ok_or_else(|| {
                OpError::Config(format!(
                    "BPETokenizer: merge product {:?} is not in the vocab",
                    String::from_utf8_lossy(&merged)
                ))
            })?;
            merges.insert((left_id, right_id), (rank as u32, merged_id));
            // The product must not be reachable during seeding.
            root_vocab.remove(&merged);
        }

        let mut trie = Trie::new();
        for (token, &id) in &root_vocab {
            trie.add(token, id);
        }

        let mut added_tokens = FxHashMap::default();
        if let Some((tokens, ids)) = inputs.added_tokens {
            if tokens.len() != ids.len() {
                return Err(OpError::Shape(format!(
                    "BPETokenizer: {} added tokens but {} indices",
                    tokens.len(),
                    ids.len()
                )));
            }
            for j in 0..tokens.len() {
                added_tokens.insert(tokens.element(j).to_vec(), ids[j]);
                trie.add(tokens.element(j), ids[j]);
            }
        }

        let unk_token_id = if opts.unk_token.is_empty() {
            -1
        } else {
            *vocab.get(opts.unk_token.as_bytes()).ok_or_else(|| {
                OpError::Config(format!(
                    "BPETokenizer: unk_token {:?} is not in the vocab",
                    opts.unk_token
                ))
            })?
        };

        let mut byte_ids = [-1i32; 256];
        if opts.byte_fallback {
            for (byte, slot) in byte_ids.iter_mut().enumerate() {
                if let Some(&id) = vocab.get(byte_to_piece(byte as u8).as_bytes()) {
                    *slot = id;
                }
            }
        }

        Ok(Self { trie, merges, added_tokens, unk_token_id, byte_ids })
    }
}

fn collect_merge_pairs(merges: MergesInput) -> Result<Vec<(Vec<u8>, Vec<u8>)>, OpError> {
    match merges {
        MergesInput::Joined(tensor) => (0..tensor.len())
            .map(|j| {
                let line = tensor.element(j);
                let delim = line.iter().position(|&b| b == b' ').ok_or_else(|| {
                    OpError::Config(format!(
                        "BPETokenizer: merge line {:?} has no space delimiter",
                        String::from_utf8_lossy(line)
                    ))
                })?;
                Ok((line[..delim].to_vec(), line[delim + 1..].to_vec()))
            })
            .collect(),
        MergesInput::Pairs(left, right) => {
            if left.len() != right.len() {
                return Err(OpError::Shape(format!(
                    "BPETokenizer: {} left merges but {} right merges",
                    left.len(),
                    right.len()
                )));
            }
            Ok((0..left.len())
                .map(|j| (left.element(j).to_vec(), right.element(j).to_vec()))
                .collect())
        }
    }
}

#[derive(Clone, Copy)]
struct Node {
    id: i32,
    prev: i32,
    next: i32,
    alive: bool,
}

/// A candidate adjacent pair in the heap. `left_id`/`right_id` pin the
/// token IDs the entry was created for, so an entry outlived by a splice
/// is recognized as stale on pop.
type PairEntry = Reverse<(u32, u64, usize, usize, i32, i32)>;

/// Applies the ranked merges until none is eligible.
fn merge_tokens(merges: &FxHashMap<(i32, i32), (u32, i32)>, seeded: Vec<i32>) -> Vec<i32> {
    if seeded.len() < 2 || merges.is_empty() {
        return seeded;
    }

    let mut nodes: Vec<Node> = seeded
        .iter()
        .enumerate()
        .map(|(i, &id)| Node {
            id,
            prev: i as i32 - 1,
            next: if i + 1 < seeded.len() { i as i32 + 1 } else { -1 },
            alive: true,
        })
        .collect();
    let mut head = 0i32;

    let mut seq = 0u64;
    let mut heap: BinaryHeap<PairEntry> = BinaryHeap::new();
    let mut push_pair = |heap: &mut BinaryHeap<PairEntry>,
                         nodes: &[Node],
                         seq: &mut u64,
                         left: usize,
                         right: usize| {
        let pair = (nodes[left].id, nodes[right].id);
        if let Some(&(rank, _)) = merges.get(&pair) {
            heap.push(Reverse((rank, *seq, left, right, pair.0, pair.1)));
            *seq += 1;
        }
    };

    for left in 0..seeded.len() - 1 {
        push_pair(&mut heap, &nodes, &mut seq, left, left + 1);
    }

    while let Some(Reverse((_rank, _seq, left, right, left_id, right_id))) = heap.pop() {
        // Stale entries: a neighbor was already spliced away or re-labeled.
        if !nodes[left].alive
            || !nodes[right].alive
            || nodes[left].next != right as i32
            || nodes[left].id != left_id
            || nodes[right].id != right_id
        {
            continue;
        }
        let merged_id = merges[&(left_id, right_id)].1;

        // Splice: the left node carries the merged token, the right dies.
        nodes[left].id = merged_id;
        let after = nodes[right].next;
        nodes[left].next = after;
        nodes[right].alive = false;
        if after >= 0 {
            nodes[after as usize].prev = left as i32;
        }
        if head == right as i32 {
            head = left as i32;
        }

        let before = nodes[left].prev;
        if before >= 0 {
            push_pair(&mut heap, &nodes, &mut seq, before as usize, left);
        }
        if after >= 0 {
            push_pair(&mut heap, &nodes, &mut seq, left, after as usize);
        }
    }

    let mut tokens = Vec::with_capacity(seeded.len());
    let mut cursor = head;
    while cursor >= 0 {
        tokens.push(nodes[cursor as usize].id);
        cursor = nodes[cursor as usize].next;
    }
    tokens
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    bytes.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(
        vocab: &[&str],
        merges: &[&str],
        opts: BpeOptions,
        text: &str,
    ) -> Vec<i32> {
        let vocab = StringTensor::from_strings(vocab);
        let merges = StringTensor::from_strings(merges);
        let tokenizer = BpeTokenizer::new(opts);
        let input = RaggedStringTensor::from_rows(&[vec![text]]);
        let out = tokenizer
            .evaluate(
                &input,
                BpeInputs {
                    vocab: &vocab,
                    merges: MergesInput::Joined(&merges),
                    added_tokens: None,
                },
            )
            .unwrap();
        out.row(0).to_vec()
    }

    #[test]
    fn test_merge_rank_tie_break() {
        // Lower-rank `a b` wins over `b a`; the trailing `a` emits its
        // root ID.
        let tokens = run(
            &["a", "b", "ab", "ba"],
            &["a b", "b a"],
            BpeOptions::default(),
            "aba",
        );
        assert_eq!(tokens, vec![2, 0]);
    }

    #[test]
    fn test_chained_merges() {
        let tokens = run(
            &["h", "e", "l", "o", "he", "ll", "hell", "hello"],
            &["h e", "l l", "he ll", "hell o"],
            BpeOptions::default(),
            "hello",
        );
        assert_eq!(tokens, vec![7]);
    }

    #[test]
    fn test_determinism_and_cache_agreement() {
        let vocab = StringTensor::from_strings(&["a", "b", "ab"]);
        let merges = StringTensor::from_strings(&["a b"]);
        let tokenizer = BpeTokenizer::new(BpeOptions::default());
        let input = RaggedStringTensor::from_rows(&[vec!["abab"]]);
        let inputs = BpeInputs {
            vocab: &vocab,
            merges: MergesInput::Joined(&merges),
            added_tokens: None,
        };
        let first = tokenizer.evaluate(&input, inputs).unwrap();
        let second = tokenizer.evaluate(&input, inputs).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.row(0), &[2, 2]);
    }

    #[test]
    fn test_unk_and_fuse() {
        let opts = BpeOptions {
            unk_token: "<unk>".to_string(),
            fuse_unk: true,
            ..BpeOptions::default()
        };
        let tokens = run(&["<unk>", "a"], &[], opts, "axxa");
        // Both x bytes collapse into one unk.
        assert_eq!(tokens, vec![1, 0, 1]);
    }

    #[test]
    fn test_unfused_unk() {
        let opts = BpeOptions { unk_token: "<unk>".to_string(), ..BpeOptions::default() };
        let tokens = run(&["<unk>", "a"], &[], opts, "xx");
        assert_eq!(tokens, vec![0, 0]);
    }

    #[test]
    fn test_byte_fallback() {
        let opts = BpeOptions { byte_fallback: true, ..BpeOptions::default() };
        let tokens = run(&["a", "<0x78>"], &[], opts, "ax");
        assert_eq!(tokens, vec![0, 1]);
    }

    #[test]
    fn test_end_suffix() {
        let opts = BpeOptions { end_suffix: "</w>".to_string(), ..BpeOptions::default() };
        let tokens = run(&["a", "</w>", "a</w>"], &["a </w>"], opts, "a");
        assert_eq!(tokens, vec![2]);
    }

    #[test]
    fn test_missing_merge_operand_is_config_error() {
        let vocab = StringTensor::from_strings(&["a", "b"]);
        let merges = StringTensor::from_strings(&["a c"]);
        let tokenizer = BpeTokenizer::new(BpeOptions::default());
        let input = RaggedStringTensor::from_rows(&[vec!["ab"]]);
        let result = tokenizer.evaluate(
            &input,
            BpeInputs { vocab: &vocab, merges: MergesInput::Joined(&merges), added_tokens: None },
        );
        assert!(matches!(result, Err(OpError::Config(_))));
    }

    #[test]
    fn test_missing_merge_product_is_config_error() {
        let vocab = StringTensor::from_strings(&["a", "b"]);
        let merges = StringTensor::from_strings(&["a b"]);
        let tokenizer = BpeTokenizer::new(BpeOptions::default());
        let input = RaggedStringTensor::from_rows(&[vec!["ab"]]);
        let result = tokenizer.evaluate(
            &input,
            BpeInputs { vocab: &vocab, merges: MergesInput::Joined(&merges), added_tokens: None },
        );
        assert!(matches!(result, Err(OpError::Config(_))));
    }

    #[test]
    fn test_parallel_merge_tensors() {
        let vocab = StringTensor::from_strings(&["a", "b", "ab"]);
        let left = StringTensor::from_strings(&["a"]);
        let right = StringTensor::from_strings(&["b"]);
        let tokenizer = BpeTokenizer::new(BpeOptions::default());
        let input = RaggedStringTensor::from_rows(&[vec!["ab"]]);
        let out = tokenizer
            .evaluate(
                &input,
                BpeInputs {
                    vocab: &vocab,
                    merges: MergesInput::Pairs(&left, &right),
                    added_tokens: None,
                },
            )
            .unwrap();
        assert_eq!(out.row(0), &[2]);
    }

    #[test]
    fn test_added_tokens_bypass_merges() {
        let vocab = StringTensor::from_strings(&["a", "b", "ab"]);
        let merges = StringTensor::from_strings(&["a b"]);
        let added = StringTensor::from_strings(&["<|special|>"]);
        let tokenizer = BpeTokenizer::new(BpeOptions::default());
        let input = RaggedStringTensor::from_rows(&[vec!["<|special|>", "ab"]]);
        let out = tokenizer
            .evaluate(
                &input,
                BpeInputs {
                    vocab: &vocab,
                    merges: MergesInput::Joined(&merges),
                    added_tokens: Some((&added, &[777])),
                },
            )
            .unwrap();
        assert_eq!(out.row(0), &[777, 2]);
    }

    #[test]
    fn test_clone_shares_state() {
        let vocab = StringTensor::from_strings(&["a", "b", "ab"]);
        let merges = StringTensor::from_strings(&["a b"]);
        let tokenizer = BpeTokenizer::new(BpeOptions::default());
        let input = RaggedStringTensor::from_rows(&[vec!["ab"]]);
        let inputs = BpeInputs {
            vocab: &vocab,
            merges: MergesInput::Joined(&merges),
            added_tokens: None,
        };
        tokenizer.evaluate(&input, inputs).unwrap();
        let cloned = tokenizer.clone();
        assert_eq!(cloned.evaluate(&input, inputs).unwrap().row(0), &[2]);
    }

    #[test]
    fn test_repeated_merges_long_run() {
        // "aaaa" with a single `a a` merge pairs up left to right.
        let tokens = run(&["a", "aa"], &["a a"], BpeOptions::default(), "aaaa");
        assert_eq!(tokens, vec![1, 1]);
    }
}
