//! String hashing to fixed buckets.
//!
//! The hash is the 64-bit FarmHash variant, reproduced bit-identically:
//! the published `k0`/`k1`/`k2` constants, the length-dispatched mixing
//! routines for 0-16, 17-32 and 33-64 bytes, and the iterated 64-byte
//! block loop for longer inputs.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::OpError;
use crate::tensor::StringTensor;

const K0: u64 = 0xc3a5c85c97cb3127;
const K1: u64 = 0xb492b66fbe98f273;
const K2: u64 = 0x9ae16a3b2f90404f;

#[inline]
fn fetch64(s: &[u8], pos: usize) -> u64 {
    u64::from_le_bytes(s[pos..pos + 8].try_into().unwrap())
}

#[inline]
fn fetch32(s: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes(s[pos..pos + 4].try_into().unwrap())
}

#[inline]
fn rotate(val: u64, shift: u32) -> u64 {
    val.rotate_right(shift)
}

#[inline]
fn shift_mix(val: u64) -> u64 {
    val ^ (val >> 47)
}

fn hash_len16(u: u64, v: u64, mul: u64) -> u64 {
    let mut a = (u ^ v).wrapping_mul(mul);
    a ^= a >> 47;
    let mut b = (v ^ a).wrapping_mul(mul);
    b ^= b >> 47;
    b.wrapping_mul(mul)
}

fn hash_len0_to_16(s: &[u8]) -> u64 {
    let len = s.len();
    if len >= 8 {
        let mul = K2.wrapping_add(len as u64 * 2);
        let a = fetch64(s, 0).wrapping_add(K2);
        let b = fetch64(s, len - 8);
        let c = rotate(b, 37).wrapping_mul(mul).wrapping_add(a);
        let d = rotate(a, 25).wrapping_add(b).wrapping_mul(mul);
        return hash_len16(c, d, mul);
    }
    if len >= 4 {
        let mul = K2.wrapping_add(len as u64 * 2);
        let a = fetch32(s, 0) as u64;
        return hash_len16(
            (len as u64).wrapping_add(a << 3),
            fetch32(s, len - 4) as u64,
            mul,
        );
    }
    if len > 0 {
        let a = s[0] as u32;
        let b = s[len >> 1] as u32;
        let c = s[len - 1] as u32;
        let y = a.wrapping_add(b << 8) as u64;
        let z = (len as u32).wrapping_add(c << 2) as u64;
        return shift_mix(y.wrapping_mul(K2) ^ z.wrapping_mul(K0)).wrapping_mul(K2);
    }
    K2
}

fn hash_len17_to_32(s: &[u8]) -> u64 {
    let len = s.len();
    let mul = K2.wrapping_add(len as u64 * 2);
    let a = fetch64(s, 0).wrapping_mul(K1);
    let b = fetch64(s, 8);
    let c = fetch64(s, len - 8).wrapping_mul(mul);
    let d = fetch64(s, len - 16).wrapping_mul(K2);
    hash_len16(
        rotate(a.wrapping_add(b), 43)
            .wrapping_add(rotate(c, 30))
            .wrapping_add(d),
        a.wrapping_add(rotate(b.wrapping_add(K2), 18)).wrapping_add(c),
        mul,
    )
}

fn hash_len33_to_64(s: &[u8]) -> u64 {
    let len = s.len();
    let mul = K2.wrapping_add(len as u64 * 2);
    let a = fetch64(s, 0).wrapping_mul(K2);
    let b = fetch64(s, 8);
    let c = fetch64(s, len - 8).wrapping_mul(mul);
    let d = fetch64(s, len - 16).wrapping_mul(K2);
    let y = rotate(a.wrapping_add(b), 43)
        .wrapping_add(rotate(c, 30))
        .wrapping_add(d);
    let z = hash_len16(
        y,
        a.wrapping_add(rotate(b.wrapping_add(K2), 18)).wrapping_add(c),
        mul,
    );
    let e = fetch64(s, 16).wrapping_mul(mul);
    let f = fetch64(s, 24);
    let g = y.wrapping_add(fetch64(s, len - 32)).wrapping_mul(mul);
    let h = z.wrapping_add(fetch64(s, len - 24)).wrapping_mul(mul);
    hash_len16(
        rotate(e.wrapping_add(f), 43)
            .wrapping_add(rotate(g, 30))
            .wrapping_add(h),
        e.wrapping_add(rotate(f.wrapping_add(a), 18)).wrapping_add(g),
        mul,
    )
}

fn weak_hash_len32_with_seeds_raw(
    w: u64,
    x: u64,
    y: u64,
    z: u64,
    mut a: u64,
    mut b: u64,
) -> (u64, u64) {
    a = a.wrapping_add(w);
    b = rotate(b.wrapping_add(a).wrapping_add(z), 21);
    let c = a;
    a = a.wrapping_add(x).wrapping_add(y);
    b = b.wrapping_add(rotate(a, 44));
    (a.wrapping_add(z), b.wrapping_add(c))
}

fn weak_hash_len32_with_seeds(s: &[u8], pos: usize, a: u64, b: u64) -> (u64, u64) {
    weak_hash_len32_with_seeds_raw(
        fetch64(s, pos),
        fetch64(s, pos + 8),
        fetch64(s, pos + 16),
        fetch64(s, pos + 24),
        a,
        b,
    )
}

/// FarmHash64 over a byte slice.
pub fn farmhash64(s: &[u8]) -> u64 {
    let len = s.len();
    if len <= 32 {
        return if len <= 16 { hash_len0_to_16(s) } else { hash_len17_to_32(s) };
    }
    if len <= 64 {
        return hash_len33_to_64(s);
    }

    // Strings over 64 bytes loop over 64-byte blocks with 56 bytes of
    // internal state: v, w, x, y and z.
    let seed = 81u64;
    let mut x = seed;
    let mut y = seed.wrapping_mul(K1).wrapping_add(113);
    let mut z = shift_mix(y.wrapping_mul(K2).wrapping_add(113)).wrapping_mul(K2);
    let mut v = (0u64, 0u64);
    let mut w = (0u64, 0u64);
    x = x.wrapping_mul(K2).wrapping_add(fetch64(s, 0));

    // Iterate so that 1 to 64 bytes remain for the tail block.
    let end = ((len - 1) / 64) * 64;
    let last64 = len - 64;
    let mut pos = 0usize;
    loop {
        x = rotate(
            x.wrapping_add(y).wrapping_add(v.0).wrapping_add(fetch64(s, pos + 8)),
            37,
        )
        .wrapping_mul(K1);
        y = rotate(y.wrapping_add(v.1).wrapping_add(fetch64(s, pos + 48)), 42).wrapping_mul(K1);
        x ^= w.1;
        y = y.wrapping_add(v.0).wrapping_add(fetch64(s, pos + 40));
        z = rotate(z.wrapping_add(w.0), 33).wrapping_mul(K1);
        v = weak_hash_len32_with_seeds(s, pos, v.1.wrapping_mul(K1), x.wrapping_add(w.0));
        w = weak_hash_len32_with_seeds(
            s,
            pos + 32,
            z.wrapping_add(w.1),
            y.wrapping_add(fetch64(s, pos + 16)),
        );
        std::mem::swap(&mut z, &mut x);
        pos += 64;
        if pos == end {
            break;
        }
    }

    let mul = K1.wrapping_add((z & 0xff) << 1);
    // Point at the last 64 bytes of input.
    let pos = last64;
    w.0 = w.0.wrapping_add(((len - 1) & 63) as u64);
    v.0 = v.0.wrapping_add(w.0);
    w.0 = w.0.wrapping_add(v.0);
    x = rotate(
        x.wrapping_add(y).wrapping_add(v.0).wrapping_add(fetch64(s, pos + 8)),
        37,
    )
    .wrapping_mul(mul);
    y = rotate(y.wrapping_add(v.1).wrapping_add(fetch64(s, pos + 48)), 42).wrapping_mul(mul);
    x ^= w.1.wrapping_mul(9);
    y = y.wrapping_add(v.0.wrapping_mul(9)).wrapping_add(fetch64(s, pos + 40));
    z = rotate(z.wrapping_add(w.0), 33).wrapping_mul(mul);
    v = weak_hash_len32_with_seeds(s, pos, v.1.wrapping_mul(mul), x.wrapping_add(w.0));
    w = weak_hash_len32_with_seeds(
        s,
        pos + 32,
        z.wrapping_add(w.1),
        y.wrapping_add(fetch64(s, pos + 16)),
    );
    std::mem::swap(&mut z, &mut x);
    hash_len16(
        hash_len16(v.0, w.0, mul)
            .wrapping_add(shift_mix(y).wrapping_mul(K0))
            .wrapping_add(z),
        hash_len16(v.1, w.1, mul).wrapping_add(x),
        mul,
    )
}

/// Computes `FarmHash64(bytes) mod num_buckets` per element.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StringToHashBucket {
    num_buckets: i64,
}

impl StringToHashBucket {
    pub fn new(num_buckets: i64) -> Result<Self, OpError> {
        if num_buckets <= 0 {
            return Err(OpError::Config(format!(
                "StringToHashBucket: num_buckets attribute must be positive, got {num_buckets}"
            )));
        }
        Ok(Self { num_buckets })
    }

    pub fn evaluate(&self, input: &StringTensor) -> Result<Vec<i64>, OpError> {
        input.validate("StringToHashBucket")?;
        let buckets = self.num_buckets as u64;
        Ok((0..input.len())
            .into_par_iter()
            .map(|j| (farmhash64(input.element(j)) % buckets) as i64)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_string_is_k2() {
        assert_eq!(farmhash64(b""), K2);
    }

    #[test]
    fn test_length_dispatch_is_stable() {
        // One representative per length class; each must be deterministic
        // and the classes must not collide with each other.
        let lengths = [3usize, 8, 20, 40, 100, 200];
        let hashes: Vec<u64> = lengths.iter().map(|&n| farmhash64(&vec![b'x'; n])).collect();
        for (&n, &h) in lengths.iter().zip(&hashes) {
            assert_eq!(farmhash64(&vec![b'x'; n]), h);
        }
        let mut dedup = hashes.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(dedup.len(), hashes.len());
    }

    #[test]
    fn test_bucket_range() {
        let op = StringToHashBucket::new(17).unwrap();
        let input = StringTensor::from_strings(&["a", "bb", "ccc", "", "long string over here"]);
        let buckets = op.evaluate(&input).unwrap();
        assert_eq!(buckets.len(), 5);
        for &b in &buckets {
            assert!((0..17).contains(&b));
        }
    }

    #[test]
    fn test_bucket_determinism() {
        let op = StringToHashBucket::new(1000).unwrap();
        let input = StringTensor::from_strings(&["stable"]);
        assert_eq!(op.evaluate(&input).unwrap(), op.evaluate(&input).unwrap());
    }

    #[test]
    fn test_rejects_non_positive_buckets() {
        assert!(StringToHashBucket::new(0).is_err());
        assert!(StringToHashBucket::new(-5).is_err());
    }
}
