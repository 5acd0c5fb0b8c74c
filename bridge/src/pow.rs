//! Proof-of-work hashing.
//!
//! The bridge never mines; it only re-derives the PoW value of a submitted
//! nonce. [`PowHasher`] is the seam share validation goes through;
//! [`HeavyHasher`] is the network's kHeavyHash pipeline:
//!
//! ```text
//! pre_pow_hash = Blake2b-256(key = "BlockHash", header with timestamp = nonce = 0)
//! pow_hash     = cSHAKE256("ProofOfWorkHash", pre_pow_hash || timestamp || 0^32 || nonce)
//! pow_value    = cSHAKE256("HeavyHash", matrix(pre_pow_hash) * nibbles(pow_hash) ^ pow_hash)
//! ```
//!
//! Integers are little-endian throughout; the final digest is read as a
//! little-endian 256-bit value.

use blake2::digest::consts::U32;
use blake2::digest::{ExtendableOutput, Mac, Update, XofReader};
use blake2::Blake2bMac;
use parking_lot::Mutex;
use sha3::{CShake256, CShake256Core};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::blockchain::block::{HeaderError, RpcBlockHeader};
use crate::difficulty::Target;

const BLOCK_HASH_KEY: &[u8] = b"BlockHash";
const POW_HASH_DOMAIN: &[u8] = b"ProofOfWorkHash";
const HEAVY_HASH_DOMAIN: &[u8] = b"HeavyHash";

/// Matrices kept warm; one per live template is plenty.
const MATRIX_CACHE: usize = 16;

pub trait PowHasher: Send + Sync {
    /// Hash of the header with timestamp and nonce zeroed. Computed once per template.
    fn pre_pow_hash(&self, header: &RpcBlockHeader) -> Result<[u8; 32], HeaderError>;

    /// PoW value for a nonce, compared against targets as a 256-bit integer.
    fn pow_value(&self, pre_pow_hash: &[u8; 32], timestamp: u64, nonce: u64) -> Target;
}

/// Keyed Blake2b-256 over the header serialization, the node's block-hash domain.
pub fn block_hash(bytes: &[u8]) -> [u8; 32] {
    // Key length is fixed and below the 64-byte limit.
    let mut mac = match Blake2bMac::<U32>::new_with_salt_and_personal(BLOCK_HASH_KEY, &[], &[]) {
        Ok(mac) => mac,
        Err(_) => unreachable!("BlockHash key fits Blake2b"),
    };
    Mac::update(&mut mac, bytes);
    mac.finalize().into_bytes().into()
}

fn cshake256(domain: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = CShake256::from_core(CShake256Core::new(domain));
    for part in parts {
        Update::update(&mut hasher, part);
    }
    let mut out = [0u8; 32];
    hasher.finalize_xof().read(&mut out);
    out
}

/// xoshiro256++ seeded with the pre-PoW hash words.
struct XoShiRo256PlusPlus {
    s: [u64; 4],
}

impl XoShiRo256PlusPlus {
    fn new(seed: &[u8; 32]) -> Self {
        Self {
            s: pre_pow_words(seed),
        }
    }

    fn next_u64(&mut self) -> u64 {
        let [s0, s1, s2, s3] = &mut self.s;
        let result = s0.wrapping_add(*s3).rotate_left(23).wrapping_add(*s0);
        let t = *s1 << 17;
        *s2 ^= *s0;
        *s3 ^= *s1;
        *s1 ^= *s2;
        *s0 ^= *s3;
        *s2 ^= t;
        *s3 = s3.rotate_left(45);
        result
    }
}

/// 64x64 matrix of 4-bit entries derived from a pre-PoW hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeavyMatrix([[u16; 64]; 64]);

impl HeavyMatrix {
    /// Draw matrices from the seeded generator until one has full rank.
    pub fn generate(pre_pow_hash: &[u8; 32]) -> Self {
        let mut rng = XoShiRo256PlusPlus::new(pre_pow_hash);
        loop {
            let matrix = Self::draw(&mut rng);
            if matrix.rank() == 64 {
                return matrix;
            }
        }
    }

    fn draw(rng: &mut XoShiRo256PlusPlus) -> Self {
        let mut rows = [[0u16; 64]; 64];
        for row in rows.iter_mut() {
            let mut word = 0u64;
            for (j, cell) in row.iter_mut().enumerate() {
                let shift = j % 16;
                if shift == 0 {
                    word = rng.next_u64();
                }
                *cell = ((word >> (4 * shift)) & 0x0f) as u16;
            }
        }
        Self(rows)
    }

    /// Rank by Gaussian elimination over the reals.
    pub fn rank(&self) -> usize {
        const EPS: f64 = 1e-9;
        let mut m = [[0f64; 64]; 64];
        for (dst, src) in m.iter_mut().zip(self.0.iter()) {
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                *d = f64::from(*s);
            }
        }

        let mut rank = 0;
        let mut selected = [false; 64];
        for col in 0..64 {
            let Some(pivot) = (0..64).find(|&r| !selected[r] && m[r][col].abs() > EPS) else {
                continue;
            };
            rank += 1;
            selected[pivot] = true;
            for p in (col + 1)..64 {
                m[pivot][p] /= m[pivot][col];
            }
            for r in 0..64 {
                if r != pivot && m[r][col].abs() > EPS {
                    let factor = m[r][col];
                    for p in (col + 1)..64 {
                        m[r][p] -= m[pivot][p] * factor;
                    }
                }
            }
        }
        rank
    }

    /// Matrix-vector product over the nibbles of `hash`, folded back into 32 bytes
    /// and mixed with `hash`, then finalized in the HeavyHash domain.
    pub fn heavy_hash(&self, hash: &[u8; 32]) -> [u8; 32] {
        let mut nibbles = [0u16; 64];
        for (i, byte) in hash.iter().enumerate() {
            nibbles[2 * i] = u16::from(byte >> 4);
            nibbles[2 * i + 1] = u16::from(byte & 0x0f);
        }

        let dot = |row: &[u16; 64]| -> u16 {
            row.iter().zip(nibbles.iter()).map(|(a, b)| a * b).sum()
        };

        let mut product = [0u8; 32];
        for (i, out) in product.iter_mut().enumerate() {
            let hi = dot(&self.0[2 * i]) >> 10;
            let lo = dot(&self.0[2 * i + 1]) >> 10;
            *out = ((hi << 4) | lo) as u8 ^ hash[i];
        }
        cshake256(HEAVY_HASH_DOMAIN, &[&product])
    }
}

/// kHeavyHash hasher with a small per-template matrix cache.
#[derive(Default)]
pub struct HeavyHasher {
    matrices: Mutex<VecDeque<([u8; 32], Arc<HeavyMatrix>)>>,
}

impl HeavyHasher {
    pub fn new() -> Self {
        Self::default()
    }

    fn matrix(&self, pre_pow_hash: &[u8; 32]) -> Arc<HeavyMatrix> {
        if let Some((_, m)) = self.matrices.lock().iter().find(|(k, _)| k == pre_pow_hash) {
            return Arc::clone(m);
        }

        // Generated outside the lock; a racing insert of the same key is harmless.
        let matrix = Arc::new(HeavyMatrix::generate(pre_pow_hash));
        let mut cache = self.matrices.lock();
        cache.push_back((*pre_pow_hash, Arc::clone(&matrix)));
        while cache.len() > MATRIX_CACHE {
            cache.pop_front();
        }
        matrix
    }
}

impl PowHasher for HeavyHasher {
    fn pre_pow_hash(&self, header: &RpcBlockHeader) -> Result<[u8; 32], HeaderError> {
        Ok(block_hash(&header.hashing_bytes(0, 0)?))
    }

    fn pow_value(&self, pre_pow_hash: &[u8; 32], timestamp: u64, nonce: u64) -> Target {
        let pow_hash = cshake256(
            POW_HASH_DOMAIN,
            &[
                pre_pow_hash,
                &timestamp.to_le_bytes(),
                &[0u8; 32],
                &nonce.to_le_bytes(),
            ],
        );
        let digest = self.matrix(pre_pow_hash).heavy_hash(&pow_hash);
        Target::from_le_bytes(&digest)
    }
}

/// Split a pre-PoW hash into the four little-endian words sent in `mining.notify`.
pub fn pre_pow_words(pre_pow_hash: &[u8; 32]) -> [u64; 4] {
    let mut words = [0u64; 4];
    for (i, chunk) in pre_pow_hash.chunks_exact(8).enumerate() {
        let mut w = [0u8; 8];
        w.copy_from_slice(chunk);
        words[i] = u64::from_le_bytes(w);
    }
    words
}

/// Hex job encoding: pre-PoW hash followed by the little-endian timestamp.
pub fn header_hex(pre_pow_hash: &[u8; 32], timestamp: u64) -> String {
    let mut bytes = Vec::with_capacity(40);
    bytes.extend_from_slice(pre_pow_hash);
    bytes.extend_from_slice(&timestamp.to_le_bytes());
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::block::tests::sample_header;
    use crate::difficulty::Difficulty;
    use blake2::{Blake2b, Digest};

    #[test]
    fn pre_pow_hash_ignores_timestamp_and_nonce() {
        let hasher = HeavyHasher::new();
        let mut header = sample_header(0x1e7fffff);
        let a = hasher.pre_pow_hash(&header).unwrap();
        header.timestamp += 1000;
        header.nonce = 12345;
        assert_eq!(hasher.pre_pow_hash(&header).unwrap(), a);

        header.daa_score += 1;
        assert_ne!(hasher.pre_pow_hash(&header).unwrap(), a);
    }

    #[test]
    fn block_hash_is_keyed() {
        let bytes = sample_header(0x1e7fffff).hashing_bytes(0, 0).unwrap();
        let unkeyed: [u8; 32] = Blake2b::<U32>::digest(&bytes).into();
        assert_ne!(block_hash(&bytes), unkeyed);
        assert_eq!(block_hash(&bytes), block_hash(&bytes));
    }

    #[test]
    fn domains_separate_cshake_outputs() {
        let input = [9u8; 32];
        assert_ne!(
            cshake256(POW_HASH_DOMAIN, &[&input]),
            cshake256(HEAVY_HASH_DOMAIN, &[&input])
        );
        // Chunked input hashes like the concatenation.
        assert_eq!(
            cshake256(POW_HASH_DOMAIN, &[&input[..5], &input[5..]]),
            cshake256(POW_HASH_DOMAIN, &[&input])
        );
    }

    #[test]
    fn generated_matrix_has_full_rank_and_nibble_entries() {
        let m = HeavyMatrix::generate(&[3u8; 32]);
        assert_eq!(m.rank(), 64);
        assert!(m.0.iter().flatten().all(|v| *v < 16));
        assert_eq!(m, HeavyMatrix::generate(&[3u8; 32]));
        assert_ne!(m, HeavyMatrix::generate(&[4u8; 32]));
    }

    #[test]
    fn rank_detects_dependent_rows() {
        let mut rows = [[0u16; 64]; 64];
        for (i, row) in rows.iter_mut().enumerate() {
            row[i] = 1;
        }
        rows[63] = rows[0];
        assert_eq!(HeavyMatrix(rows).rank(), 63);
    }

    #[test]
    fn heavy_hash_is_deterministic_and_input_sensitive() {
        let m = HeavyMatrix::generate(&[5u8; 32]);
        let h = [0xa5u8; 32];
        assert_eq!(m.heavy_hash(&h), m.heavy_hash(&h));
        assert_ne!(m.heavy_hash(&h), m.heavy_hash(&[0x5au8; 32]));
    }

    #[test]
    fn pow_value_is_deterministic_and_nonce_sensitive() {
        let hasher = HeavyHasher::new();
        let pre = [7u8; 32];
        assert_eq!(hasher.pow_value(&pre, 1, 2), hasher.pow_value(&pre, 1, 2));
        assert_ne!(hasher.pow_value(&pre, 1, 2), hasher.pow_value(&pre, 1, 3));
        assert_ne!(hasher.pow_value(&pre, 1, 2), hasher.pow_value(&pre, 2, 2));
    }

    #[test]
    fn matrix_cache_is_bounded() {
        let hasher = HeavyHasher::new();
        for seed in 0..(MATRIX_CACHE as u8 + 4) {
            hasher.pow_value(&[seed; 32], 0, 0);
        }
        assert_eq!(hasher.matrices.lock().len(), MATRIX_CACHE);
    }

    #[test]
    fn low_difficulty_nonces_are_common() {
        // Difficulty 1 accepts everything; difficulty 4 should accept roughly a quarter.
        let hasher = HeavyHasher::new();
        let pre = [1u8; 32];
        let target = Difficulty::new(4).to_target();
        let hits = (0..400u64)
            .filter(|n| target.is_met_by(&hasher.pow_value(&pre, 0, *n)))
            .count();
        assert!(hits > 50 && hits < 150, "hits = {}", hits);
    }

    #[test]
    fn words_are_little_endian_chunks() {
        let mut pre = [0u8; 32];
        pre[0] = 1;
        pre[8] = 2;
        pre[31] = 0x80;
        assert_eq!(pre_pow_words(&pre), [1, 2, 0, 0x8000_0000_0000_0000]);
    }

    #[test]
    fn header_hex_appends_timestamp() {
        let hex = header_hex(&[0u8; 32], 1);
        assert_eq!(hex.len(), 80);
        assert!(hex.ends_with("0100000000000000"));
    }
}
