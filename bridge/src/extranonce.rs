//! Extranonce allocation.
//!
//! The top `size` bytes of the 8-byte nonce are fixed per session, so every
//! live session searches a disjoint slice of the nonce space. Values come from
//! a free list first, then from a high-water mark, so allocation is O(1).

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{BridgeError, Result};

/// Largest supported prefix. Leaves the miner at least four bytes to roll.
pub const MAX_EXTRANONCE_SIZE: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extranonce {
    value: u32,
    size: u8,
}

impl Extranonce {
    /// The empty extranonce used when the nonce space is not partitioned.
    pub const EMPTY: Extranonce = Extranonce { value: 0, size: 0 };

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn size(&self) -> u8 {
        self.size
    }

    /// Nonce bytes left for the miner to roll.
    pub fn bytes_left(&self) -> u8 {
        8 - self.size
    }

    /// Hex string sent in `mining.set_extranonce` (empty when unpartitioned).
    pub fn to_hex(&self) -> String {
        if self.size == 0 {
            return String::new();
        }
        format!("{:0width$x}", self.value, width = self.size as usize * 2)
    }

    fn shift(&self) -> u32 {
        64 - 8 * self.size as u32
    }

    /// Whether a full 64-bit nonce lies inside this partition.
    pub fn owns(&self, nonce: u64) -> bool {
        if self.size == 0 {
            return true;
        }
        (nonce >> self.shift()) == self.value as u64
    }

    /// Build the full nonce from a submitted hex nonce.
    ///
    /// Miners either send all 16 hex digits (prefix included) or only the part
    /// they rolled, in which case the extranonce is prepended.
    pub fn complete_nonce(&self, nonce_hex: &str) -> Result<u64> {
        let rolled_digits = self.bytes_left() as usize * 2;
        let full = match nonce_hex.len() {
            16 => u64::from_str_radix(nonce_hex, 16),
            n if n == rolled_digits && self.size > 0 => {
                u64::from_str_radix(&format!("{}{}", self.to_hex(), nonce_hex), 16)
            }
            n => {
                return Err(BridgeError::protocol(format!(
                    "nonce '{}' has {} hex digits, expected 16 or {}",
                    nonce_hex, n, rolled_digits
                )))
            }
        }
        .map_err(|_| BridgeError::protocol(format!("nonce '{}' is not hex", nonce_hex)))?;

        if !self.owns(full) {
            return Err(BridgeError::protocol(format!(
                "nonce {:016x} outside extranonce partition {}",
                full,
                self.to_hex()
            )));
        }
        Ok(full)
    }
}

#[derive(Debug, Default)]
struct AllocState {
    next: u64,
    free: Vec<u32>,
    live: HashSet<u32>,
}

#[derive(Debug)]
pub struct ExtranonceAllocator {
    size: u8,
    capacity: u64,
    state: Mutex<AllocState>,
}

impl ExtranonceAllocator {
    pub fn new(size: u8) -> Self {
        let size = size.min(MAX_EXTRANONCE_SIZE);
        Self {
            size,
            capacity: 1u64 << (8 * size as u32),
            state: Mutex::new(AllocState::default()),
        }
    }

    pub fn size(&self) -> u8 {
        self.size
    }

    /// Number of distinct partitions (`256^size`).
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn live(&self) -> usize {
        if self.size == 0 {
            return 0;
        }
        self.state.lock().live.len()
    }

    pub fn is_exhausted(&self) -> bool {
        if self.size == 0 {
            return false;
        }
        let state = self.state.lock();
        state.free.is_empty() && state.next >= self.capacity
    }

    pub fn acquire(&self) -> Result<Extranonce> {
        if self.size == 0 {
            return Ok(Extranonce::EMPTY);
        }

        let mut state = self.state.lock();
        let value = match state.free.pop() {
            Some(v) => v,
            None if state.next < self.capacity => {
                let v = state.next as u32;
                state.next += 1;
                v
            }
            None => return Err(BridgeError::CapacityExhausted),
        };
        state.live.insert(value);
        Ok(Extranonce {
            value,
            size: self.size,
        })
    }

    /// Return a partition to the pool. Releasing twice is a no-op.
    pub fn release(&self, extranonce: Extranonce) {
        if self.size == 0 || extranonce.size != self.size {
            return;
        }
        let mut state = self.state.lock();
        if state.live.remove(&extranonce.value) {
            state.free.push(extranonce.value);
        }
    }

    /// Acquire a partition that is released when the lease drops.
    pub fn lease(self: &Arc<Self>) -> Result<ExtranonceLease> {
        let extranonce = self.acquire()?;
        Ok(ExtranonceLease {
            allocator: Arc::clone(self),
            extranonce,
        })
    }
}

/// Owned partition; returned to the allocator on drop.
#[derive(Debug)]
pub struct ExtranonceLease {
    allocator: Arc<ExtranonceAllocator>,
    extranonce: Extranonce,
}

impl ExtranonceLease {
    pub fn extranonce(&self) -> Extranonce {
        self.extranonce
    }
}

impl Drop for ExtranonceLease {
    fn drop(&mut self) {
        self.allocator.release(self.extranonce);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_zero_never_exhausts() {
        let alloc = ExtranonceAllocator::new(0);
        for _ in 0..1000 {
            assert_eq!(alloc.acquire().unwrap(), Extranonce::EMPTY);
        }
        assert!(!alloc.is_exhausted());
        assert_eq!(Extranonce::EMPTY.to_hex(), "");
        assert!(Extranonce::EMPTY.owns(u64::MAX));
    }

    #[test]
    fn one_byte_space_exhausts_at_256() {
        let alloc = ExtranonceAllocator::new(1);
        let mut seen = HashSet::new();
        for _ in 0..256 {
            let en = alloc.acquire().unwrap();
            assert!(seen.insert(en.value()), "duplicate live partition");
        }
        assert!(alloc.is_exhausted());
        assert!(matches!(alloc.acquire(), Err(BridgeError::CapacityExhausted)));

        let victim = Extranonce { value: 17, size: 1 };
        alloc.release(victim);
        assert!(!alloc.is_exhausted());
        assert_eq!(alloc.acquire().unwrap(), victim);
        assert_eq!(alloc.live(), 256);
    }

    #[test]
    fn double_release_does_not_duplicate() {
        let alloc = ExtranonceAllocator::new(1);
        let a = alloc.acquire().unwrap();
        alloc.release(a);
        alloc.release(a);
        let b = alloc.acquire().unwrap();
        let c = alloc.acquire().unwrap();
        assert_ne!(b, c);
    }

    #[test]
    fn lease_releases_on_drop() {
        let alloc = Arc::new(ExtranonceAllocator::new(2));
        {
            let _lease = alloc.lease().unwrap();
            assert_eq!(alloc.live(), 1);
        }
        assert_eq!(alloc.live(), 0);
    }

    #[test]
    fn hex_is_zero_padded() {
        let en = Extranonce { value: 0x0a, size: 2 };
        assert_eq!(en.to_hex(), "000a");
        assert_eq!(en.bytes_left(), 6);
    }

    #[test]
    fn complete_nonce_prepends_or_checks_prefix() {
        let en = Extranonce { value: 0xab, size: 1 };
        assert_eq!(en.complete_nonce("00000000000001").unwrap(), 0xab00_0000_0000_0001);
        assert_eq!(en.complete_nonce("ab00000000000002").unwrap(), 0xab00_0000_0000_0002);
        assert!(en.complete_nonce("ac00000000000002").is_err());
        assert!(en.complete_nonce("123").is_err());
        assert!(en.complete_nonce("zz000000000000").is_err());
    }

    #[test]
    fn unpartitioned_nonce_requires_full_width() {
        assert_eq!(Extranonce::EMPTY.complete_nonce("00000000000000ff").unwrap(), 0xff);
        assert!(Extranonce::EMPTY.complete_nonce("ff").is_err());
    }
}
