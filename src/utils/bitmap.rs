//! Set of distinct replica IDs backed by a fixed-size bitset, used for
//! quorum counting where a repeated reply must not count twice.

use std::fmt;

use crate::utils::PaxosLogError;

use fixedbitset::FixedBitSet;

/// Compact `ReplicaId -> bool` map over IDs `0..size`.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap(FixedBitSet);

impl Bitmap {
    /// Creates a bitmap over `size` IDs, all set if `ones` is true.
    pub fn new(size: u8, ones: bool) -> Self {
        let mut bitset = FixedBitSet::with_capacity(size as usize);
        if ones {
            bitset.insert_range(..);
        }
        Bitmap(bitset)
    }

    fn check(&self, idx: u8) -> Result<usize, PaxosLogError> {
        let idx = idx as usize;
        if idx < self.0.len() {
            Ok(idx)
        } else {
            Err(PaxosLogError::msg(format!(
                "ID {} out of bitmap range {}",
                idx,
                self.0.len()
            )))
        }
    }

    /// Sets the flag of ID `idx`.
    #[inline]
    pub fn set(&mut self, idx: u8, flag: bool) -> Result<(), PaxosLogError> {
        let idx = self.check(idx)?;
        self.0.set(idx, flag);
        Ok(())
    }

    /// Gets the flag of ID `idx`.
    #[inline]
    pub fn get(&self, idx: u8) -> Result<bool, PaxosLogError> {
        let idx = self.check(idx)?;
        Ok(self.0.contains(idx))
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Number of IDs set.
    #[inline]
    pub fn count(&self) -> u8 {
        self.0.count_ones(..) as u8
    }
}

// IDs set, e.g. `{3; [0, 2]}` for a 3-wide map.
impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ids: Vec<String> = self.0.ones().map(|i| i.to_string()).collect();
        write!(f, "{{{}; [{}]}}", self.0.len(), ids.join(", "))
    }
}
