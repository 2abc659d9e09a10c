// vsock Context ID Allocation
//
// Same discipline as the IP pool, over an integer range. CIDs 0-2 are
// reserved by vsock (hypervisor, loopback, host), so the range floor is 3.

use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::sync::Mutex;

/// Lowest CID that may be assigned to a guest.
pub const CID_RANGE_LOW: u32 = 3;
/// Default upper bound of the CID range, inclusive.
pub const CID_RANGE_HIGH: u32 = 1000;

/// Allocator over an inclusive CID range.
pub struct CidPool {
    low: u32,
    high: u32,
    allocated: Mutex<BTreeSet<u32>>,
}

impl CidPool {
    pub fn new(low: u32, high: u32) -> Result<Self> {
        if low < CID_RANGE_LOW {
            return Err(Error::InvalidConfig(format!(
                "CID range may not start below {CID_RANGE_LOW} (got {low})"
            )));
        }
        if low > high {
            return Err(Error::InvalidConfig(format!(
                "CID range is empty: [{low}, {high}]"
            )));
        }
        Ok(Self {
            low,
            high,
            allocated: Mutex::new(BTreeSet::new()),
        })
    }

    /// Allocate the lowest free CID in the range.
    pub fn allocate(&self) -> Result<u32> {
        let mut allocated = self.allocated.lock().unwrap();
        for cid in self.low..=self.high {
            if !allocated.contains(&cid) {
                allocated.insert(cid);
                return Ok(cid);
            }
        }
        Err(Error::Exhausted("CID"))
    }

    /// Return a CID to the pool.
    pub fn free(&self, cid: u32) -> Result<()> {
        let mut allocated = self.allocated.lock().unwrap();
        if !allocated.remove(&cid) {
            return Err(Error::NotAllocated(format!("CID {cid}")));
        }
        Ok(())
    }

    pub fn in_use(&self) -> usize {
        self.allocated.lock().unwrap().len()
    }
}

impl Default for CidPool {
    fn default() -> Self {
        Self::new(CID_RANGE_LOW, CID_RANGE_HIGH).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_allocation_starts_at_the_range_floor() {
        let pool = CidPool::new(3, 10).unwrap();
        assert_eq!(pool.allocate().unwrap(), 3);
        assert_eq!(pool.allocate().unwrap(), 4);
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let pool = CidPool::new(3, 5).unwrap();
        assert_eq!(pool.allocate().unwrap(), 3);
        assert_eq!(pool.allocate().unwrap(), 4);
        assert_eq!(pool.allocate().unwrap(), 5);
        assert!(matches!(pool.allocate(), Err(Error::Exhausted(_))));

        pool.free(4).unwrap();
        assert_eq!(pool.allocate().unwrap(), 4);
    }

    #[test]
    fn test_free_of_unallocated_cid_is_an_error() {
        let pool = CidPool::new(3, 5).unwrap();
        assert!(matches!(pool.free(3), Err(Error::NotAllocated(_))));
    }

    #[test]
    fn test_reserved_and_inverted_ranges_are_rejected() {
        assert!(CidPool::new(0, 10).is_err());
        assert!(CidPool::new(2, 10).is_err());
        assert!(CidPool::new(10, 3).is_err());
    }

    #[test]
    fn test_default_range() {
        let pool = CidPool::default();
        assert_eq!(pool.allocate().unwrap(), CID_RANGE_LOW);
    }

    proptest! {
        // Never more than high-low+1 outstanding CIDs; all unique, in bounds.
        #[test]
        fn prop_bounded_unique_allocations(extra in 0usize..20) {
            let pool = CidPool::new(3, 10).unwrap();
            let capacity = 8;
            let mut seen = BTreeSet::new();

            for _ in 0..capacity + extra {
                match pool.allocate() {
                    Ok(cid) => {
                        prop_assert!((3..=10).contains(&cid));
                        prop_assert!(seen.insert(cid));
                    }
                    Err(Error::Exhausted(_)) => {
                        prop_assert_eq!(seen.len(), capacity)
                    }
                    Err(other) => return Err(TestCaseError::fail(other.to_string())),
                }
            }
            prop_assert!(pool.in_use() <= capacity);
        }
    }
}
