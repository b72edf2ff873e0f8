//! Device memory accounting for the software backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::{BackendError, BackendResult};

/// Tracks bytes held by live resources against an optional limit.
#[derive(Debug)]
pub(crate) struct MemoryBudget {
    limit: Option<u64>,
    used: AtomicU64,
}

impl MemoryBudget {
    pub fn unlimited() -> Arc<Self> {
        Arc::new(Self {
            limit: None,
            used: AtomicU64::new(0),
        })
    }

    pub fn limited(bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            limit: Some(bytes),
            used: AtomicU64::new(0),
        })
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Claim `bytes`; the claim is returned when the reservation drops.
    pub fn reserve(self: &Arc<Self>, bytes: u64) -> BackendResult<Reservation> {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = current.checked_add(bytes).ok_or(BackendError::OutOfMemory)?;
            if self.limit.is_some_and(|limit| next > limit) {
                log::warn!(
                    "SoftwareBackend: allocation of {} bytes exceeds budget ({} of {:?} in use)",
                    bytes,
                    current,
                    self.limit
                );
                return Err(BackendError::OutOfMemory);
            }
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(Reservation {
                        budget: Arc::clone(self),
                        bytes,
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct Reservation {
    budget: Arc<MemoryBudget>,
    bytes: u64,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.budget.used.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_are_returned_on_drop() {
        let budget = MemoryBudget::limited(100);
        let a = budget.reserve(60).unwrap();
        assert!(matches!(budget.reserve(50), Err(BackendError::OutOfMemory)));
        drop(a);
        assert_eq!(budget.used(), 0);
        let _b = budget.reserve(100).unwrap();
        assert_eq!(budget.used(), 100);
    }

    #[test]
    fn unlimited_budget_never_fails() {
        let budget = MemoryBudget::unlimited();
        let _big = budget.reserve(u64::MAX / 2).unwrap();
        assert!(budget.reserve(1024).is_ok());
    }
}
