//! Sandbox slot allocation.
//!
//! The isolation tool names each sandbox by a numeric box id. Two submissions
//! must never share a box while either is running, so every submission holds
//! a [`SlotLease`] for all of its runs.
//!
//! - `Pool` hands out ids `0..size` and waits when all are taken.
//! - `Modulo` maps `submission_id mod modulus` to a box id and serializes
//!   submissions that collide on the same id.

use crate::error::{Result, SandboxError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStrategy {
    Pool { size: u32 },
    Modulo { modulus: u64 },
}

enum Inner {
    Pool {
        permits: Arc<Semaphore>,
        free: Arc<Mutex<Vec<u32>>>,
    },
    Modulo {
        modulus: u64,
        locks: Mutex<HashMap<u32, Arc<AsyncMutex<()>>>>,
    },
}

pub struct SlotAllocator {
    inner: Inner,
}

impl SlotAllocator {
    pub fn new(strategy: SlotStrategy) -> Result<Self> {
        let inner = match strategy {
            SlotStrategy::Pool { size } => {
                if size == 0 {
                    return Err(SandboxError::InvalidSlots(
                        "pool size must be at least 1".to_string(),
                    ));
                }
                // Lowest ids are handed out first
                let free: Vec<u32> = (0..size).rev().collect();
                Inner::Pool {
                    permits: Arc::new(Semaphore::new(size as usize)),
                    free: Arc::new(Mutex::new(free)),
                }
            }
            SlotStrategy::Modulo { modulus } => {
                if modulus == 0 || modulus > u64::from(u32::MAX) + 1 {
                    return Err(SandboxError::InvalidSlots(format!(
                        "modulus must be between 1 and 2^32, got {}",
                        modulus
                    )));
                }
                Inner::Modulo {
                    modulus,
                    locks: Mutex::new(HashMap::new()),
                }
            }
        };

        Ok(Self { inner })
    }

    /// Wait for a slot the submission can use exclusively
    pub async fn acquire(&self, submission_id: u64) -> Result<SlotLease> {
        match &self.inner {
            Inner::Pool { permits, free } => {
                let permit = permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| SandboxError::SlotUnavailable(e.to_string()))?;

                let slot = free
                    .lock()
                    .map_err(|_| SandboxError::SlotUnavailable("slot pool poisoned".to_string()))?
                    .pop()
                    .ok_or_else(|| {
                        SandboxError::SlotUnavailable("slot pool out of sync".to_string())
                    })?;

                debug!(submission_id, slot, "Acquired pooled slot");
                Ok(SlotLease {
                    slot,
                    hold: Hold::Pool {
                        free: free.clone(),
                        _permit: permit,
                    },
                })
            }
            Inner::Modulo { modulus, locks } => {
                let slot = (submission_id % modulus) as u32;

                let lock = {
                    let mut locks = locks.lock().map_err(|_| {
                        SandboxError::SlotUnavailable("slot locks poisoned".to_string())
                    })?;
                    // Forget locks nobody holds or waits on
                    locks.retain(|_, lock| Arc::strong_count(lock) > 1);
                    locks
                        .entry(slot)
                        .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                        .clone()
                };

                let guard = lock.lock_owned().await;
                debug!(submission_id, slot, "Acquired modulo slot");
                Ok(SlotLease {
                    slot,
                    hold: Hold::Modulo(guard),
                })
            }
        }
    }
}

enum Hold {
    Pool {
        free: Arc<Mutex<Vec<u32>>>,
        _permit: OwnedSemaphorePermit,
    },
    Modulo(OwnedMutexGuard<()>),
}

/// Exclusive use of one slot id until dropped
pub struct SlotLease {
    slot: u32,
    hold: Hold,
}

impl SlotLease {
    pub fn slot(&self) -> u32 {
        self.slot
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        // The id goes back before the permit is released with the fields
        if let Hold::Pool { free, .. } = &self.hold {
            if let Ok(mut free) = free.lock() {
                free.push(self.slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rejects_empty_pool_and_zero_modulus() {
        assert!(SlotAllocator::new(SlotStrategy::Pool { size: 0 }).is_err());
        assert!(SlotAllocator::new(SlotStrategy::Modulo { modulus: 0 }).is_err());
        assert!(SlotAllocator::new(SlotStrategy::Modulo { modulus: 2_147_483_647 }).is_ok());
    }

    #[tokio::test]
    async fn test_pool_hands_out_distinct_slots() {
        let slots = SlotAllocator::new(SlotStrategy::Pool { size: 3 }).unwrap();

        let a = slots.acquire(10).await.unwrap();
        let b = slots.acquire(10).await.unwrap();
        let c = slots.acquire(11).await.unwrap();

        let mut ids = vec![a.slot(), b.slot(), c.slot()];
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_pool_waits_when_exhausted() {
        let slots = SlotAllocator::new(SlotStrategy::Pool { size: 1 }).unwrap();
        let first = slots.acquire(1).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), slots.acquire(2)).await;
        assert!(blocked.is_err(), "second acquire should wait for a free slot");

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(1), slots.acquire(2))
            .await
            .expect("slot should be free after the lease is dropped")
            .unwrap();
        assert_eq!(second.slot(), 0);
    }

    #[tokio::test]
    async fn test_modulo_maps_submission_ids() {
        let slots = SlotAllocator::new(SlotStrategy::Modulo { modulus: 2_147_483_647 }).unwrap();
        let lease = slots.acquire(2_147_483_647 + 5).await.unwrap();
        assert_eq!(lease.slot(), 5);
    }

    #[tokio::test]
    async fn test_modulo_serializes_colliding_submissions() {
        let slots = SlotAllocator::new(SlotStrategy::Modulo { modulus: 10 }).unwrap();
        let first = slots.acquire(3).await.unwrap();

        // 13 collides with 3
        let blocked = tokio::time::timeout(Duration::from_millis(50), slots.acquire(13)).await;
        assert!(blocked.is_err());

        // 4 does not
        let other = slots.acquire(4).await.unwrap();
        assert_eq!(other.slot(), 4);

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(1), slots.acquire(13))
            .await
            .expect("collision should clear once the first lease is dropped")
            .unwrap();
        assert_eq!(second.slot(), 3);
    }
}
