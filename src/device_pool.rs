//! Exclusive leasing of a fixed set of remote devices.
//!
//! A [`DevicePool`] owns N device handles. [`DevicePool::acquire`] suspends
//! the calling task until a device is free and returns a [`DeviceLease`]
//! that grants exclusive use of it. Dropping the lease (or calling
//! [`DeviceLease::release`]) puts the device back, so a lease is returned
//! exactly once on every path, including early returns and panics.
//!
//! Waiters are served in FIFO order: the permit semaphore underneath is
//! fair, so no waiter can be starved while devices keep being returned.
//!
//! ```text
//!   acquire() ──► [ permits: N ] ──► free list ──► DeviceLease
//!                                       ▲               │
//!                                       └─── drop ──────┘
//! ```

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;

/// Errors returned by the pool.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    /// The pool was drained and accepts no further leases.
    #[error("device pool is closed")]
    Closed,

    #[error("device pool has no devices")]
    Empty,
}

/// A fixed set of devices handed out one lease at a time.
pub struct DevicePool<D> {
    permits: Semaphore,
    free: Mutex<VecDeque<D>>,
    size: usize,
}

impl<D> DevicePool<D> {
    /// Creates a pool holding `devices`. A pool must hold at least one.
    pub fn new(devices: Vec<D>) -> Result<Self, PoolError> {
        if devices.is_empty() {
            return Err(PoolError::Empty);
        }
        let size = devices.len();
        Ok(Self {
            permits: Semaphore::new(size),
            free: Mutex::new(devices.into()),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of leases currently held.
    pub fn outstanding(&self) -> usize {
        self.size - self.free().len()
    }

    /// Waits until a device is free and leases it.
    pub async fn acquire(&self) -> Result<DeviceLease<'_, D>, PoolError> {
        let permit = self.permits.acquire().await.map_err(|_| PoolError::Closed)?;
        // Holding a permit guarantees a free device.
        let device = self.free().pop_front().ok_or(PoolError::Empty)?;
        debug!("Leased device ({} of {} in use)", self.outstanding(), self.size);

        Ok(DeviceLease {
            pool: self,
            device: Some(device),
            _permit: permit,
        })
    }

    /// Waits until every lease has been returned, then closes the pool.
    ///
    /// Later [`acquire`](Self::acquire) calls fail with [`PoolError::Closed`].
    pub async fn drain_and_wait_idle(&self) {
        if let Ok(all) = self.permits.acquire_many(self.size as u32).await {
            self.permits.close();
            drop(all);
        }
        debug!("Device pool drained");
    }

    fn free(&self) -> MutexGuard<'_, VecDeque<D>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive use of one device. Returned to the pool on drop.
pub struct DeviceLease<'a, D> {
    pool: &'a DevicePool<D>,
    device: Option<D>,
    // Dropped after `Drop::drop` has put the device back.
    _permit: SemaphorePermit<'a>,
}

impl<D> DeviceLease<'_, D> {
    /// Returns the device to the pool.
    pub fn release(self) {
        drop(self);
    }
}

impl<D: std::fmt::Debug> std::fmt::Debug for DeviceLease<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLease")
            .field("device", &self.device)
            .finish()
    }
}

impl<D> Deref for DeviceLease<'_, D> {
    type Target = D;

    fn deref(&self) -> &D {
        self.device
            .as_ref()
            .unwrap_or_else(|| unreachable!("device is present until drop"))
    }
}

impl<D> Drop for DeviceLease<'_, D> {
    fn drop(&mut self) {
        if let Some(device) = self.device.take() {
            self.pool.free().push_back(device);
        }
    }
}
