pub mod engine;
pub mod pool;

use crate::error::ExecResult;
use crate::exec::fence::Fence;
use crate::exec::objects::CancelToken;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub use engine::{PlacementEngine, PlacementPolicy};

const RESERVE_POLL: Duration = Duration::from_millis(1);

/// Where a buffer lives from the device's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DevicePlacement {
    /// Byte offset inside VRAM; addressed framebuffer-relative.
    FastPool { offset: u64 },
    /// GMR id of a mapped guest memory region.
    AuxPool { slot: u32 },
}

impl DevicePlacement {
    #[must_use]
    pub const fn pool(&self) -> PoolKind {
        match self {
            Self::FastPool { .. } => PoolKind::Vram,
            Self::AuxPool { .. } => PoolKind::Gmr,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Vram,
    Gmr,
}

static NEXT_BO_KEY: AtomicU64 = AtomicU64::new(1);

/// A DMA buffer object.
///
/// Placement is owned by the [`PlacementEngine`]; the object itself carries
/// the reservation lock and the fence of the last submission that used it.
#[derive(Debug)]
pub struct BufferObject {
    key: u64,
    handle: u32,
    size: usize,
    reserved: Mutex<bool>,
    unreserved: Condvar,
    sync_obj: Mutex<Option<Arc<Fence>>>,
}

impl BufferObject {
    #[must_use]
    pub fn new(handle: u32, size: usize) -> Arc<Self> {
        Arc::new(Self {
            key: NEXT_BO_KEY.fetch_add(1, Ordering::Relaxed),
            handle,
            size,
            reserved: Mutex::new(false),
            unreserved: Condvar::new(),
            sync_obj: Mutex::new(None),
        })
    }

    /// Unique for the lifetime of the process; handles may be reused.
    #[must_use]
    pub const fn key(&self) -> u64 {
        self.key
    }

    #[must_use]
    pub const fn handle(&self) -> u32 {
        self.handle
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    fn reserved(&self) -> MutexGuard<'_, bool> {
        self.reserved.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_reserved(&self) -> bool {
        *self.reserved()
    }

    /// Takes the reservation if it is free.
    pub fn try_reserve(&self) -> bool {
        let mut reserved = self.reserved();
        if *reserved {
            return false;
        }
        *reserved = true;
        true
    }

    /// Takes the reservation, sleeping while another holder has it.
    pub fn reserve(&self, cancel: &CancelToken) -> ExecResult<()> {
        let mut reserved = self.reserved();
        while *reserved {
            cancel.check()?;
            reserved = self
                .unreserved
                .wait_timeout(reserved, RESERVE_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *reserved = true;
        Ok(())
    }

    pub fn unreserve(&self) {
        *self.reserved() = false;
        self.unreserved.notify_all();
    }

    fn sync_slot(&self) -> MutexGuard<'_, Option<Arc<Fence>>> {
        self.sync_obj.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fence guarding the device's outstanding access, if any.
    #[must_use]
    pub fn sync_obj(&self) -> Option<Arc<Fence>> {
        self.sync_slot().clone()
    }

    /// Replaces the outstanding-access fence. `None` means idle.
    pub fn fence(&self, fence: Option<Arc<Fence>>) {
        *self.sync_slot() = fence;
    }

    /// Waits until the device no longer accesses this buffer.
    pub fn wait_idle(&self, cancel: &CancelToken, timeout: Duration) -> ExecResult<()> {
        let Some(fence) = self.sync_obj() else {
            return Ok(());
        };
        fence.wait(Some(cancel), timeout)?;

        let mut slot = self.sync_slot();
        if slot.as_ref().is_some_and(|f| Arc::ptr_eq(f, &fence)) {
            *slot = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn reservation_blocks_until_released() {
        let bo = BufferObject::new(1, 4096);
        assert!(bo.try_reserve());
        assert!(!bo.try_reserve());

        let holder = {
            let bo = bo.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                bo.unreserve();
            })
        };
        bo.reserve(&CancelToken::new()).unwrap();
        assert!(bo.is_reserved());
        holder.join().unwrap();
        bo.unreserve();
        assert!(!bo.is_reserved());
    }

    #[test]
    fn contended_reservation_is_interruptible() {
        let bo = BufferObject::new(1, 4096);
        assert!(bo.try_reserve());
        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(
            bo.reserve(&cancel).unwrap_err(),
            crate::error::ExecError::Interrupted
        );
    }

    #[test]
    fn keys_are_unique() {
        let a = BufferObject::new(7, 1);
        let b = BufferObject::new(7, 1);
        assert_ne!(a.key(), b.key());
    }
}
