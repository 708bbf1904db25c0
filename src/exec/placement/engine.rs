use super::pool::{GmrPool, PoolAllocator, VramPool};
use super::{BufferObject, DevicePlacement, PoolKind};
use crate::error::{ExecError, ExecResult};
use crate::exec::config::DeviceConfig;
use crate::exec::fence::Fence;
use crate::exec::objects::CancelToken;
use crate::utils::pages;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Which pools a validation may place a buffer in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementPolicy {
    VramOrGmr,
    VramOnly,
}

#[derive(Debug)]
struct Resident {
    bo: Weak<BufferObject>,
    placement: DevicePlacement,
    pages: u64,
    lru: u64,
    /// Last submission that used the placement. Outlives the buffer object,
    /// so a dropped buffer's pages stay taken until the device is done.
    fence: Option<Arc<Fence>>,
}

impl Resident {
    fn is_idle(&self) -> bool {
        self.fence.as_ref().is_none_or(|fence| fence.signaled())
    }
}

/// Owns the device pools and the placement of every resident buffer.
///
/// Buffers not listed here live in system memory.
#[derive(Debug)]
pub struct PlacementEngine {
    vram: VramPool,
    gmr: Option<GmrPool>,
    residents: HashMap<u64, Resident>,
    lru_clock: u64,
    fence_timeout: Duration,
}

impl PlacementEngine {
    #[must_use]
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            vram: VramPool::new(config.vram_pages()),
            gmr: config.has_gmr().then(|| GmrPool::new(config.max_gmr_ids)),
            residents: HashMap::new(),
            lru_clock: 0,
            fence_timeout: config.fence_wait_timeout,
        }
    }

    #[must_use]
    pub fn placement_of(&self, bo: &BufferObject) -> Option<DevicePlacement> {
        self.residents.get(&bo.key()).map(|r| r.placement)
    }

    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.residents.len()
    }

    /// Free capacity of a pool: pages for VRAM, ids for GMR.
    #[must_use]
    pub fn free_pages(&self, pool: PoolKind) -> u64 {
        match pool {
            PoolKind::Vram => self.vram.free_pages(),
            PoolKind::Gmr => self.gmr.as_ref().map_or(0, PoolAllocator::free_pages),
        }
    }

    /// Gives `bo` a device placement.
    ///
    /// VRAM or GMR is tried first, evicting GMR occupants if needed; any
    /// failure other than an interrupt falls back to VRAM only, evicting VRAM
    /// occupants.
    pub fn validate(
        &mut self,
        bo: &Arc<BufferObject>,
        cancel: &CancelToken,
    ) -> ExecResult<DevicePlacement> {
        self.reap();

        let placement = match self.place(bo, PlacementPolicy::VramOrGmr, cancel) {
            Ok(placement) => placement,
            Err(ExecError::Interrupted) => return Err(ExecError::Interrupted),
            Err(e) => {
                debug!(handle = bo.handle(), "VRAM or GMR placement failed: {e}");
                match self.place(bo, PlacementPolicy::VramOnly, cancel) {
                    Ok(placement) => placement,
                    Err(ExecError::Interrupted) => return Err(ExecError::Interrupted),
                    Err(_) => return Err(ExecError::OutOfMemory),
                }
            }
        };

        self.lru_clock += 1;
        if let Some(resident) = self.residents.get_mut(&bo.key()) {
            resident.lru = self.lru_clock;
        }
        Ok(placement)
    }

    /// Records the fence guarding the device's access to `bo`'s placement.
    /// Does nothing for buffers in system memory.
    pub fn fence(&mut self, bo: &BufferObject, fence: Option<Arc<Fence>>) {
        if let Some(resident) = self.residents.get_mut(&bo.key()) {
            resident.fence = fence;
        }
    }

    /// Moves `bo` back to system memory once the device is done with it.
    pub fn release(&mut self, bo: &BufferObject, cancel: &CancelToken) -> ExecResult<()> {
        if self.residents.contains_key(&bo.key()) {
            bo.wait_idle(cancel, self.fence_timeout)?;
            self.drop_resident(bo.key());
        }
        Ok(())
    }

    fn place(
        &mut self,
        bo: &Arc<BufferObject>,
        policy: PlacementPolicy,
        cancel: &CancelToken,
    ) -> ExecResult<DevicePlacement> {
        let key = bo.key();
        let pages = pages(bo.size());

        // Resident buffers are never moved; the first pass accepts any pool.
        if let Some(resident) = self.residents.get(&key) {
            return Ok(resident.placement);
        }

        let placement = match self.alloc(pages, policy) {
            Some(placement) => placement,
            None => self.evict_for(key, pages, policy, cancel)?,
        };

        trace!(handle = bo.handle(), ?placement, ?policy, "buffer placed");
        self.residents.insert(
            key,
            Resident {
                bo: Arc::downgrade(bo),
                placement,
                pages,
                lru: self.lru_clock,
                fence: None,
            },
        );
        Ok(placement)
    }

    fn alloc(&mut self, pages: u64, policy: PlacementPolicy) -> Option<DevicePlacement> {
        if let Some(placement) = self.vram.alloc(pages) {
            return Some(placement);
        }
        match policy {
            PlacementPolicy::VramOrGmr => self.gmr.as_mut()?.alloc(pages),
            PlacementPolicy::VramOnly => None,
        }
    }

    /// Evicts least recently used occupants of the pool `policy` evicts from
    /// until `pages` fit. Reserved buffers are never touched.
    fn evict_for(
        &mut self,
        key: u64,
        pages: u64,
        policy: PlacementPolicy,
        cancel: &CancelToken,
    ) -> ExecResult<DevicePlacement> {
        let pool = match policy {
            PlacementPolicy::VramOrGmr if self.gmr.is_some() => PoolKind::Gmr,
            PlacementPolicy::VramOrGmr => return Err(ExecError::OutOfMemory),
            PlacementPolicy::VramOnly => PoolKind::Vram,
        };

        let mut victims: Vec<(u64, u64)> = self
            .residents
            .iter()
            .filter(|(k, r)| **k != key && r.placement.pool() == pool)
            .map(|(k, r)| (*k, r.lru))
            .collect();
        victims.sort_unstable_by_key(|&(_, lru)| lru);

        for (victim_key, _) in victims {
            let Some(resident) = self.residents.get(&victim_key) else {
                continue;
            };
            let Some(victim) = resident.bo.upgrade() else {
                // Nothing can reserve a dropped buffer; only its last fence
                // still holds the pages.
                if let Some(fence) = resident.fence.clone() {
                    match fence.wait(Some(cancel), self.fence_timeout) {
                        Ok(()) => {}
                        Err(ExecError::Interrupted) => return Err(ExecError::Interrupted),
                        Err(e) => {
                            warn!(seqno = fence.seqno(), "eviction skips busy dropped buffer: {e}");
                            continue;
                        }
                    }
                }
                self.drop_resident(victim_key);
                if let Some(placement) = self.alloc(pages, policy) {
                    return Ok(placement);
                }
                continue;
            };

            if !victim.try_reserve() {
                trace!(handle = victim.handle(), "eviction skips reserved buffer");
                continue;
            }
            match victim.wait_idle(cancel, self.fence_timeout) {
                Ok(()) => {}
                Err(ExecError::Interrupted) => {
                    victim.unreserve();
                    return Err(ExecError::Interrupted);
                }
                Err(e) => {
                    victim.unreserve();
                    warn!(handle = victim.handle(), "eviction skips busy buffer: {e}");
                    continue;
                }
            }
            self.drop_resident(victim_key);
            victim.unreserve();
            debug!(handle = victim.handle(), ?pool, "evicted to system memory");

            if let Some(placement) = self.alloc(pages, policy) {
                return Ok(placement);
            }
        }
        Err(ExecError::OutOfMemory)
    }

    fn drop_resident(&mut self, key: u64) {
        let Some(resident) = self.residents.remove(&key) else {
            return;
        };
        match resident.placement.pool() {
            PoolKind::Vram => self.vram.free(resident.placement, resident.pages),
            PoolKind::Gmr => {
                if let Some(gmr) = self.gmr.as_mut() {
                    gmr.free(resident.placement, resident.pages);
                }
            }
        }
    }

    /// Returns the placements of buffers whose last reference is gone and
    /// whose last fence has passed.
    fn reap(&mut self) {
        let dead: Vec<u64> = self
            .residents
            .iter()
            .filter(|(_, r)| r.bo.strong_count() == 0 && r.is_idle())
            .map(|(k, _)| *k)
            .collect();
        for key in dead {
            self.drop_resident(key);
        }
    }
}
