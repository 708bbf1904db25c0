use super::{DevicePlacement, PoolKind};
use crate::utils::PAGE_SIZE;
use std::collections::{BTreeMap, BTreeSet};
use tracing::error;

/// A device memory pool that hands out placements in whole pages.
pub trait PoolAllocator {
    fn kind(&self) -> PoolKind;

    /// Reserves room for `pages` pages.
    fn alloc(&mut self, pages: u64) -> Option<DevicePlacement>;

    /// Returns a placement obtained from [`PoolAllocator::alloc`].
    fn free(&mut self, placement: DevicePlacement, pages: u64);

    fn free_pages(&self) -> u64;
}

/// Page-granular first-fit range allocator over VRAM.
#[derive(Debug)]
pub struct VramPool {
    total_pages: u64,
    used_pages: u64,
    // Occupied ranges: first page -> page count.
    ranges: BTreeMap<u64, u64>,
}

impl VramPool {
    #[must_use]
    pub const fn new(total_pages: u64) -> Self {
        Self {
            total_pages,
            used_pages: 0,
            ranges: BTreeMap::new(),
        }
    }

    fn find_hole(&self, pages: u64) -> Option<u64> {
        let mut candidate = 0;
        for (&start, &len) in &self.ranges {
            if start >= candidate && start - candidate >= pages {
                return Some(candidate);
            }
            candidate = start + len;
        }
        (candidate + pages <= self.total_pages).then_some(candidate)
    }
}

impl PoolAllocator for VramPool {
    fn kind(&self) -> PoolKind {
        PoolKind::Vram
    }

    fn alloc(&mut self, pages: u64) -> Option<DevicePlacement> {
        if pages == 0 || pages > self.total_pages - self.used_pages {
            return None;
        }
        let start = self.find_hole(pages)?;
        self.ranges.insert(start, pages);
        self.used_pages += pages;
        Some(DevicePlacement::FastPool {
            offset: start * PAGE_SIZE as u64,
        })
    }

    fn free(&mut self, placement: DevicePlacement, pages: u64) {
        let DevicePlacement::FastPool { offset } = placement else {
            error!(?placement, "freeing a non-VRAM placement from the VRAM pool");
            return;
        };
        let start = offset / PAGE_SIZE as u64;
        match self.ranges.remove(&start) {
            Some(len) => {
                debug_assert_eq!(len, pages);
                self.used_pages -= len;
            }
            None => error!(offset, "freeing untracked VRAM range"),
        }
    }

    fn free_pages(&self) -> u64 {
        self.total_pages - self.used_pages
    }
}

/// GMR id allocator. Each buffer takes one id regardless of its size.
#[derive(Debug)]
pub struct GmrPool {
    max_ids: u32,
    used: BTreeSet<u32>,
}

impl GmrPool {
    #[must_use]
    pub const fn new(max_ids: u32) -> Self {
        Self {
            max_ids,
            used: BTreeSet::new(),
        }
    }
}

impl PoolAllocator for GmrPool {
    fn kind(&self) -> PoolKind {
        PoolKind::Gmr
    }

    fn alloc(&mut self, _pages: u64) -> Option<DevicePlacement> {
        let slot = (0..self.max_ids).find(|id| !self.used.contains(id))?;
        self.used.insert(slot);
        Some(DevicePlacement::AuxPool { slot })
    }

    fn free(&mut self, placement: DevicePlacement, _pages: u64) {
        let DevicePlacement::AuxPool { slot } = placement else {
            error!(?placement, "freeing a non-GMR placement from the GMR pool");
            return;
        };
        if !self.used.remove(&slot) {
            error!(slot, "freeing unused GMR id");
        }
    }

    fn free_pages(&self) -> u64 {
        u64::from(self.max_ids) - self.used.len() as u64
    }
}
