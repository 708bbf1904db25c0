use crate::utils::PAGE_SIZE;
use std::time::Duration;

/// Hard per-submission bound on tracked resources and on tracked buffers.
pub const VMWGFX_MAX_VALIDATIONS: usize = 2048;
/// Hard per-submission bound on guest pointer relocations.
pub const VMWGFX_MAX_RELOCATIONS: usize = 2048;

pub const VMWGFX_CMD_BOUNCE_INIT_SIZE: usize = 32 * 1024;
pub const VMW_FENCE_WAIT_TIMEOUT: Duration = Duration::from_secs(3);
/// VRAM is addressed through 32-bit framebuffer offsets; anything past this
/// is never handed out.
pub const VMW_MAX_VRAM_SIZE: u64 = 1 << 32;

/// Device parameters for the submission pipeline.
///
/// Built by value, e.g.
/// `DeviceConfig::new().with_vram_size(16 << 20).with_gmr_ids(64)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    pub vram_size: usize,
    /// Number of GMR slots; zero means the device has no GMR pool.
    pub max_gmr_ids: u32,
    pub fence_wait_timeout: Duration,
    pub cmd_bounce_init_size: usize,
    pub max_resources: usize,
    pub max_buffers: usize,
    pub max_relocations: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            vram_size: 16 * 1024 * 1024,
            max_gmr_ids: 64,
            fence_wait_timeout: VMW_FENCE_WAIT_TIMEOUT,
            cmd_bounce_init_size: VMWGFX_CMD_BOUNCE_INIT_SIZE,
            max_resources: VMWGFX_MAX_VALIDATIONS,
            max_buffers: VMWGFX_MAX_VALIDATIONS,
            max_relocations: VMWGFX_MAX_RELOCATIONS,
        }
    }

    #[must_use]
    pub const fn with_vram_size(mut self, size: usize) -> Self {
        self.vram_size = size;
        self
    }

    #[must_use]
    pub const fn with_gmr_ids(mut self, ids: u32) -> Self {
        self.max_gmr_ids = ids;
        self
    }

    #[must_use]
    pub const fn with_fence_wait_timeout(mut self, timeout: Duration) -> Self {
        self.fence_wait_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_bounce_init_size(mut self, size: usize) -> Self {
        self.cmd_bounce_init_size = size;
        self
    }

    /// Lowers the per-submission capacity bounds. Values above the
    /// compile-time maxima are clamped.
    #[must_use]
    pub const fn with_limits(mut self, resources: usize, buffers: usize, relocations: usize) -> Self {
        self.max_resources = min(resources, VMWGFX_MAX_VALIDATIONS);
        self.max_buffers = min(buffers, VMWGFX_MAX_VALIDATIONS);
        self.max_relocations = min(relocations, VMWGFX_MAX_RELOCATIONS);
        self
    }

    #[must_use]
    pub const fn has_gmr(&self) -> bool {
        self.max_gmr_ids > 0
    }

    /// Usable VRAM in pages, rounded down and capped at
    /// [`VMW_MAX_VRAM_SIZE`].
    #[must_use]
    pub const fn vram_pages(&self) -> u64 {
        let size = self.vram_size as u64;
        let size = if size > VMW_MAX_VRAM_SIZE { VMW_MAX_VRAM_SIZE } else { size };
        size / PAGE_SIZE as u64
    }
}

const fn min(a: usize, b: usize) -> usize {
    if a < b { a } else { b }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_are_clamped() {
        let cfg = DeviceConfig::new().with_limits(4, 10_000, 8);
        assert_eq!(cfg.max_resources, 4);
        assert_eq!(cfg.max_buffers, VMWGFX_MAX_VALIDATIONS);
        assert_eq!(cfg.max_relocations, 8);
    }

    #[test]
    fn no_gmr_pool() {
        let cfg = DeviceConfig::new().with_gmr_ids(0).with_vram_size(8 * PAGE_SIZE + 1);
        assert!(!cfg.has_gmr());
        assert_eq!(cfg.vram_pages(), 8);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn vram_is_capped_to_the_framebuffer_window() {
        let cfg = DeviceConfig::new().with_vram_size(8 << 30);
        assert_eq!(cfg.vram_pages(), VMW_MAX_VRAM_SIZE / PAGE_SIZE as u64);
        assert_eq!(cfg.vram_size, 8 << 30);
    }
}
