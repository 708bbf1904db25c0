use crate::error::{ExecError, ExecResult};
use crate::exec::placement::DevicePlacement;
use crate::exec::tracker::{BufferIndex, ValidationList};
use crate::svga::abi::{GUEST_PTR_GMR_ID, GUEST_PTR_OFFSET, SVGA_GMR_FRAMEBUFFER};
use crate::utils::{read_u32, write_u32};
use tracing::trace;

/// A guest pointer in the command buffer waiting for its buffer's placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Byte offset of the `SVGAGuestPtr` in the command buffer.
    pub location: usize,
    pub buffer: BufferIndex,
}

#[derive(Debug)]
pub struct RelocationTable {
    relocs: Vec<Relocation>,
    max: usize,
}

impl RelocationTable {
    #[must_use]
    pub const fn new(max: usize) -> Self {
        Self {
            relocs: Vec::new(),
            max,
        }
    }

    pub fn add(&mut self, location: usize, buffer: BufferIndex) -> ExecResult<()> {
        if self.is_full() {
            return Err(ExecError::TooManyRelocations);
        }
        self.relocs.push(Relocation { location, buffer });
        Ok(())
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.relocs.len() >= self.max
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.relocs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.relocs.is_empty()
    }

    pub fn clear(&mut self) {
        self.relocs.clear();
    }

    /// Patches every recorded guest pointer with its buffer's final placement
    /// and empties the table.
    ///
    /// VRAM placements become framebuffer-relative offsets; GMR placements
    /// replace the region id.
    pub fn apply(&mut self, bytes: &mut [u8], list: &ValidationList) -> ExecResult<()> {
        for reloc in self.relocs.drain(..) {
            let placement = list
                .buffer(reloc.buffer)
                .and_then(|tracked| tracked.placement)
                .ok_or(ExecError::Unplaced(reloc.buffer.0))?;

            let gmr_at = reloc.location + GUEST_PTR_GMR_ID;
            let offset_at = reloc.location + GUEST_PTR_OFFSET;
            let bad_ptr = || ExecError::MalformedStream {
                offset: reloc.location,
                reason: "guest pointer out of bounds",
            };

            match placement {
                DevicePlacement::FastPool { offset } => {
                    let current = read_u32(bytes, offset_at).ok_or_else(bad_ptr)?;
                    let base = u32::try_from(offset)
                        .map_err(|_| ExecError::UnaddressablePlacement(offset))?;
                    let patched = current.checked_add(base).ok_or(ExecError::MalformedStream {
                        offset: reloc.location,
                        reason: "guest pointer offset overflows the framebuffer",
                    })?;
                    write_u32(bytes, offset_at, patched).ok_or_else(bad_ptr)?;
                    write_u32(bytes, gmr_at, SVGA_GMR_FRAMEBUFFER).ok_or_else(bad_ptr)?;
                }
                DevicePlacement::AuxPool { slot } => {
                    write_u32(bytes, gmr_at, slot).ok_or_else(bad_ptr)?;
                }
            }
            trace!(location = reloc.location, ?placement, "relocated guest pointer");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::placement::BufferObject;
    use crate::utils::PAGE_SIZE;

    fn guest_ptr(gmr: u32, offset: u32) -> Vec<u8> {
        let mut out = gmr.to_le_bytes().to_vec();
        out.extend_from_slice(&offset.to_le_bytes());
        out
    }

    #[test]
    fn vram_and_gmr_placements() {
        let mut list = ValidationList::new(4, 4);
        let vram = list.track_buffer(BufferObject::new(5, PAGE_SIZE)).unwrap();
        let gmr = list.track_buffer(BufferObject::new(6, PAGE_SIZE)).unwrap();
        list.buffers_mut()[vram.0].placement = Some(DevicePlacement::FastPool { offset: 0x10000 });
        list.buffers_mut()[gmr.0].placement = Some(DevicePlacement::AuxPool { slot: 3 });

        let mut bytes = guest_ptr(5, 0x40);
        bytes.extend(guest_ptr(6, 0x40));

        let mut relocs = RelocationTable::new(8);
        relocs.add(0, vram).unwrap();
        relocs.add(8, gmr).unwrap();
        relocs.apply(&mut bytes, &list).unwrap();
        assert!(relocs.is_empty());

        assert_eq!(read_u32(&bytes, 0), Some(SVGA_GMR_FRAMEBUFFER));
        assert_eq!(read_u32(&bytes, 4), Some(0x10040));
        assert_eq!(read_u32(&bytes, 8), Some(3));
        assert_eq!(read_u32(&bytes, 12), Some(0x40));
    }

    #[test]
    fn unplaced_buffer_is_an_error() {
        let mut list = ValidationList::new(4, 4);
        let index = list.track_buffer(BufferObject::new(5, PAGE_SIZE)).unwrap();
        let mut bytes = guest_ptr(5, 0);
        let mut relocs = RelocationTable::new(8);
        relocs.add(0, index).unwrap();
        assert_eq!(relocs.apply(&mut bytes, &list).unwrap_err(), ExecError::Unplaced(0));
    }

    #[test]
    fn vram_offset_past_32_bits_is_rejected() {
        let mut list = ValidationList::new(4, 4);
        let index = list.track_buffer(BufferObject::new(5, PAGE_SIZE)).unwrap();
        list.buffers_mut()[index.0].placement = Some(DevicePlacement::FastPool { offset: 1 << 32 });

        let mut bytes = guest_ptr(5, 0x10);
        let mut relocs = RelocationTable::new(8);
        relocs.add(0, index).unwrap();
        let err = relocs.apply(&mut bytes, &list).unwrap_err();
        assert_eq!(err, ExecError::UnaddressablePlacement(1 << 32));
        assert_eq!(err.errno(), -libc::EIO);
        assert_eq!(read_u32(&bytes, 4), Some(0x10));
    }

    #[test]
    fn guest_offset_overflow_is_rejected() {
        let mut list = ValidationList::new(4, 4);
        let index = list.track_buffer(BufferObject::new(5, PAGE_SIZE)).unwrap();
        list.buffers_mut()[index.0].placement = Some(DevicePlacement::FastPool { offset: 0x1000 });

        let mut bytes = guest_ptr(5, 0xFFFF_F800);
        let mut relocs = RelocationTable::new(8);
        relocs.add(0, index).unwrap();
        assert!(matches!(
            relocs.apply(&mut bytes, &list).unwrap_err(),
            ExecError::MalformedStream { offset: 0, .. }
        ));
        assert_eq!(read_u32(&bytes, 0), Some(5));
    }

    #[test]
    fn capacity() {
        let mut relocs = RelocationTable::new(1);
        relocs.add(0, BufferIndex(0)).unwrap();
        assert_eq!(
            relocs.add(8, BufferIndex(0)).unwrap_err(),
            ExecError::TooManyRelocations
        );
        assert_eq!(relocs.len(), 1);
        assert!(relocs.is_full());
        relocs.clear();
        assert!(relocs.is_empty());
    }
}
