pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

#[must_use]
pub const fn page_align(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[must_use]
pub const fn pages(size: usize) -> u64 {
    (page_align(size) >> PAGE_SHIFT) as u64
}

/// Reads a little-endian word at `offset`, `None` if it does not fit.
#[must_use]
pub fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset.checked_add(4)?)?;
    bytes.try_into().ok().map(u32::from_le_bytes)
}

/// Writes a little-endian word at `offset`, `None` if it does not fit.
pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) -> Option<()> {
    let bytes = buf.get_mut(offset..offset.checked_add(4)?)?;
    bytes.copy_from_slice(&value.to_le_bytes());
    Some(())
}
