//! Utility functions.

/// Page granularity of the target's address space.
pub const PAGE_SIZE: u64 = 0x1000;

/// Aligns an address or size up to the next multiple of `align`.
/// `align` must be a power of two.
pub fn align_up(addr: u64, align: u64) -> u64 {
    assert!(align.is_power_of_two());
    (addr + align - 1) & !(align - 1)
}
