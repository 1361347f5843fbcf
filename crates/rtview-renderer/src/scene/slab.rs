//! Fixed-count, fixed-stride slot layout inside one buffer.
//!
//! Used for the per-frame camera constants and for the shader binding table
//! regions. Slots never overlap and each starts on the slab alignment.

use std::ops::Range;

/// Round `value` up to the next multiple of `alignment`.
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Byte range of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabSlot {
    pub offset: u64,
    pub size: u64,
}

impl SlabSlot {
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignedSlab {
    element_size: u64,
    stride: u64,
    count: usize,
}

impl AlignedSlab {
    pub const fn new(element_size: u64, alignment: u64, count: usize) -> Self {
        Self {
            element_size,
            stride: align_up(element_size, alignment),
            count,
        }
    }

    pub fn element_size(&self) -> u64 {
        self.element_size
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn total_size(&self) -> u64 {
        self.stride * self.count as u64
    }

    /// Slot `index`, or `None` past the end.
    pub fn slot(&self, index: usize) -> Option<SlabSlot> {
        (index < self.count).then(|| SlabSlot {
            offset: self.stride * index as u64,
            size: self.element_size,
        })
    }

    pub fn slots(&self) -> impl Iterator<Item = SlabSlot> + '_ {
        (0..self.count).filter_map(|i| self.slot(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(128, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(32, 64), 64);
        assert_eq!(align_up(48, 24), 48);
        assert_eq!(align_up(7, 0), 7);
    }

    #[test]
    fn test_camera_slab_layout() {
        let slab = AlignedSlab::new(128, 256, 2);
        assert_eq!(slab.stride(), 256);
        assert_eq!(slab.total_size(), 512);
        assert_eq!(slab.slot(0), Some(SlabSlot { offset: 0, size: 128 }));
        assert_eq!(slab.slot(1), Some(SlabSlot { offset: 256, size: 128 }));
        assert_eq!(slab.slot(2), None);
    }

    #[test]
    fn test_slots_disjoint_and_aligned() {
        for (element, alignment, count) in [(32u64, 64u64, 3usize), (128, 256, 2), (100, 64, 5), (64, 64, 4)] {
            let slab = AlignedSlab::new(element, alignment, count);
            let slots: Vec<_> = slab.slots().collect();
            assert_eq!(slots.len(), count);
            for (i, a) in slots.iter().enumerate() {
                assert_eq!(a.offset % alignment, 0);
                assert!(a.range().end <= slab.total_size());
                for b in &slots[i + 1..] {
                    assert!(a.range().end <= b.range().start);
                }
            }
        }
    }
}
