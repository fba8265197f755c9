//! Object size computation with exact overflow detection
//!
//! Sizes are computed in `u64` regardless of the target pointer width, so a
//! 32-bit target can never silently wrap `element_count * component_size`.

use crate::error::{GcError, GcResult};
use crate::object::{ARRAY_LENGTH_OFFSET, OBJECT_HEADER_SIZE, TypeDescriptor};

/// Alignment of every object address handed out on this host
pub const HOST_ALIGN: usize = std::mem::align_of::<usize>();

/// Largest element count accepted for an array-like object
pub const MAX_ARRAY_LENGTH: u64 = 0x7FFF_FFC7;

/// Pointer width of the target the size is computed for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerWidth {
    /// 32-bit pointers
    W32,
    /// 64-bit pointers
    W64,
}

impl PointerWidth {
    /// Width of the host
    pub const fn native() -> Self {
        if cfg!(target_pointer_width = "64") {
            PointerWidth::W64
        } else {
            PointerWidth::W32
        }
    }

    /// Pointer size in bytes (also the object alignment)
    pub const fn bytes(self) -> u64 {
        match self {
            PointerWidth::W32 => 4,
            PointerWidth::W64 => 8,
        }
    }

    /// Largest unsigned pointer-width value
    pub const fn unsigned_max(self) -> u64 {
        match self {
            PointerWidth::W32 => u32::MAX as u64,
            PointerWidth::W64 => u64::MAX,
        }
    }

    /// Largest signed pointer-width value
    pub const fn signed_max(self) -> u64 {
        match self {
            PointerWidth::W32 => i32::MAX as u64,
            PointerWidth::W64 => i64::MAX as u64,
        }
    }

    /// Smallest possible object: header bits, type pointer and one payload word
    pub const fn min_object_size(self) -> u64 {
        3 * self.bytes()
    }

    /// Ceiling for a single user-old-heap object
    pub const fn max_object_size(self) -> u64 {
        self.signed_max() - 7 - self.min_object_size()
    }
}

/// Round `size` up to pointer alignment; None if that overflows `u64`
pub fn align_up(size: u64, width: PointerWidth) -> Option<u64> {
    let mask = width.bytes() - 1;
    size.checked_add(mask).map(|s| s & !mask)
}

/// Compute the aligned size of an instance of `desc` with `element_count` elements.
///
/// Fails with `Overflow` when the count exceeds [`MAX_ARRAY_LENGTH`], when the
/// wide intermediate overflows, or when the result is not representable at
/// `width` once alignment slack is accounted for.
pub fn object_size(
    desc: &TypeDescriptor,
    element_count: u64,
    width: PointerWidth,
) -> GcResult<u64> {
    let raw = if desc.is_array {
        if element_count > MAX_ARRAY_LENGTH {
            return Err(GcError::Overflow);
        }
        (desc.component_size as u64)
            .checked_mul(element_count)
            .and_then(|payload| payload.checked_add(desc.base_size as u64))
            .ok_or(GcError::Overflow)?
    } else {
        if element_count != 0 {
            return Err(GcError::invariant(format!(
                "element count {element_count} for non-array type {}",
                desc.name
            )));
        }
        desc.base_size as u64
    };

    // Leave room for the alignment round-up at the target width
    if raw > width.unsigned_max() - (width.bytes() - 1) {
        return Err(GcError::Overflow);
    }
    align_up(raw, width).ok_or(GcError::Overflow)
}

/// Bytes reserved on this host for an instance of `desc` whose size at the
/// target width is `size`.
///
/// The header and array length are written in host layout, so the
/// reservation covers them and keeps the next object host-word aligned even
/// when sizes are computed for a narrower target.
pub fn host_footprint(desc: &TypeDescriptor, size: u64) -> GcResult<usize> {
    let header = if desc.is_array {
        ARRAY_LENGTH_OFFSET + std::mem::size_of::<usize>()
    } else {
        OBJECT_HEADER_SIZE
    };
    usize::try_from(size)
        .ok()
        .and_then(|size| size.max(header).checked_next_multiple_of(HOST_ALIGN))
        .ok_or(GcError::Overflow)
}

/// Ceiling check applied to large and pinned allocations
pub fn check_user_old_heap_size(size: u64, width: PointerWidth) -> GcResult<()> {
    if size > width.max_object_size() {
        return Err(GcError::Overflow);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    static PLAIN: TypeDescriptor = TypeDescriptor::object("Plain", 20);
    static LONGS: TypeDescriptor = TypeDescriptor::array("Longs", 24, 8);

    #[test]
    fn test_plain_object_aligned() {
        assert_eq!(object_size(&PLAIN, 0, PointerWidth::W64), Ok(24));
        assert_eq!(object_size(&PLAIN, 0, PointerWidth::W32), Ok(20));
    }

    #[test]
    fn test_non_array_with_count_rejected() {
        assert!(matches!(
            object_size(&PLAIN, 3, PointerWidth::W64),
            Err(GcError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_32bit_widened_array_size_is_exact() {
        let size = object_size(&LONGS, 0x20000, PointerWidth::W32).unwrap();
        assert_eq!(size, 24 + 0x20000 * 8);
    }

    #[test]
    fn test_max_array_length() {
        assert_eq!(
            object_size(&LONGS, MAX_ARRAY_LENGTH + 1, PointerWidth::W64),
            Err(GcError::Overflow)
        );
        // Fits in 64 bits: 0x7FFFFFC7 * 8 + 24
        assert!(object_size(&LONGS, MAX_ARRAY_LENGTH, PointerWidth::W64).is_ok());
        // But not in 32 bits
        assert_eq!(
            object_size(&LONGS, MAX_ARRAY_LENGTH, PointerWidth::W32),
            Err(GcError::Overflow)
        );
    }

    #[test]
    fn test_64bit_intermediate_overflow() {
        let huge = TypeDescriptor::array("Huge", 24, usize::MAX);
        assert_eq!(
            object_size(&huge, MAX_ARRAY_LENGTH, PointerWidth::W64),
            Err(GcError::Overflow)
        );
    }

    #[test]
    fn test_user_old_heap_ceiling() {
        let w = PointerWidth::W32;
        assert_eq!(w.max_object_size(), i32::MAX as u64 - 7 - 12);
        assert!(check_user_old_heap_size(w.max_object_size(), w).is_ok());
        assert_eq!(
            check_user_old_heap_size(w.max_object_size() + 1, w),
            Err(GcError::Overflow)
        );
    }

    #[test]
    fn test_host_footprint_keeps_host_alignment() {
        static TINY: TypeDescriptor = TypeDescriptor::object("Tiny", 4);
        static INTS: TypeDescriptor = TypeDescriptor::array("Ints", 12, 4);

        let w32 = object_size(&PLAIN, 0, PointerWidth::W32).unwrap();
        assert_eq!(host_footprint(&PLAIN, w32), Ok(20usize.next_multiple_of(HOST_ALIGN)));
        // Never smaller than what `initialize` writes
        assert_eq!(host_footprint(&TINY, 4), Ok(OBJECT_HEADER_SIZE));
        let ints = object_size(&INTS, 1, PointerWidth::W32).unwrap();
        assert_eq!(ints, 16);
        assert!(host_footprint(&INTS, ints).unwrap() >= ARRAY_LENGTH_OFFSET + 8);
        assert_eq!(host_footprint(&LONGS, 0x10_0018), Ok(0x10_0018));
    }

    proptest! {
        #[test]
        fn prop_footprint_is_aligned_and_covers_size(
            base in 0usize..256,
            component in 0usize..32,
            count in 0u64..1024,
            narrow in any::<bool>(),
        ) {
            let desc = TypeDescriptor::array("Prop", base, component);
            let width = if narrow { PointerWidth::W32 } else { PointerWidth::W64 };
            let size = object_size(&desc, count, width).unwrap();
            let footprint = host_footprint(&desc, size).unwrap();
            prop_assert_eq!(footprint % HOST_ALIGN, 0);
            prop_assert!(footprint as u64 >= size);
            prop_assert!(footprint >= ARRAY_LENGTH_OFFSET + 8);
        }

        #[test]
        fn prop_32bit_count_near_boundary_never_wraps(
            component in prop::sample::select(vec![1u64, 2, 4, 8, 12, 16, 24]),
            delta in -4096i64..4096i64,
        ) {
            let desc = TypeDescriptor::array("Prop", 24, component as usize);
            let pivot = (1u64 << 32) / component;
            let count = (pivot as i64 + delta).max(0) as u64;

            let exact = 24u128 + count as u128 * component as u128;
            let result = object_size(&desc, count, PointerWidth::W32);

            match result {
                Ok(size) => {
                    prop_assert!(count <= MAX_ARRAY_LENGTH);
                    prop_assert_eq!(size as u128, (exact + 3) & !3);
                    prop_assert!(size <= u32::MAX as u64);
                }
                Err(GcError::Overflow) => {
                    prop_assert!(count > MAX_ARRAY_LENGTH || exact > (u32::MAX - 3) as u128);
                }
                Err(other) => prop_assert!(false, "unexpected error {other:?}"),
            }
        }
    }
}
