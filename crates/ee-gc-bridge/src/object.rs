//! Minimal object layout written by the allocation engine
//!
//! Every object starts with an [`ObjectHeader`]: one word of header bits
//! followed by the type pointer. Array-like objects store their element count
//! in the next word. Type layout beyond that belongs to the runtime.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Header bit set when finalization was suppressed for the object
pub const HEADER_FINALIZER_RUN: usize = 0x4000_0000;

/// Bytes occupied by the header bits and the type pointer
pub const OBJECT_HEADER_SIZE: usize = std::mem::size_of::<ObjectHeader>();

/// Offset of the element count in array-like objects
pub const ARRAY_LENGTH_OFFSET: usize = OBJECT_HEADER_SIZE;

/// Header at the start of every heap object
#[repr(C)]
pub struct ObjectHeader {
    /// Header bits (finalizer-run, reserved bits for the runtime)
    bits: AtomicUsize,
    /// Type of the object
    type_desc: AtomicPtr<TypeDescriptor>,
}

impl ObjectHeader {
    /// Get the raw header bits
    pub fn bits(&self) -> usize {
        self.bits.load(Ordering::Acquire)
    }

    /// Set bits in the header
    pub fn set_bits(&self, mask: usize) {
        self.bits.fetch_or(mask, Ordering::AcqRel);
    }

    /// Clear bits in the header
    pub fn clear_bits(&self, mask: usize) {
        self.bits.fetch_and(!mask, Ordering::AcqRel);
    }

    /// Whether finalization was suppressed
    pub fn is_finalizer_run(&self) -> bool {
        self.bits() & HEADER_FINALIZER_RUN != 0
    }
}

/// Runtime type information the allocator needs
///
/// `base_size` includes the object header (and the length word for arrays).
#[derive(Debug)]
pub struct TypeDescriptor {
    /// Diagnostic name
    pub name: &'static str,
    /// Size of an instance with zero elements, header included
    pub base_size: usize,
    /// Size of one element for array-like types
    pub component_size: usize,
    /// Whether the type is array-like
    pub is_array: bool,
    /// Whether instances hold references the collector must trace
    pub contains_references: bool,
    /// Finalizer run by the finalization bridge
    pub finalizer: Option<fn(ObjectRef)>,
}

impl TypeDescriptor {
    /// Fixed-size object type
    pub const fn object(name: &'static str, base_size: usize) -> Self {
        Self {
            name,
            base_size,
            component_size: 0,
            is_array: false,
            contains_references: false,
            finalizer: None,
        }
    }

    /// Array-like type with `component_size` bytes per element
    pub const fn array(name: &'static str, base_size: usize, component_size: usize) -> Self {
        Self {
            name,
            base_size,
            component_size,
            is_array: true,
            contains_references: false,
            finalizer: None,
        }
    }

    /// Mark instances as containing GC references
    pub const fn with_references(mut self) -> Self {
        self.contains_references = true;
        self
    }

    /// Attach a finalizer
    pub const fn with_finalizer(mut self, finalizer: fn(ObjectRef)) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    /// Whether instances must be registered for finalization
    pub const fn has_finalizer(&self) -> bool {
        self.finalizer.is_some()
    }
}

/// Reference to a heap object (address of its header)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(NonNull<u8>);

// SAFETY: an ObjectRef is an address. Dereferencing it is unsafe and the
// caller must uphold GC-mode rules; moving the address between threads is fine.
unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}

impl ObjectRef {
    /// Wrap a pointer to memory the collector handed out
    pub fn from_ptr(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    /// Wrap a raw address, None for null
    pub fn from_address(addr: usize) -> Option<Self> {
        NonNull::new(addr as *mut u8).map(Self)
    }

    /// Address of the object
    pub fn address(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Raw pointer to the object
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Get the object header
    ///
    /// # Safety
    /// The object must be live and its memory at least `OBJECT_HEADER_SIZE` bytes.
    pub unsafe fn header<'a>(self) -> &'a ObjectHeader {
        // SAFETY: caller guarantees the header is in live memory
        unsafe { &*(self.0.as_ptr() as *const ObjectHeader) }
    }

    /// Get the type descriptor written at allocation time
    ///
    /// # Safety
    /// Same as [`ObjectRef::header`].
    pub unsafe fn type_descriptor(self) -> Option<&'static TypeDescriptor> {
        // SAFETY: caller guarantees liveness; type descriptors are 'static
        let ptr = unsafe { self.header() }.type_desc.load(Ordering::Acquire);
        unsafe { ptr.as_ref() }
    }

    /// Get the element count of an array-like object
    ///
    /// # Safety
    /// Same as [`ObjectRef::header`], and the object must be array-like.
    pub unsafe fn array_length(self) -> usize {
        // SAFETY: caller guarantees this is a live array
        unsafe {
            (self.0.as_ptr().add(ARRAY_LENGTH_OFFSET) as *const usize).read()
        }
    }

    /// Write the header, type pointer and (for arrays) the element count.
    ///
    /// # Safety
    /// The object memory must be freshly allocated, exclusively owned by the
    /// caller, host-word aligned, and cover [`host_footprint`](crate::layout::host_footprint).
    pub(crate) unsafe fn initialize(self, desc: &'static TypeDescriptor, length: usize) {
        let base = self.0.as_ptr();
        debug_assert_eq!(self.address() % std::mem::align_of::<usize>(), 0);
        // SAFETY: caller guarantees exclusive access to at least base_size bytes
        unsafe {
            let header = &*(base as *const ObjectHeader);
            header.bits.store(0, Ordering::Relaxed);
            header
                .type_desc
                .store(desc as *const TypeDescriptor as *mut TypeDescriptor, Ordering::Release);
            if desc.is_array {
                (base.add(ARRAY_LENGTH_OFFSET) as *mut usize).write(length);
            }
        }
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.address())
    }
}

/// Allocation flag bits understood by the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AllocFlags(u32);

impl AllocFlags {
    /// No flags
    pub const NONE: Self = Self(0);
    /// Register the object for finalization
    pub const FINALIZE: Self = Self(0x1);
    /// Object contains references
    pub const CONTAINS_REFERENCES: Self = Self(0x2);
    /// Collector may skip zeroing the payload
    pub const ZEROING_OPTIONAL: Self = Self(0x10);
    /// Allocate on the large object heap
    pub const LARGE_OBJECT_HEAP: Self = Self(0x20);
    /// Allocate on the pinned object heap
    pub const PINNED_OBJECT_HEAP: Self = Self(0x40);
    /// Any user-old-heap (large or pinned)
    pub const USER_OLD_HEAP: Self = Self(0x20 | 0x40);

    const ALL: u32 = 0x1 | 0x2 | 0x10 | 0x20 | 0x40;

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Build from raw bits, dropping unknown ones
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL)
    }

    /// True if all bits of `other` are set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any bit of `other` is set
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether the allocation targets a user-old-heap (LOH or POH)
    pub const fn is_user_old_heap(self) -> bool {
        self.intersects(Self::USER_OLD_HEAP)
    }
}

impl BitOr for AllocFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for AllocFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(8))]
    struct Block([u8; 64]);

    static POINT: TypeDescriptor = TypeDescriptor::object("Point", 24);
    static BYTES: TypeDescriptor = TypeDescriptor::array("Bytes", 24, 1);

    #[test]
    fn test_header_bits() {
        let mut block = Block([0; 64]);
        let obj = ObjectRef::from_ptr(NonNull::new(block.0.as_mut_ptr()).unwrap());
        unsafe {
            obj.initialize(&POINT, 0);
            let header = obj.header();
            assert!(!header.is_finalizer_run());
            header.set_bits(HEADER_FINALIZER_RUN);
            assert!(header.is_finalizer_run());
            header.clear_bits(HEADER_FINALIZER_RUN);
            assert!(!header.is_finalizer_run());
            assert_eq!(obj.type_descriptor().unwrap().name, "Point");
        }
    }

    #[test]
    fn test_array_length_written() {
        let mut block = Block([0xAA; 64]);
        let obj = ObjectRef::from_ptr(NonNull::new(block.0.as_mut_ptr()).unwrap());
        unsafe {
            obj.initialize(&BYTES, 17);
            assert_eq!(obj.array_length(), 17);
            assert_eq!(obj.header().bits(), 0);
        }
    }

    #[test]
    fn test_alloc_flags() {
        let flags = AllocFlags::FINALIZE | AllocFlags::PINNED_OBJECT_HEAP;
        assert!(flags.contains(AllocFlags::FINALIZE));
        assert!(flags.is_user_old_heap());
        assert!(!flags.contains(AllocFlags::USER_OLD_HEAP));
        assert!(!AllocFlags::CONTAINS_REFERENCES.is_user_old_heap());
        assert_eq!(AllocFlags::from_bits_truncate(0xFFFF_FFFF).bits(), 0x73);
    }

    #[test]
    fn test_from_address_null() {
        assert!(ObjectRef::from_address(0).is_none());
        assert_eq!(ObjectRef::from_address(0x1000).unwrap().address(), 0x1000);
    }
}
