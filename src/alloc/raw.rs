//! The raw memory accessor that the guard wraps. The guard never allocates
//! or touches memory itself. Everything eventually lands on a
//! [`RawMemory`] implementation, which by default is just `libc`.

use std::{
    fmt,
    ptr::{self, NonNull},
    sync::atomic::{
        fence, AtomicI32, AtomicI64, AtomicIsize, AtomicU32, AtomicU64, AtomicUsize, Ordering,
    },
};

use libc::c_void;

/// Where a raw access lands. Absolute locations are plain off-heap
/// addresses and are the only kind that the guard validates. Object-relative
/// locations describe memory owned by something else (a Rust value, a buffer
/// from another allocator) and are passed straight through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    Absolute(u64),
    Object { base: NonNull<u8>, offset: u64 },
}

impl Location {
    /// The absolute address, if this location is one.
    pub const fn absolute(&self) -> Option<u64> {
        match *self {
            Self::Absolute(address) => Some(address),
            Self::Object { .. } => None,
        }
    }

    /// Move this location forward by `by` bytes.
    pub fn offset(self, by: u64) -> Self {
        match self {
            Self::Absolute(address) => Self::Absolute(address.wrapping_add(by)),
            Self::Object { base, offset } => Self::Object {
                base,
                offset: offset.wrapping_add(by),
            },
        }
    }

    /// Resolve to a pointer. This never dereferences anything, so it is safe;
    /// using the pointer is not.
    pub fn as_ptr<T>(&self) -> *mut T {
        match *self {
            Self::Absolute(address) => address as usize as *mut T,
            Self::Object { base, offset } => base.as_ptr().wrapping_add(offset as usize).cast(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Absolute(address) => write!(f, "{address:#018x}"),
            Self::Object { base, offset } => write!(f, "{base:p}+{offset}"),
        }
    }
}

impl From<u64> for Location {
    fn from(address: u64) -> Self {
        Self::Absolute(address)
    }
}

impl<T> From<&mut T> for Location {
    fn from(value: &mut T) -> Self {
        Self::Object {
            base: NonNull::from(value).cast(),
            offset: 0,
        }
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Plain fixed-width values that can be read from and written to raw memory.
/// `Pod` guarantees that whatever bits happen to be at an address form a
/// valid value, which is exactly what reading unknown memory needs.
pub trait Scalar: bytemuck::Pod + Send + Sync + fmt::Debug + sealed::Sealed {}

/// Scalars with a native atomic counterpart.
pub trait AtomicScalar: Scalar + PartialEq {
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes and aligned to
    /// `align_of::<Self>()`.
    unsafe fn atomic_compare_and_swap(ptr: *mut Self, expected: Self, new: Self) -> bool;

    /// Wrapping add, returning the previous value.
    ///
    /// # Safety
    ///
    /// As for [`AtomicScalar::atomic_compare_and_swap()`].
    unsafe fn atomic_fetch_add(ptr: *mut Self, delta: Self) -> Self;

    /// # Safety
    ///
    /// As for [`AtomicScalar::atomic_compare_and_swap()`].
    unsafe fn atomic_swap(ptr: *mut Self, value: Self) -> Self;

    /// A release store (the "lazy set" of other runtimes).
    ///
    /// # Safety
    ///
    /// As for [`AtomicScalar::atomic_compare_and_swap()`].
    unsafe fn atomic_store_release(ptr: *mut Self, value: Self);
}

macro_rules! scalar {
    ($($t:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $t {}
            impl Scalar for $t {}
        )*
    };
}

scalar!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64, usize, isize);

macro_rules! atomic_scalar {
    ($($t:ty => $atomic:ty),* $(,)?) => {
        $(
            impl AtomicScalar for $t {
                unsafe fn atomic_compare_and_swap(ptr: *mut Self, expected: Self, new: Self) -> bool {
                    // SAFETY: requirement passed to caller
                    unsafe { <$atomic>::from_ptr(ptr) }
                        .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                }

                unsafe fn atomic_fetch_add(ptr: *mut Self, delta: Self) -> Self {
                    // SAFETY: requirement passed to caller
                    unsafe { <$atomic>::from_ptr(ptr) }.fetch_add(delta, Ordering::SeqCst)
                }

                unsafe fn atomic_swap(ptr: *mut Self, value: Self) -> Self {
                    // SAFETY: requirement passed to caller
                    unsafe { <$atomic>::from_ptr(ptr) }.swap(value, Ordering::SeqCst)
                }

                unsafe fn atomic_store_release(ptr: *mut Self, value: Self) {
                    // SAFETY: requirement passed to caller
                    unsafe { <$atomic>::from_ptr(ptr) }.store(value, Ordering::Release)
                }
            }
        )*
    };
}

atomic_scalar!(
    i32 => AtomicI32,
    u32 => AtomicU32,
    i64 => AtomicI64,
    u64 => AtomicU64,
    isize => AtomicIsize,
    usize => AtomicUsize,
);

/// A capability over raw, manually managed memory.
///
/// Only the three lifecycle functions are required. The access primitives
/// have straightforward pointer-based defaults, but can be overridden (e.g.
/// to instrument them).
///
/// # Safety
///
/// - `allocate(size)` must return `0` or the address of at least `size`
///   bytes that are not part of any other live allocation
/// - `reallocate()` must follow `realloc()` semantics: on a non-zero return
///   the old block is gone and the contents moved, on a zero return with a
///   non-zero size the old block is untouched
pub unsafe trait RawMemory: Send + Sync {
    fn allocate(&self, size: u64) -> u64;

    /// # Safety
    ///
    /// `address` must have come from `allocate()`/`reallocate()` on this
    /// accessor and not have been freed already.
    unsafe fn free(&self, address: u64);

    /// # Safety
    ///
    /// As for [`RawMemory::free()`].
    unsafe fn reallocate(&self, address: u64, new_size: u64) -> u64;

    /// # Safety
    ///
    /// `at` must be valid for reads of `size_of::<T>()` bytes.
    unsafe fn get<T: Scalar>(&self, at: Location) -> T {
        // SAFETY: requirement passed to caller
        unsafe { at.as_ptr::<T>().read_unaligned() }
    }

    /// # Safety
    ///
    /// `at` must be valid for writes of `size_of::<T>()` bytes.
    unsafe fn put<T: Scalar>(&self, at: Location, value: T) {
        // SAFETY: requirement passed to caller
        unsafe { at.as_ptr::<T>().write_unaligned(value) }
    }

    /// # Safety
    ///
    /// `at` must be valid for reads and aligned for `T`.
    unsafe fn get_volatile<T: Scalar>(&self, at: Location) -> T {
        // SAFETY: requirement passed to caller
        let value = unsafe { at.as_ptr::<T>().read_volatile() };
        fence(Ordering::SeqCst);
        value
    }

    /// # Safety
    ///
    /// `at` must be valid for writes and aligned for `T`.
    unsafe fn put_volatile<T: Scalar>(&self, at: Location, value: T) {
        fence(Ordering::SeqCst);
        // SAFETY: requirement passed to caller
        unsafe { at.as_ptr::<T>().write_volatile(value) };
        fence(Ordering::SeqCst);
    }

    /// # Safety
    ///
    /// `at` must be valid for writes and aligned for `T`.
    unsafe fn put_ordered<T: AtomicScalar>(&self, at: Location, value: T) {
        // SAFETY: requirement passed to caller
        unsafe { T::atomic_store_release(at.as_ptr(), value) }
    }

    /// # Safety
    ///
    /// `at` must be valid for reads and writes and aligned for `T`.
    unsafe fn compare_and_swap<T: AtomicScalar>(&self, at: Location, expected: T, new: T) -> bool {
        // SAFETY: requirement passed to caller
        unsafe { T::atomic_compare_and_swap(at.as_ptr(), expected, new) }
    }

    /// # Safety
    ///
    /// `at` must be valid for reads and writes and aligned for `T`.
    unsafe fn get_and_add<T: AtomicScalar>(&self, at: Location, delta: T) -> T {
        // SAFETY: requirement passed to caller
        unsafe { T::atomic_fetch_add(at.as_ptr(), delta) }
    }

    /// # Safety
    ///
    /// `at` must be valid for reads and writes and aligned for `T`.
    unsafe fn get_and_set<T: AtomicScalar>(&self, at: Location, value: T) -> T {
        // SAFETY: requirement passed to caller
        unsafe { T::atomic_swap(at.as_ptr(), value) }
    }

    /// # Safety
    ///
    /// `at` must be valid for writes of `bytes` bytes.
    unsafe fn set_memory(&self, at: Location, bytes: u64, value: u8) {
        // SAFETY: requirement passed to caller
        unsafe { ptr::write_bytes(at.as_ptr::<u8>(), value, bytes as usize) }
    }

    /// Copy `bytes` bytes, the ranges may overlap.
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads and `dst` for writes of `bytes` bytes.
    unsafe fn copy_memory(&self, src: Location, dst: Location, bytes: u64) {
        // SAFETY: requirement passed to caller
        unsafe { ptr::copy(src.as_ptr::<u8>(), dst.as_ptr::<u8>(), bytes as usize) }
    }
}

/// `malloc()`, `free()` and `realloc()` from the C library.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemMemory;

// SAFETY: `malloc()`/`realloc()` follow the contract by definition. Zero
// sized requests are bumped to one byte so that every successful allocation
// has a unique, non-null address.
unsafe impl RawMemory for SystemMemory {
    fn allocate(&self, size: u64) -> u64 {
        let Ok(size) = usize::try_from(size) else {
            return 0;
        };
        // SAFETY: `malloc()` has no preconditions
        unsafe { libc::malloc(size.max(1)) as usize as u64 }
    }

    unsafe fn free(&self, address: u64) {
        // SAFETY: requirement passed to caller
        unsafe { libc::free(address as usize as *mut c_void) }
    }

    unsafe fn reallocate(&self, address: u64, new_size: u64) -> u64 {
        let Ok(new_size) = usize::try_from(new_size) else {
            return 0;
        };
        // SAFETY: requirement passed to caller
        unsafe { libc::realloc(address as usize as *mut c_void, new_size) as usize as u64 }
    }

    unsafe fn set_memory(&self, at: Location, bytes: u64, value: u8) {
        // SAFETY: requirement passed to caller
        unsafe { libc::memset(at.as_ptr::<c_void>(), value as libc::c_int, bytes as usize) };
    }

    unsafe fn copy_memory(&self, src: Location, dst: Location, bytes: u64) {
        // SAFETY: requirement passed to caller
        unsafe { libc::memmove(dst.as_ptr::<c_void>(), src.as_ptr::<c_void>(), bytes as usize) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_offset_works() {
        assert_eq!(Location::from(0x1000u64).offset(8), Location::Absolute(0x1008));
        let mut n = 0u64;
        let at = Location::from(&mut n);
        assert_eq!(at.absolute(), None);
        assert_eq!(at.offset(4).as_ptr::<u8>(), (&mut n as *mut u64 as *mut u8).wrapping_add(4));
    }

    #[test]
    fn system_memory_primitives_work() {
        let raw = SystemMemory;
        let address = raw.allocate(16);
        assert_ne!(address, 0);
        let at = Location::from(address);
        unsafe {
            raw.set_memory(at, 16, 0);
            raw.put::<u32>(at, 0xdead_beef);
            assert_eq!(raw.get::<u32>(at), 0xdead_beef);
            assert!(raw.compare_and_swap::<u32>(at, 0xdead_beef, 7));
            assert!(!raw.compare_and_swap::<u32>(at, 0xdead_beef, 8));
            assert_eq!(raw.get_and_add::<u32>(at, 3), 7);
            assert_eq!(raw.get_and_set::<u32>(at, 1), 10);
            raw.put_ordered::<u64>(at.offset(8), 99);
            assert_eq!(raw.get_volatile::<u64>(at.offset(8)), 99);
            raw.copy_memory(at, at.offset(4), 4);
            assert_eq!(raw.get::<u32>(at.offset(4)), 1);
            let address = raw.reallocate(address, 64);
            assert_ne!(address, 0);
            assert_eq!(raw.get::<u32>(Location::from(address)), 1);
            raw.free(address);
        }
    }

    #[test]
    fn zero_sized_allocations_are_unique() {
        let raw = SystemMemory;
        let a = raw.allocate(0);
        let b = raw.allocate(0);
        assert_ne!(a, 0);
        assert_ne!(a, b);
        unsafe {
            raw.free(a);
            raw.free(b);
        }
    }
}
