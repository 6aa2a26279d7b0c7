pub mod frame_allocator;
pub mod heap;
pub mod paging;

use core::{
    fmt::{Debug, LowerHex},
    ops::{Add, AddAssign, Sub, SubAssign},
    sync::atomic::{AtomicUsize, Ordering},
};

pub use storpu_utils::align::{align_down, align_up, is_aligned};

use paging::PAGE_SIZE;

/// A virtual memory address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

/// A physical memory address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl Debug for VirtAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "VirtAddr({self:#x})")
    }
}

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PhysAddr({self:#x})")
    }
}

macro_rules! impl_addr_ty {
    ($ty: ty) => {
        impl $ty {
            #[inline(always)]
            pub const fn null() -> Self {
                Self(0)
            }

            #[inline(always)]
            pub const fn from_bits(bits: usize) -> Self {
                Self(bits)
            }

            #[inline(always)]
            pub const fn into_raw(self) -> usize {
                self.0
            }

            #[inline(always)]
            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            #[inline(always)]
            pub const fn to_next_page(self) -> Self {
                Self(align_up(self.0, PAGE_SIZE))
            }

            #[inline(always)]
            pub const fn to_previous_page(self) -> Self {
                Self(align_down(self.0, PAGE_SIZE))
            }

            #[inline(always)]
            pub const fn is_page_aligned(self) -> bool {
                is_aligned(self.0, PAGE_SIZE)
            }
        }

        impl LowerHex for $ty {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                LowerHex::fmt(&self.0, f)
            }
        }

        impl From<usize> for $ty {
            #[inline(always)]
            fn from(value: usize) -> Self {
                Self(value)
            }
        }

        impl Add<usize> for $ty {
            type Output = $ty;
            #[inline(always)]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl AddAssign<usize> for $ty {
            #[inline(always)]
            fn add_assign(&mut self, rhs: usize) {
                *self = *self + rhs
            }
        }

        impl Sub<$ty> for $ty {
            type Output = usize;
            #[inline(always)]
            fn sub(self, rhs: $ty) -> Self::Output {
                self.0 - rhs.0
            }
        }

        impl Sub<usize> for $ty {
            type Output = Self;
            #[inline(always)]
            fn sub(self, rhs: usize) -> Self::Output {
                Self(self.0 - rhs)
            }
        }

        impl SubAssign<usize> for $ty {
            #[inline(always)]
            fn sub_assign(&mut self, rhs: usize) {
                *self = *self - rhs
            }
        }
    };
}

impl_addr_ty!(VirtAddr);
impl_addr_ty!(PhysAddr);

/// Offset of the kernel's linear mapping of physical memory. Zero until
/// [`init_direct_map`] runs; the test harness installs an identity window
/// over its arena, the firmware installs the fixed DDR window.
static DIRECT_MAP_OFFSET: AtomicUsize = AtomicUsize::new(0);

/// Installs the phys-to-virt offset of the linear mapping.
///
/// # Safety
/// Must run once, before any allocation, with the whole physical memory
/// handed to the frame allocator actually mapped at `phys + offset`.
pub unsafe fn init_direct_map(offset: usize) {
    DIRECT_MAP_OFFSET.store(offset, Ordering::Release);
}

#[inline(always)]
fn direct_map_offset() -> usize {
    DIRECT_MAP_OFFSET.load(Ordering::Acquire)
}

impl VirtAddr {
    #[inline(always)]
    pub fn from_ptr<T: ?Sized>(value: *const T) -> Self {
        Self(value.addr())
    }

    #[inline(always)]
    pub const fn into_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// The physical address behind a linear-mapping address.
    #[inline(always)]
    pub fn into_phys(self) -> PhysAddr {
        PhysAddr(self.0 - direct_map_offset())
    }
}

impl PhysAddr {
    /// Where this physical address is visible through the linear mapping.
    #[inline(always)]
    pub fn into_virt(self) -> VirtAddr {
        VirtAddr(self.0 + direct_map_offset())
    }
}

impl<T> From<*const T> for VirtAddr {
    #[inline(always)]
    fn from(value: *const T) -> Self {
        Self::from_ptr(value)
    }
}

impl<T> From<*mut T> for VirtAddr {
    #[inline(always)]
    fn from(value: *mut T) -> Self {
        Self::from_ptr(value)
    }
}

/// Whether `addr` lies inside the kernel linear mapping (and therefore
/// translates without a page-table walk).
pub fn in_direct_map(addr: VirtAddr) -> bool {
    frame_allocator::phys_window().is_some_and(|(lo, hi)| {
        let off = direct_map_offset();
        addr.into_raw() >= lo.into_raw() + off && addr.into_raw() < hi.into_raw() + off
    })
}
