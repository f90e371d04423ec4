//! Memory abstraction.
//!
//! Three address spaces meet in this kernel: host physical ([`Pa`]), host
//! virtual ([`Va`]) and guest physical ([`Gpa`]). They are distinct types so
//! that a guest-physical address can never be handed to the frame allocator
//! by accident. How a [`Pa`] becomes a dereferenceable [`Va`] is the
//! platform's business, see [`crate::PhysicalMemory::kva`].

/// Page size.
pub const PAGE_SIZE: usize = 0x1000;
/// Shift amount to get page index.
pub const PAGE_SHIFT: usize = 12;
/// Mask for page offset.
pub const PAGE_MASK: usize = 0xfff;

macro_rules! impl_page_ops {
    ($t: ty) => {
        impl $t {
            /// Cast into usize.
            #[inline]
            pub const fn into_usize(self) -> usize {
                self.0
            }

            /// Round down to the start of the containing page.
            #[inline]
            pub const fn page_down(self) -> Self {
                Self(self.0 & !PAGE_MASK)
            }

            /// Round up to the next page boundary.
            #[inline]
            pub const fn page_up(self) -> Self {
                Self((self.0 + PAGE_MASK) & !PAGE_MASK)
            }

            /// Offset within the containing page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & PAGE_MASK
            }

            /// Whether the address sits on a page boundary.
            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                self.0 & PAGE_MASK == 0
            }
        }
    };
}

/// Physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// PA with address 0.
    pub const ZERO: Self = Self(0);

    /// Create a new physical address with a check.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < 0x0010_0000_0000_0000 {
            Some(Self(addr))
        } else {
            None
        }
    }
}

/// Virtual address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// Create a new virtual address with a check.
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Address of a live object.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Raw pointer to the address.
    #[inline]
    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Get mutable reference of T underlying the Va.
    ///
    /// # Safety
    ///
    /// The address must be properly aligned for `T`, point to an initialized
    /// `T`, and no other reference to it may be alive for `'a`.
    #[inline]
    pub unsafe fn as_mut<'a, T>(&self) -> Option<&'a mut T> {
        (self.0 as *mut T).as_mut()
    }
}

/// Guest physical address.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Gpa(usize);

impl Gpa {
    /// Create a new guest physical address with a check.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < 0x0010_0000_0000_0000 {
            Some(Self(addr))
        } else {
            None
        }
    }
}

impl_page_ops!(Pa);
impl_page_ops!(Va);
impl_page_ops!(Gpa);

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 = self.0 + other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::SubAssign<usize> for $t {
            fn sub_assign(&mut self, other: usize) {
                self.0 = self.0 - other
            }
        }
        impl core::ops::BitOr<usize> for $t {
            type Output = Self;

            fn bitor(self, other: usize) -> Self {
                Self(self.0 | other)
            }
        }
        impl core::ops::BitOrAssign<usize> for $t {
            fn bitor_assign(&mut self, other: usize) {
                self.0 = self.0 | other;
            }
        }
        impl core::ops::BitAnd<usize> for $t {
            type Output = Self;

            fn bitand(self, other: usize) -> Self {
                Self(self.0 & other)
            }
        }
        impl core::ops::BitAndAssign<usize> for $t {
            fn bitand_assign(&mut self, other: usize) {
                self.0 = self.0 & other;
            }
        }
    };
}

impl_arith!(Va);
impl_arith!(Pa);
impl_arith!(Gpa);

macro_rules! impl_fmt {
    ($t: ty, $name: literal) => {
        impl core::fmt::Debug for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!($name, "(0x{:x})"), self.0)
            }
        }
        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!($name, "(0x{:x})"), self.0)
            }
        }
    };
}

impl_fmt!(Va, "Va");
impl_fmt!(Pa, "Pa");
impl_fmt!(Gpa, "Gpa");
