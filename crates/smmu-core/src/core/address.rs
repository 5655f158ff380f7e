use super::macros::address_type;

/// Size of a base page in bytes.
pub const PAGE_SIZE: u64 = 0x1000;

/// Shift converting a frame number to an address.
pub const PAGE_SHIFT: u64 = 12;

/// Mask of the page offset bits.
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

address_type!(Gfn, "Guest Frame Number");
address_type!(Pfn, "Host Physical Frame Number");
address_type!(Gpa, "Guest Physical Address");
address_type!(Gva, "Guest Virtual Address (the faulting address)");
address_type!(Hva, "Host Virtual Address");

impl Gfn {
    /// Returns the guest physical address of the first byte of the frame.
    pub const fn gpa(self) -> Gpa {
        Gpa(self.0 << PAGE_SHIFT)
    }
}

impl Gpa {
    /// Returns the frame containing this address.
    pub const fn gfn(self) -> Gfn {
        Gfn(self.0 >> PAGE_SHIFT)
    }

    /// Returns the offset within the frame.
    pub const fn offset(self) -> u64 {
        self.0 & PAGE_OFFSET_MASK
    }
}

impl Gva {
    /// Returns the frame number of this address when the address is
    /// interpreted as guest physical (two-dimensional addressing).
    pub const fn as_gfn(self) -> Gfn {
        Gfn(self.0 >> PAGE_SHIFT)
    }
}

impl Hva {
    /// Returns the page-aligned address.
    pub const fn page(self) -> Hva {
        Hva(self.0 & !PAGE_OFFSET_MASK)
    }
}

impl From<Gpa> for Gva {
    fn from(value: Gpa) -> Self {
        Self(value.0)
    }
}
