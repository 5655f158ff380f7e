use crate::{FaultErrorCode, Gfn, Gva};

/// An error that can occur when working with the shadow MMU.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MmuError {
    /// The host could not resolve the guest frame to a usable host frame.
    #[error("Bad host frame for gfn {gfn}")]
    BadFrame {
        /// The guest frame that failed to resolve.
        gfn: Gfn,
    },

    /// The host frame backing the guest frame is poisoned.
    #[error("Hardware-poisoned host frame for gfn {gfn}")]
    HwPoison {
        /// The guest frame backed by the poisoned host frame.
        gfn: Gfn,
    },

    /// A reserved-bit fault hit a shadow entry that is not an MMIO entry.
    #[error("Reserved bits set in shadow entry for {addr}")]
    ReservedBits {
        /// The faulting address.
        addr: Gva,
    },

    /// No shadow page could be reclaimed to make room for a new one.
    #[error("Out of shadow pages")]
    NoMemory,

    /// A structural invariant was violated.
    #[error("Invariant violation: {0}")]
    InvariantViolation(&'static str),

    /// The virtual machine was stopped after an invariant violation.
    #[error("The virtual machine is dead")]
    VmDead,

    /// Operation not supported.
    #[error("Operation not supported.")]
    NotSupported,

    /// Other error.
    #[error("{0}")]
    Other(&'static str),
}

impl MmuError {
    /// Checks if the error stops all further progress of the virtual machine.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_) | Self::VmDead)
    }
}

/// A fault the guest walker reports and the caller injects into the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuestFault {
    /// The faulting guest virtual address.
    pub address: Gva,

    /// The error code to deliver to the guest.
    pub error_code: FaultErrorCode,
}

impl From<(Gva, FaultErrorCode)> for GuestFault {
    fn from((address, error_code): (Gva, FaultErrorCode)) -> Self {
        Self {
            address,
            error_code,
        }
    }
}
