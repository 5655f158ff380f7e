use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Access rights granted by a translation.
    ///
    /// Read access is implied by presence and therefore not represented.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Access: u8 {
        /// Execute permission.
        const EXEC = 0b00000001;

        /// Write permission.
        const WRITE = 0b00000010;

        /// User-mode access permission.
        const USER = 0b00000100;

        /// Full access: Execute, Write and User.
        const ALL = Self::EXEC.bits() | Self::WRITE.bits() | Self::USER.bits();
    }
}

impl std::fmt::Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut result = [b'-'; 3];

        if self.contains(Access::USER) {
            result[0] = b'u';
        }
        if self.contains(Access::WRITE) {
            result[1] = b'w';
        }
        if self.contains(Access::EXEC) {
            result[2] = b'x';
        }

        // SAFETY: The `result` array is always valid UTF-8.
        f.write_str(unsafe { std::str::from_utf8_unchecked(&result) })
    }
}

bitflags::bitflags! {
    /// Page fault error code, as reported by the hardware.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct FaultErrorCode: u32 {
        /// The fault was caused by a present translation (protection fault).
        const PRESENT = 1 << 0;

        /// The access was a write.
        const WRITE = 1 << 1;

        /// The access came from user mode.
        const USER = 1 << 2;

        /// A reserved bit was set in a translation entry.
        const RSVD = 1 << 3;

        /// The access was an instruction fetch.
        const FETCH = 1 << 4;
    }
}

impl FaultErrorCode {
    /// Returns the access rights the faulting access requires.
    pub fn required_access(self) -> Access {
        let mut access = Access::empty();

        if self.contains(Self::WRITE) {
            access |= Access::WRITE;
        }
        if self.contains(Self::USER) {
            access |= Access::USER;
        }
        if self.contains(Self::FETCH) {
            access |= Access::EXEC;
        }

        access
    }

    /// Checks if the faulting access was a write.
    pub fn is_write(self) -> bool {
        self.contains(Self::WRITE)
    }
}
