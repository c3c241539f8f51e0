//! Page table entry flags for software emulation.

/// Page table entry flags for software emulation.
///
/// This provides a simplified flag implementation for testing. Flags are stored
/// as a raw usize with specific bits representing different permissions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(usize);

impl PageFlags {
    /// Present bit (bit 0).
    const PRESENT: usize = 1 << 0;

    /// Writable bit (bit 1).
    const WRITABLE: usize = 1 << 1;

    /// User-accessible bit (bit 2).
    const USER: usize = 1 << 2;

    /// No-execute bit (bit 3).
    const NO_EXECUTE: usize = 1 << 3;

    /// Creates empty page flags (page not present).
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns the raw usize value of these flags.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns whether the present bit is set.
    pub fn is_present(self) -> bool {
        (self.0 & Self::PRESENT) != 0
    }

    /// Sets or clears the present bit.
    pub fn set_present(&mut self, present: bool) {
        self.set(Self::PRESENT, present);
    }

    /// Returns whether the writable bit is set.
    pub fn is_writable(self) -> bool {
        (self.0 & Self::WRITABLE) != 0
    }

    /// Sets or clears the writable bit.
    pub fn set_writable(&mut self, writable: bool) {
        self.set(Self::WRITABLE, writable);
    }

    /// Returns whether the user-accessible bit is set.
    pub fn is_user(self) -> bool {
        (self.0 & Self::USER) != 0
    }

    /// Sets or clears the user-accessible bit.
    pub fn set_user(&mut self, user: bool) {
        self.set(Self::USER, user);
    }

    /// Returns whether the no-execute bit is set.
    pub fn is_no_execute(self) -> bool {
        (self.0 & Self::NO_EXECUTE) != 0
    }

    /// Sets or clears the no-execute bit.
    pub fn set_no_execute(&mut self, no_execute: bool) {
        self.set(Self::NO_EXECUTE, no_execute);
    }

    fn set(&mut self, bit: usize, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

impl From<usize> for PageFlags {
    fn from(value: usize) -> Self {
        Self(value)
    }
}
