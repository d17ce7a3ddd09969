//! CPSR/SPSR representation and the processor-mode register banks.

proc_bitfield::bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Psr(pub u32): Debug {
        pub raw: u32 @ ..,
        pub mode: u8 @ 0..=4,
        pub thumb_state: bool @ 5,
        pub fiqs_disabled: bool @ 6,
        pub irqs_disabled: bool @ 7,
        pub sticky_overflow: bool @ 27,
        pub overflow: bool @ 28,
        pub carry: bool @ 29,
        pub zero: bool @ 30,
        pub negative: bool @ 31,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    User = 0x10,
    Fiq = 0x11,
    Irq = 0x12,
    Supervisor = 0x13,
    Abort = 0x17,
    Undefined = 0x1B,
    System = 0x1F,
}

impl Mode {
    #[inline]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            0x10 => Mode::User,
            0x11 => Mode::Fiq,
            0x12 => Mode::Irq,
            0x13 => Mode::Supervisor,
            0x17 => Mode::Abort,
            0x1B => Mode::Undefined,
            0x1F => Mode::System,
            _ => return None,
        })
    }

    #[inline]
    pub const fn is_privileged(self) -> bool {
        !matches!(self, Mode::User)
    }

    #[inline]
    pub const fn has_spsr(self) -> bool {
        !matches!(self, Mode::User | Mode::System)
    }

    #[inline]
    pub const fn bank(self) -> Bank {
        match self {
            Mode::User | Mode::System => Bank::System,
            Mode::Fiq => Bank::Fiq,
            Mode::Irq => Bank::Irq,
            Mode::Supervisor => Bank::Supervisor,
            Mode::Abort => Bank::Abort,
            Mode::Undefined => Bank::Undefined,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bank {
    System,
    Fiq,
    Irq,
    Supervisor,
    Abort,
    Undefined,
}

impl Bank {
    pub const COUNT: usize = 6;

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl Psr {
    #[inline]
    pub const fn from_raw(value: u32) -> Self {
        Psr(value)
    }

    /// Bits 8-27 (8-26 on the ARM9) are forced to zero and bit 4 is forced
    /// to one, matching real hardware's partial-write behavior for MSR and
    /// exception entry.
    #[inline]
    pub fn masked(self, is_arm9: bool) -> Self {
        let keep_mask = if is_arm9 { 0xF800_00FF } else { 0xF000_00FF };
        Psr((self.0 & keep_mask) | 0x10)
    }

    #[inline]
    pub fn mode_enum(self) -> Mode {
        Mode::from_bits(self.mode()).unwrap_or(Mode::System)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips() {
        for m in [
            Mode::User,
            Mode::Fiq,
            Mode::Irq,
            Mode::Supervisor,
            Mode::Abort,
            Mode::Undefined,
            Mode::System,
        ] {
            assert_eq!(Mode::from_bits(m as u8), Some(m));
        }
    }

    #[test]
    fn user_and_system_share_reg_bank_but_no_spsr() {
        assert_eq!(Mode::User.bank(), Mode::System.bank());
        assert!(!Mode::User.has_spsr());
        assert!(!Mode::System.has_spsr());
        assert!(Mode::Irq.has_spsr());
    }
}
