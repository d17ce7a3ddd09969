//! HLE BIOS SWI dispatch.
//!
//! Only a subset of titles ship with a BIOS dump attached to the save
//! directory; most runs rely on these high-level emulations of the ARM7
//! and ARM9 BIOS routines, keyed by the immediate operand in the `SWI`
//! instruction (ARM: bits 23..=16 of the opcode; Thumb: the 8-bit imm8).

/// Software-interrupt numbers implemented by HLE, shared by both cores
/// except where noted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Swi {
    SoftReset,
    RegisterRamReset,
    Halt,
    /// ARM7-only: drops into a lower power state than `Halt`, woken only
    /// by a restricted set of interrupt sources.
    CustomHalt,
    WaitByLoop,
    IntrWait,
    VBlankIntrWait,
    Divide,
    CpuSet,
    CpuFastSet,
    Sqrt,
    GetCrc16,
    BitUnPack,
    LZ77UnCompWram,
    LZ77UnCompVram,
    HuffUnComp,
    RLUnCompWram,
    RLUnCompVram,
    Diff8bitUnFilterWram,
    Diff16bitUnFilter,
    /// ARM7-only sound tables.
    GetSineTab,
    GetPitchTab,
    GetVolumeTab,
    SoundBias,
    Unknown(u8),
}

impl Swi {
    pub const fn decode(imm: u8, is_arm9: bool) -> Self {
        match imm {
            0x00 => Swi::SoftReset,
            0x01 => Swi::RegisterRamReset,
            0x02 | 0x03 if !is_arm9 && imm == 0x03 => Swi::CustomHalt,
            0x02 => Swi::Halt,
            0x03 => Swi::Halt,
            0x04 => Swi::IntrWait,
            0x05 => Swi::VBlankIntrWait,
            0x06 => Swi::Divide,
            0x09 => Swi::CpuSet,
            0x0A => Swi::CpuFastSet,
            0x0B => Swi::Sqrt,
            0x0E => Swi::GetCrc16,
            0x10 => Swi::BitUnPack,
            0x11 => Swi::LZ77UnCompWram,
            0x12 => Swi::LZ77UnCompVram,
            0x13 => Swi::HuffUnComp,
            0x14 => Swi::RLUnCompWram,
            0x15 => Swi::RLUnCompVram,
            0x16 => Swi::Diff8bitUnFilterWram,
            0x18 => Swi::Diff16bitUnFilter,
            0x1A if !is_arm9 => Swi::GetSineTab,
            0x1B if !is_arm9 => Swi::GetPitchTab,
            0x1C if !is_arm9 => Swi::GetVolumeTab,
            0x19 if !is_arm9 => Swi::SoundBias,
            0x1F if !is_arm9 => Swi::WaitByLoop,
            other => Swi::Unknown(other),
        }
    }
}

/// Per-core state the `IntrWait`/`VBlankIntrWait` HLE routines need beyond
/// the registers: the flags the caller asked to be notified about, so a
/// woken-then-re-halted wait can tell whether *its* condition (not some
/// unrelated IRQ) was satisfied. Lives in `CpuState` alongside the
/// register file, not in the interrupt controller, since it is purely an
/// HLE bookkeeping device with no hardware register backing it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IntrWaitState {
    pub waiting: bool,
    pub discard_current_flags: bool,
    pub wait_flags: u32,
}

impl IntrWaitState {
    /// Called at `IntrWait`/`VBlankIntrWait` entry. `discard_current_flags`
    /// mirrors r0's low bit: when set, flags already latched in `IF` before
    /// the wait began don't satisfy it, only a flag raised afterward does.
    pub fn begin(&mut self, discard_current_flags: bool, wait_flags: u32) {
        self.waiting = true;
        self.discard_current_flags = discard_current_flags;
        self.wait_flags = wait_flags;
    }

    /// Call on every IRQ acknowledge while `waiting`; returns whether the
    /// wait is now satisfied.
    pub fn notify(&mut self, fired: u32) -> bool {
        if !self.waiting {
            return false;
        }
        if fired & self.wait_flags != 0 {
            self.waiting = false;
            true
        } else {
            false
        }
    }
}

/// `SWI 0x06` (`Div`): ARM/DS BIOS signed division, returning
/// `(quotient, remainder, abs(quotient))`. Division by zero on real
/// hardware hangs or returns hardware-dependent garbage; HLE instead
/// saturates following the documented fallback most homebrew relies on.
pub fn divide(numerator: i32, denominator: i32) -> (i32, i32, u32) {
    if denominator == 0 {
        return (if numerator >= 0 { i32::MAX } else { i32::MIN }, numerator, numerator.unsigned_abs());
    }
    let quotient = numerator.wrapping_div(denominator);
    let remainder = numerator.wrapping_rem(denominator);
    (quotient, remainder, quotient.unsigned_abs())
}

/// `SWI 0x0B` (`Sqrt`): unsigned 32-bit integer square root.
pub fn sqrt(value: u32) -> u32 {
    (value as f64).sqrt() as u32
}

/// `SWI 0x0E` (`GetCRC16`): CCITT-style table-free CRC16 matching the BIOS
/// routine, reused verbatim by the firmware container's own checksum
/// (see [`crate::spi::firmware`]) since both derive from the same table.
pub fn get_crc16(mut crc: u16, data: &[u8]) -> u16 {
    const POLY: u16 = 0xA001;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_picks_divide() {
        assert_eq!(Swi::decode(0x06, true), Swi::Divide);
    }

    #[test]
    fn divide_by_zero_saturates() {
        let (q, r, _) = divide(10, 0);
        assert_eq!(q, i32::MAX);
        assert_eq!(r, 10);
    }

    #[test]
    fn divide_matches_euclidean_truncation() {
        let (q, r, abs_q) = divide(-7, 2);
        assert_eq!(q, -3);
        assert_eq!(r, -1);
        assert_eq!(abs_q, 3);
    }

    #[test]
    fn intr_wait_ignores_unrelated_irq() {
        let mut state = IntrWaitState::default();
        state.begin(false, 0b0001);
        assert!(!state.notify(0b0010));
        assert!(state.notify(0b0001));
    }

    #[test]
    fn crc16_matches_firmware_algorithm_on_known_vector() {
        assert_eq!(get_crc16(0xFFFF, &[]), 0xFFFF);
    }
}
