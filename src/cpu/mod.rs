//! ARM7TDMI and ARM946E-S interpreters and their shared register/IRQ/DMA
//! plumbing.

pub mod arm7;
pub mod arm9;
pub mod dma;
pub mod interpreter;
pub mod interrupt;
pub mod psr;
pub mod timers;

use psr::{Bank, Mode, Psr};

/// The 16 general registers plus banked copies for every privileged mode,
/// a one-instruction prefetch pair, and the halt state: the part of
/// `CpuState` (spec §3) that is identical in shape between the two cores.
pub struct Registers {
    /// r0..=r15, "live" view for the current mode (r13/r14 are swapped in
    /// from the active bank on mode switch).
    pub gpr: [u32; 16],
    pub cpsr: Psr,
    pub(crate) spsr_banks: [Psr; Bank::COUNT],
    /// r13 (SP) and r14 (LR) for every bank other than the active one.
    pub(crate) banked_r13_r14: [[u32; 2]; Bank::COUNT],
    pub(crate) fiq_r8_r12: [u32; 5],
    pub(crate) user_r8_r12: [u32; 5],
    /// Two-instruction prefetch: `[current, next]`. Flushed on any branch.
    pub pipeline: [u32; 2],
}

impl Registers {
    pub fn new() -> Self {
        Registers {
            gpr: [0; 16],
            cpsr: Psr(Mode::Supervisor as u32),
            spsr_banks: [Psr(Mode::Supervisor as u32); Bank::COUNT],
            banked_r13_r14: [[0; 2]; Bank::COUNT],
            fiq_r8_r12: [0; 5],
            user_r8_r12: [0; 5],
            pipeline: [0; 2],
        }
    }

    #[inline]
    pub fn mode(&self) -> Mode {
        self.cpsr.mode_enum()
    }

    #[inline]
    pub fn spsr(&self) -> Psr {
        self.spsr_banks[self.mode().bank().index()]
    }

    #[inline]
    pub fn write_spsr(&mut self, value: Psr) {
        let bank = self.mode().bank();
        if bank != Bank::System {
            self.spsr_banks[bank.index()] = value;
        }
    }

    /// Switches the live `r8..=r15` view to match `new_mode`'s bank,
    /// stashing the outgoing mode's banked copies first. CPSR itself is
    /// updated by the caller (this only swaps the register file).
    pub fn switch_mode(&mut self, new_mode: Mode) {
        let old_mode = self.mode();
        if old_mode == new_mode {
            return;
        }
        let old_bank = old_mode.bank();
        let new_bank = new_mode.bank();

        if old_bank == Bank::Fiq {
            self.fiq_r8_r12.copy_from_slice(&self.gpr[8..13]);
        } else {
            self.user_r8_r12.copy_from_slice(&self.gpr[8..13]);
        }
        self.banked_r13_r14[old_bank.index()] = [self.gpr[13], self.gpr[14]];

        if new_bank == Bank::Fiq {
            self.gpr[8..13].copy_from_slice(&self.fiq_r8_r12);
        } else {
            self.gpr[8..13].copy_from_slice(&self.user_r8_r12);
        }
        let [r13, r14] = self.banked_r13_r14[new_bank.index()];
        self.gpr[13] = r13;
        self.gpr[14] = r14;
    }

    /// Flush the prefetch pipeline after a taken branch or mode switch
    /// that changes the PC.
    #[inline]
    pub fn flush_pipeline(&mut self) {
        self.pipeline = [0, 0];
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banked_sp_survives_mode_round_trip() {
        let mut regs = Registers::new();
        regs.cpsr = Psr(Mode::Supervisor as u32);
        regs.gpr[13] = 0x0300_1000;
        regs.switch_mode(Mode::Irq);
        regs.gpr[13] = 0x0300_2000;
        regs.switch_mode(Mode::Supervisor);
        assert_eq!(regs.gpr[13], 0x0300_1000);
        regs.switch_mode(Mode::Irq);
        assert_eq!(regs.gpr[13], 0x0300_2000);
    }

    #[test]
    fn user_and_system_share_r8_r12() {
        let mut regs = Registers::new();
        regs.cpsr = Psr(Mode::User as u32);
        regs.gpr[8] = 42;
        regs.switch_mode(Mode::System);
        assert_eq!(regs.gpr[8], 42);
    }
}
