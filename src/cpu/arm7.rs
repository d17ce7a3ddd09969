//! The ARM7TDMI core: `Registers` plus its private 64KiB WRAM, DMA, timer
//! and interrupt controller instances, and the HLE wait-state bookkeeping
//! `IntrWait` needs.

use super::dma;
use super::interpreter::swi::IntrWaitState;
use super::interrupt::InterruptController;
use super::psr::Psr;
use super::timers::Timers;
use super::Registers;
use crate::scheduler::Tick;

pub const WRAM_SIZE: usize = 0x1_0000;

pub struct Arm7 {
    #[cfg(feature = "log")]
    pub logger: slog::Logger,
    pub regs: Registers,
    pub wram: Box<[u8; WRAM_SIZE]>,
    pub dma: dma::Controller,
    pub timers: Timers,
    pub irqs: InterruptController,
    pub intr_wait: IntrWaitState,
    pub halted: bool,
    last_update: Tick,
}

impl Arm7 {
    /// `has_extended_irqs` is set for the DSi, which adds an `IE2`/`IF2`
    /// pair to this core's controller for its NDMA and microphone sources.
    pub fn new(#[cfg(feature = "log")] logger: slog::Logger, has_extended_irqs: bool) -> Self {
        Arm7 {
            #[cfg(feature = "log")]
            logger,
            regs: Registers::new(),
            wram: Box::new([0; WRAM_SIZE]),
            dma: dma::Controller::new(0x07FF_FFFF, 0x07FF_FFFF),
            timers: Timers::new(),
            irqs: InterruptController::new(has_extended_irqs),
            intr_wait: IntrWaitState::default(),
            halted: false,
            last_update: Tick(0),
        }
    }

    pub fn reset(&mut self, entry_addr: u32) {
        self.regs = Registers::new();
        self.regs.gpr[15] = entry_addr;
        self.regs.cpsr = Psr(super::psr::Mode::Supervisor as u32);
        self.regs.flush_pipeline();
        self.halted = false;
        self.intr_wait = IntrWaitState::default();
    }

    /// Advances the timer bank to `now`, raising any IRQs the timers fired
    /// through the interrupt controller. Timer overflow IRQ bits are
    /// `IrqFlags::timer{0..=3}`, i.e. bit index `3 + timer index`.
    pub fn advance_timers(&mut self, now: Tick) {
        let irqs = &mut self.irqs;
        self.timers.advance_all(now, |i| irqs.raise(3 + i.get() as u32));
        self.last_update = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_cpu() -> Arm7 {
        #[cfg(feature = "log")]
        {
            Arm7::new(slog::Logger::root(slog::Discard, slog::o!()), false)
        }
        #[cfg(not(feature = "log"))]
        {
            Arm7::new(false)
        }
    }

    #[test]
    fn reset_enters_supervisor_mode_at_entry() {
        let mut cpu = new_cpu();
        cpu.reset(0x0800_0000);
        assert_eq!(cpu.regs.gpr[15], 0x0800_0000);
        assert_eq!(cpu.regs.mode(), super::psr::Mode::Supervisor);
    }
}
