//! SPI bus: one `SPICNT`-selected device (firmware flash, touchscreen
//! ADC, power IC) at a time, each a byte-wise state machine behind its
//! own chip-select hold bit.

pub mod firmware;
pub mod power;
pub mod tsc;

use firmware::Firmware;
use power::Power;
use tsc::Tsc;

proc_bitfield::bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Control(pub u16): Debug {
        pub baud_rate: u8 @ 0..=1,
        pub busy: bool @ 7,
        pub device: u8 @ 8..=9,
        pub transfer_size: bool @ 10,
        pub hold: bool @ 11,
        pub irq_enabled: bool @ 14,
        pub enabled: bool @ 15,
    }
}

pub struct Bus {
    #[cfg(feature = "log")]
    logger: slog::Logger,
    control: Control,
    data_out: u8,
    firmware_hold: bool,
    pub firmware: Firmware,
    power_hold: bool,
    pub power: Power,
    touchscreen_hold: bool,
    pub tsc: Tsc,
}

impl Bus {
    pub fn new(
        firmware: Firmware,
        is_ds_lite: bool,
        #[cfg(feature = "log")] logger: slog::Logger,
    ) -> Self {
        Bus {
            #[cfg(feature = "log")]
            logger,
            control: Control(0),
            data_out: 0,
            firmware_hold: false,
            firmware,
            power_hold: false,
            power: Power::new(is_ds_lite),
            touchscreen_hold: false,
            tsc: Tsc::new(),
        }
    }

    #[inline]
    pub fn control(&self) -> Control {
        self.control
    }

    pub fn write_control(&mut self, value: Control) {
        if !value.enabled() && self.control.enabled() {
            self.firmware_hold = false;
            self.power_hold = false;
            self.touchscreen_hold = false;
        }
        self.control.0 = (self.control.0 & 0x0080) | (value.0 & 0xCF03);
    }

    #[inline]
    pub fn read_data(&self) -> u8 {
        self.data_out
    }

    /// Clears `busy`, called once the transfer's scheduled end-tick
    /// arrives, and raises the SPI IRQ if enabled.
    pub fn finish_transfer(&mut self, irqs: &mut crate::cpu::interrupt::InterruptController) {
        self.control.set_busy(false);
        if self.control.irq_enabled() {
            irqs.raise(SPI_IRQ);
        }
    }

    /// Returns the transfer's duration in half-cycles (8 bits at
    /// `8 << baud_rate` each), for the caller to schedule the
    /// matching [`Self::finish_transfer`] event.
    pub fn write_data(&mut self, value: u8) -> Option<u64> {
        if self.control.busy() || !self.control.enabled() {
            return None;
        }
        self.control.set_busy(true);
        self.data_out = match self.control.device() {
            0 => {
                let is_first = !self.power_hold;
                self.power_hold = self.control.hold();
                self.power.handle_byte(value, is_first)
            }
            1 => {
                let is_first = !self.firmware_hold;
                self.firmware_hold = self.control.hold();
                let is_last = !self.firmware_hold;
                self.firmware.handle_byte(value, is_first, is_last)
            }
            2 => {
                let is_first = !self.touchscreen_hold;
                self.touchscreen_hold = self.control.hold();
                self.tsc.handle_byte(value, is_first)
            }
            _ => {
                #[cfg(feature = "log")]
                slog::warn!(self.logger, "access to unknown SPI device 3");
                0
            }
        };
        Some(64 << self.control.baud_rate())
    }
}

const SPI_IRQ: u32 = 23;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Model;

    fn new_bus() -> Bus {
        Bus::new(
            Firmware::generate_default(Model::Lite),
            true,
            #[cfg(feature = "log")]
            slog::Logger::root(slog::Discard, slog::o!()),
        )
    }

    #[test]
    fn disabled_bus_ignores_writes() {
        let mut bus = new_bus();
        assert!(bus.write_data(0x05).is_none());
    }

    #[test]
    fn busy_flag_blocks_reentrant_writes_until_finished() {
        let mut bus = new_bus();
        bus.write_control(Control(0).with_enabled(true).with_device(2));
        assert!(bus.write_data(0x90).is_some());
        assert!(bus.write_data(0).is_none());
        let mut irqs = crate::cpu::interrupt::InterruptController::new(false);
        bus.finish_transfer(&mut irqs);
        assert!(bus.write_data(0).is_some());
    }

    #[test]
    fn turning_spi_off_clears_all_chip_select_holds() {
        let mut bus = new_bus();
        bus.write_control(Control(0).with_enabled(true).with_device(1).with_hold(true));
        bus.write_data(0x03);
        bus.write_control(Control(0).with_enabled(false));
        assert!(!bus.firmware_hold);
    }
}
