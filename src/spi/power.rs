//! Power-management IC: backlights, sound amplifier, power LED and the
//! shutdown request line, addressed through a one-byte register index
//! followed by a read or write of that register.

proc_bitfield::bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct RegIndex(pub u8): Debug {
        pub reg: u8 @ 0..=6,
        pub read: bool @ 7,
    }
}

proc_bitfield::bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Control(pub u8): Debug {
        pub sound_amplifier_enabled: bool @ 0,
        pub sound_amplifier_muted: bool @ 1,
        pub lower_backlight_enabled: bool @ 2,
        pub upper_backlight_enabled: bool @ 3,
        pub power_led_blinking: bool @ 4,
        pub power_led_blink_speed: bool @ 5,
        pub shutdown: bool @ 6,
    }
}

pub struct Power {
    is_ds_lite: bool,
    reg_mask: u8,
    cur_reg_index: RegIndex,
    control: Control,
    battery_low: bool,
    pub shutdown_requested: bool,
}

impl Power {
    pub fn new(is_ds_lite: bool) -> Self {
        Power {
            is_ds_lite,
            reg_mask: if is_ds_lite { 7 } else { 3 },
            cur_reg_index: RegIndex(0),
            control: Control(0),
            battery_low: false,
            shutdown_requested: false,
        }
    }

    #[inline]
    pub fn control(&self) -> Control {
        self.control
    }

    #[inline]
    pub fn battery_low(&self) -> bool {
        self.battery_low
    }

    #[inline]
    pub fn set_battery_low(&mut self, value: bool) {
        self.battery_low = value;
    }

    pub fn write_control(&mut self, value: Control) {
        self.control.0 = value.0 & if self.is_ds_lite { 0x7D } else { 0x7F };
        if value.shutdown() {
            self.shutdown_requested = true;
        }
    }

    /// `is_first` marks chip-select assert: the byte is a register
    /// index, not data.
    pub fn handle_byte(&mut self, value: u8, is_first: bool) -> u8 {
        if is_first {
            self.cur_reg_index = RegIndex(value);
            return 0;
        }
        let reg = self.cur_reg_index.reg() & self.reg_mask;
        if self.cur_reg_index.read() {
            match reg {
                0 => self.control.0,
                1 => self.battery_low as u8,
                _ => 0,
            }
        } else {
            match reg {
                0 => self.write_control(Control(value)),
                _ => {}
            }
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_bit_sets_request_flag() {
        let mut power = Power::new(false);
        power.handle_byte(RegIndex(0).with_read(false).0, true);
        power.handle_byte(Control(0).with_shutdown(true).0, false);
        assert!(power.shutdown_requested);
    }

    #[test]
    fn reading_control_register_returns_last_written_value() {
        let mut power = Power::new(false);
        power.handle_byte(RegIndex(0).with_read(false).0, true);
        power.handle_byte(Control(0).with_sound_amplifier_enabled(true).0, false);
        power.handle_byte(RegIndex(0).with_read(true).0, true);
        let out = power.handle_byte(0, false);
        assert_eq!(out & 1, 1);
    }
}
