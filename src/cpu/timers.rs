//! Four 16-bit timers per CPU, with cascade mode and overflow-driven IRQs.
//!
//! Timers are advanced lazily: [`Timers::advance_all`] is called once per
//! scheduler tick and brings every running, non-cascaded timer forward by
//! the elapsed ticks (preserving any sub-prescaler remainder across calls),
//! raising the supplied callback for each full overflow. Cascaded timers
//! never advance on their own; they instead increment by one in their
//! predecessor's overflow handler.

use crate::scheduler::Tick;

proc_bitfield::bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Control(pub u8): Debug {
        pub prescaler: u8 @ 0..=1,
        pub cascade: bool @ 2,
        pub irq_enabled: bool @ 6,
        pub running: bool @ 7,
    }
}

const PRESCALER_SHIFT: [u8; 4] = [0, 6, 8, 10];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Index {
    T0 = 0,
    T1 = 1,
    T2 = 2,
    T3 = 3,
}

impl Index {
    pub const ALL: [Index; 4] = [Index::T0, Index::T1, Index::T2, Index::T3];

    #[inline]
    pub const fn get(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn prev(self) -> Option<Index> {
        match self {
            Index::T0 => None,
            Index::T1 => Some(Index::T0),
            Index::T2 => Some(Index::T1),
            Index::T3 => Some(Index::T2),
        }
    }
}

pub struct Timer {
    control: Control,
    reload: u16,
    counter: u16,
    last_update: Tick,
}

impl Timer {
    fn new() -> Self {
        Timer {
            control: Control(0),
            reload: 0,
            counter: 0,
            last_update: Tick(0),
        }
    }

    #[inline]
    pub fn control(&self) -> Control {
        self.control
    }

    #[inline]
    pub fn reload(&self) -> u16 {
        self.reload
    }

    #[inline]
    pub fn write_reload(&mut self, value: u16) {
        self.reload = value;
    }

    #[inline]
    pub fn counter(&self) -> u16 {
        self.counter
    }

    fn cycle_shift(&self) -> u8 {
        PRESCALER_SHIFT[self.control.prescaler() as usize]
    }
}

pub struct Timers {
    pub timers: [Timer; 4],
}

impl Default for Timers {
    fn default() -> Self {
        Self::new()
    }
}

impl Timers {
    pub fn new() -> Self {
        Timers {
            timers: [Timer::new(), Timer::new(), Timer::new(), Timer::new()],
        }
    }

    #[inline]
    pub fn timer(&self, i: Index) -> &Timer {
        &self.timers[i.get() as usize]
    }

    /// Advances a non-cascaded, running timer to `now`, returning the
    /// number of times it overflowed (0 if it didn't). Cascaded timers are
    /// never advanced directly; see [`Timers::cascade_increment`].
    fn advance(&mut self, i: Index, now: Tick) -> u32 {
        let timer = &mut self.timers[i.get() as usize];
        if !timer.control.running() || timer.control.cascade() {
            return 0;
        }
        let elapsed = now.checked_sub(timer.last_update).unwrap_or(0);
        if elapsed == 0 {
            return 0;
        }
        let shift = timer.cycle_shift();
        let increments = elapsed >> shift;
        if increments == 0 {
            return 0;
        }
        timer.last_update = timer.last_update + (increments << shift);
        let span = 0x1_0000 - timer.counter as u64;
        if increments < span {
            timer.counter += increments as u16;
            0
        } else {
            let past_first_overflow = increments - span;
            let reload_span = (0x1_0000 - timer.reload as u64).max(1);
            let extra_overflows = past_first_overflow / reload_span;
            timer.counter = timer
                .reload
                .wrapping_add((past_first_overflow % reload_span) as u16);
            1 + extra_overflows as u32
        }
    }

    /// Reads the live counter value, bringing the timer (and any
    /// non-cascaded predecessor it depends on for its tick source) up to
    /// date first. Safe to call from a debug/peek read since it only
    /// recomputes state already implied by elapsed real time.
    pub fn read_counter(&mut self, i: Index, now: Tick) -> u16 {
        self.advance(i, now);
        self.timers[i.get() as usize].counter
    }

    /// Restores a timer's full register state for a savestate load, without
    /// the running-edge side effect [`Self::write_control`] applies.
    pub fn restore(&mut self, i: Index, control: Control, reload: u16, counter: u16, now: Tick) {
        let timer = &mut self.timers[i.get() as usize];
        timer.control = control;
        timer.reload = reload;
        timer.counter = counter;
        timer.last_update = now;
    }

    pub fn write_control(&mut self, i: Index, mut value: Control, now: Tick) {
        value.set_raw(value.raw() & 0xC7);
        self.advance(i, now);
        let timer = &mut self.timers[i.get() as usize];
        let was_running = timer.control.running();
        if value.running() && !was_running {
            timer.counter = timer.reload;
            timer.last_update = now;
        }
        timer.control = value;
    }

    /// Runs every timer forward to `now`, applying cascaded increments in
    /// ascending order and raising `irq` for each that both overflowed and
    /// has its IRQ enabled. `irq` receives the timer index that fired.
    pub fn advance_all(&mut self, now: Tick, mut irq: impl FnMut(Index)) {
        for i in Index::ALL {
            let overflows = self.advance(i, now);
            if overflows > 0 && self.timers[i.get() as usize].control.irq_enabled() {
                irq(i);
            }
            if overflows > 0 {
                if let Some(next) = match i {
                    Index::T0 => Some(Index::T1),
                    Index::T1 => Some(Index::T2),
                    Index::T2 => Some(Index::T3),
                    Index::T3 => None,
                } {
                    self.cascade_increment(next, overflows, now, &mut irq);
                }
            }
        }
    }

    fn cascade_increment(&mut self, i: Index, by: u32, now: Tick, irq: &mut impl FnMut(Index)) {
        let timer = &mut self.timers[i.get() as usize];
        if !timer.control.running() || !timer.control.cascade() {
            return;
        }
        let span = (0x1_0000 - timer.reload as u64).max(1);
        let total = timer.counter as u64 + by as u64;
        let overflows = if total >= 0x1_0000 {
            let past = total - 0x1_0000;
            timer.counter = timer.reload.wrapping_add((past % span) as u16);
            1 + (past / span) as u32
        } else {
            timer.counter = total as u16;
            0
        };
        timer.last_update = now;
        if overflows > 0 {
            if timer.control.irq_enabled() {
                irq(i);
            }
            if let Some(next) = match i {
                Index::T0 => Some(Index::T1),
                Index::T1 => Some(Index::T2),
                Index::T2 => Some(Index::T3),
                Index::T3 => None,
            } {
                self.cascade_increment(next, overflows, now, irq);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prescaler_1024_overflows_after_exactly_1024_ticks() {
        let mut t = Timers::new();
        t.timers[0].reload = 0xFFFF;
        t.write_control(
            Index::T0,
            Control(0).with_running(true).with_prescaler(3),
            Tick(0),
        );
        let mut overflowed = false;
        t.advance_all(Tick(1023), |_| overflowed = true);
        assert!(!overflowed);
        t.advance_all(Tick(1024), |i| {
            assert_eq!(i, Index::T0);
            overflowed = true;
        });
        assert!(overflowed);
    }

    #[test]
    fn cascade_increments_on_predecessor_overflow() {
        let mut t = Timers::new();
        t.timers[0].reload = 0xFFFF;
        t.write_control(Index::T0, Control(0).with_running(true), Tick(0));
        t.write_control(
            Index::T1,
            Control(0).with_running(true).with_cascade(true),
            Tick(0),
        );
        t.advance_all(Tick(1), |_| {});
        assert_eq!(t.read_counter(Index::T1, Tick(1)), 1);
    }
}
