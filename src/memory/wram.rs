//! Shared WRAM: 32 KiB split between the two CPUs under a 2-bit control
//! register, plus the DSi New-WRAM extension (256 KiB in 32 KiB slots,
//! each independently mapped to ARM7, ARM9, the DSP, or unmapped).

pub const SHARED_SIZE: usize = 0x8000;

proc_bitfield::bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Control(pub u8): Debug {
        pub layout: u8 @ 0..=1,
    }
}

/// Which half (or whole, or none) of shared WRAM a given CPU sees,
/// derived from [`Control::layout`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct View {
    pub base: usize,
    pub mask: usize,
}

const FULL: View = View { base: 0, mask: 0x7FFF };
const FIRST_HALF: View = View { base: 0, mask: 0x3FFF };
const SECOND_HALF: View = View {
    base: 0x4000,
    mask: 0x3FFF,
};
const NONE: View = View { base: 0, mask: 0 };

pub struct SharedWram {
    contents: Box<[u8; SHARED_SIZE]>,
    control: Control,
}

impl SharedWram {
    pub fn new() -> Self {
        SharedWram {
            contents: Box::new([0; SHARED_SIZE]),
            control: Control(0),
        }
    }

    #[inline]
    pub fn control(&self) -> Control {
        self.control
    }

    pub fn write_control(&mut self, value: Control) {
        self.control.set_raw(value.raw() & 0b11);
    }

    /// The view each CPU has of shared WRAM for the current layout.
    /// Layout 0: ARM9 sees the whole 32 KiB, ARM7 sees none (and falls
    /// back to its private WRAM). Layout 3: the inverse. Layouts 1/2
    /// split it into two 16 KiB halves.
    pub fn views(&self) -> (View, View) {
        match self.control.layout() {
            0 => (FULL, NONE),
            1 => (SECOND_HALF, FIRST_HALF),
            2 => (FIRST_HALF, SECOND_HALF),
            _ => (NONE, FULL),
        }
    }

    #[inline]
    pub fn arm9_view(&self) -> View {
        self.views().0
    }

    #[inline]
    pub fn arm7_view(&self) -> View {
        self.views().1
    }

    pub fn read8(&self, view: View, offset: usize) -> u8 {
        if view.mask == 0 {
            0
        } else {
            self.contents[view.base + (offset & view.mask)]
        }
    }

    pub fn write8(&mut self, view: View, offset: usize, value: u8) {
        if view.mask != 0 {
            self.contents[view.base + (offset & view.mask)] = value;
        }
    }
}

impl Default for SharedWram {
    fn default() -> Self {
        Self::new()
    }
}

/// One 32 KiB DSi New-WRAM slot's owner, set by one of the 5 NWRAMCNT-style
/// registers (one per slot, ARM7/ARM9/DSP selection plus write-protect).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotOwner {
    Unmapped,
    Arm7,
    Arm9,
    Dsp,
}

pub const NEW_WRAM_SLOT_SIZE: usize = 0x8000;
pub const NEW_WRAM_SLOT_COUNT: usize = 8;

pub struct NewWram {
    contents: Box<[u8; NEW_WRAM_SLOT_SIZE * NEW_WRAM_SLOT_COUNT]>,
    owners: [SlotOwner; NEW_WRAM_SLOT_COUNT],
    write_protected: [bool; NEW_WRAM_SLOT_COUNT],
}

impl NewWram {
    pub fn new() -> Self {
        NewWram {
            contents: Box::new([0; NEW_WRAM_SLOT_SIZE * NEW_WRAM_SLOT_COUNT]),
            owners: [SlotOwner::Unmapped; NEW_WRAM_SLOT_COUNT],
            write_protected: [false; NEW_WRAM_SLOT_COUNT],
        }
    }

    pub fn set_slot(&mut self, slot: usize, owner: SlotOwner, write_protected: bool) {
        self.owners[slot] = owner;
        self.write_protected[slot] = write_protected;
    }

    pub fn owner(&self, slot: usize) -> SlotOwner {
        self.owners[slot]
    }

    pub fn read8(&self, slot: usize, offset: usize) -> u8 {
        self.contents[slot * NEW_WRAM_SLOT_SIZE + (offset & (NEW_WRAM_SLOT_SIZE - 1))]
    }

    pub fn write8(&mut self, slot: usize, offset: usize, value: u8) {
        if !self.write_protected[slot] {
            self.contents[slot * NEW_WRAM_SLOT_SIZE + (offset & (NEW_WRAM_SLOT_SIZE - 1))] = value;
        }
    }
}

impl Default for NewWram {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_zero_gives_arm9_everything() {
        let wram = SharedWram::new();
        let (arm9, arm7) = wram.views();
        assert_eq!(arm9, FULL);
        assert_eq!(arm7, NONE);
    }

    #[test]
    fn layout_one_splits_in_half() {
        let mut wram = SharedWram::new();
        wram.write_control(Control(0).with_layout(1));
        let (arm9, arm7) = wram.views();
        assert_eq!(arm9, SECOND_HALF);
        assert_eq!(arm7, FIRST_HALF);
    }

    #[test]
    fn write_protected_slot_ignores_writes() {
        let mut wram = NewWram::new();
        wram.set_slot(0, SlotOwner::Arm7, true);
        wram.write8(0, 4, 0xAB);
        assert_eq!(wram.read8(0, 4), 0);
    }
}
