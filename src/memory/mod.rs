//! Address decode and bank storage shared by both cores.
//!
//! `MemoryMap` owns every byte-addressable bank (main RAM, shared WRAM,
//! DSi New-WRAM, VRAM, BIOS images); MMIO reads/writes for `0x0400_0000`
//! and up are handed off to an [`MmioHandler`], implemented by the
//! top-level aggregate that actually owns the peripherals, since no
//! single component here can see DMA, timers, IPC and the rest at once
//! without a borrow-checker-hostile god struct.

pub mod fast_path;
pub mod vram;
pub mod wram;

use crate::cpu::arm7::WRAM_SIZE as ARM7_WRAM_SIZE;
use crate::cpu::interpreter::Bus;
use fast_path::FastPathTable;
use wram::SharedWram;

pub const MAIN_RAM_SIZE_DS: usize = 4 * 1024 * 1024;
pub const MAIN_RAM_SIZE_DSI: usize = 16 * 1024 * 1024;
pub const MAIN_RAM_WINDOW: usize = 8 * 1024 * 1024;

pub const ARM9_BIOS_SIZE: usize = 0x1000;
pub const ARM7_BIOS_SIZE: usize = 0x4000;

/// Handles MMIO register reads/writes for `0x0400_0000..0x0500_0000`. The
/// `is_arm9` flag lets one handler implementation branch on which CPU's
/// view of a shared register (e.g. IPCSYNC) is being accessed.
pub trait MmioHandler {
    fn read_mmio8(&mut self, addr: u32, is_arm9: bool) -> u8;
    fn read_mmio16(&mut self, addr: u32, is_arm9: bool) -> u16;
    fn read_mmio32(&mut self, addr: u32, is_arm9: bool) -> u32;
    fn write_mmio8(&mut self, addr: u32, value: u8, is_arm9: bool);
    fn write_mmio16(&mut self, addr: u32, value: u16, is_arm9: bool);
    fn write_mmio32(&mut self, addr: u32, value: u32, is_arm9: bool);
}

pub struct MemoryMap {
    pub main_ram: Vec<u8>,
    pub shared_wram: SharedWram,
    pub new_wram: wram::NewWram,
    pub vram: vram::Vram,
    pub bios7: Vec<u8>,
    pub bios9: Vec<u8>,
    pub fast_path7: FastPathTable,
    pub fast_path9: FastPathTable,
}

impl MemoryMap {
    pub fn new(is_dsi: bool) -> Self {
        let main_ram_size = if is_dsi {
            MAIN_RAM_SIZE_DSI
        } else {
            MAIN_RAM_SIZE_DS
        };
        MemoryMap {
            main_ram: vec![0; main_ram_size],
            shared_wram: SharedWram::new(),
            new_wram: wram::NewWram::new(),
            vram: vram::Vram::new(),
            bios7: vec![0; ARM7_BIOS_SIZE],
            bios9: vec![0; ARM9_BIOS_SIZE],
            fast_path7: FastPathTable::new(),
            fast_path9: FastPathTable::new(),
        }
    }

    #[inline]
    fn main_ram_index(&self, addr: u32) -> usize {
        (addr as usize & (MAIN_RAM_WINDOW - 1)) % self.main_ram.len()
    }
}

/// Rotates a misaligned word the way the ARM7TDMI/ARM9's load-word
/// pipeline does when the address isn't a multiple of 4.
#[inline]
fn rotate_misaligned_word(addr: u32, value: u32) -> u32 {
    value.rotate_right((addr & 3) * 8)
}

#[inline]
fn rotate_misaligned_half(addr: u32, value: u16) -> u16 {
    value.rotate_right((addr & 1) as u32 * 8)
}

/// Implements [`Bus`] for one CPU's view of the shared map: `is_arm9`
/// picks the shared-WRAM view and BIOS image, `private_wram` is the
/// ARM7's exclusive 64 KiB bank (`None` when called for the ARM9), and
/// `mmio` dispatches the `0x04xx_xxxx` window.
pub struct CpuBus<'a> {
    pub map: &'a mut MemoryMap,
    pub is_arm9: bool,
    pub arm7_private_wram: Option<&'a mut [u8; ARM7_WRAM_SIZE]>,
    pub mmio: &'a mut dyn MmioHandler,
}

impl<'a> CpuBus<'a> {
    /// Takes the WRAM bank directly, rather than all of `Arm7`, so a caller
    /// can simultaneously hand the other (disjoint) `Arm7` fields to `mmio`
    /// — e.g. an `MmioHandler` impl that reaches into `arm7.dma`/`arm7.irqs`
    /// to service DMA/IRQ registers while this `CpuBus` services the bus.
    pub fn for_arm7(
        map: &'a mut MemoryMap,
        wram: &'a mut [u8; ARM7_WRAM_SIZE],
        mmio: &'a mut dyn MmioHandler,
    ) -> Self {
        CpuBus {
            map,
            is_arm9: false,
            arm7_private_wram: Some(wram),
            mmio,
        }
    }

    pub fn for_arm9(map: &'a mut MemoryMap, mmio: &'a mut dyn MmioHandler) -> Self {
        CpuBus {
            map,
            is_arm9: true,
            arm7_private_wram: None,
            mmio,
        }
    }

    /// `VRAMCNT_A..I` and `WRAMCNT` configure banks owned outright by
    /// `self.map`, so they're decoded here rather than round-tripped
    /// through [`MmioHandler`]: that trait is for registers that need a
    /// peripheral outside the memory map, and these don't.
    fn write_map_control(&mut self, addr: u32, value: u8) -> bool {
        match addr {
            0x0400_0240..=0x0400_0246 => {
                let bank = vram::Bank::ALL[(addr - 0x0400_0240) as usize];
                self.map.vram.bank_mut(bank).write_control(vram::BankControl(value));
                true
            }
            0x0400_0247 => {
                self.map.shared_wram.write_control(wram::Control(value));
                true
            }
            0x0400_0248..=0x0400_0249 => {
                let bank = vram::Bank::ALL[(addr - 0x0400_0248 + 7) as usize];
                self.map.vram.bank_mut(bank).write_control(vram::BankControl(value));
                true
            }
            _ => false,
        }
    }

    fn read_map_control(&self, addr: u32) -> Option<u8> {
        match addr {
            0x0400_0240..=0x0400_0246 => {
                let bank = vram::Bank::ALL[(addr - 0x0400_0240) as usize];
                Some(self.map.vram.bank(bank).control().raw())
            }
            0x0400_0247 => Some(self.map.shared_wram.control().raw()),
            0x0400_0248..=0x0400_0249 => {
                let bank = vram::Bank::ALL[(addr - 0x0400_0248 + 7) as usize];
                Some(self.map.vram.bank(bank).control().raw())
            }
            _ => None,
        }
    }

    fn read_region8(&mut self, addr: u32) -> u8 {
        match addr >> 24 {
            0x00 | 0xFF if self.is_arm9 => {
                let idx = (addr as usize) % self.map.bios9.len();
                self.map.bios9[idx]
            }
            0x00 if !self.is_arm9 => {
                let idx = (addr as usize) % self.map.bios7.len();
                self.map.bios7[idx]
            }
            0x02 => {
                let idx = self.map.main_ram_index(addr);
                self.map.main_ram[idx]
            }
            0x03 => {
                if self.is_arm9 {
                    let view = self.map.shared_wram.arm9_view();
                    self.map.shared_wram.read8(view, addr as usize & 0x7FFF)
                } else if let Some(private) = self.arm7_private_wram.as_ref() {
                    let view = self.map.shared_wram.arm7_view();
                    if view.mask != 0 {
                        self.map.shared_wram.read8(view, addr as usize & 0x7FFF)
                    } else {
                        private[addr as usize & (ARM7_WRAM_SIZE - 1)]
                    }
                } else {
                    0
                }
            }
            0x06 => self.map.vram.lcdc_read8(addr),
            0x04 => self.read_map_control(addr).unwrap_or_else(|| self.mmio.read_mmio8(addr, self.is_arm9)),
            _ => 0,
        }
    }

    fn write_region8(&mut self, addr: u32, value: u8) {
        match addr >> 24 {
            0x00 | 0xFF => {} // BIOS is read-only
            0x02 => {
                let idx = self.map.main_ram_index(addr);
                self.map.main_ram[idx] = value;
            }
            0x03 => {
                if self.is_arm9 {
                    let view = self.map.shared_wram.arm9_view();
                    self.map.shared_wram.write8(view, addr as usize & 0x7FFF, value);
                } else if let Some(private) = self.arm7_private_wram.as_mut() {
                    let view = self.map.shared_wram.arm7_view();
                    if view.mask != 0 {
                        self.map.shared_wram.write8(view, addr as usize & 0x7FFF, value);
                    } else {
                        private[addr as usize & (ARM7_WRAM_SIZE - 1)] = value;
                    }
                }
            }
            0x06 => {} // VRAM writes routed through bank-specific handles, not the flat LCDC view
            0x04 => {
                if !self.write_map_control(addr, value) {
                    self.mmio.write_mmio8(addr, value, self.is_arm9);
                }
            }
            _ => {}
        }
    }
}

impl Bus for CpuBus<'_> {
    fn read8(&mut self, addr: u32) -> u8 {
        self.read_region8(addr)
    }

    fn read16(&mut self, addr: u32) -> u16 {
        let addr = addr & !1;
        if addr >> 24 == 0x04 {
            return self.mmio.read_mmio16(addr, self.is_arm9);
        }
        let lo = self.read_region8(addr) as u16;
        let hi = self.read_region8(addr.wrapping_add(1)) as u16;
        lo | (hi << 8)
    }

    fn read32(&mut self, addr: u32) -> u32 {
        let aligned = addr & !3;
        let value = if aligned >> 24 == 0x04 {
            self.mmio.read_mmio32(aligned, self.is_arm9)
        } else {
            let b0 = self.read_region8(aligned) as u32;
            let b1 = self.read_region8(aligned.wrapping_add(1)) as u32;
            let b2 = self.read_region8(aligned.wrapping_add(2)) as u32;
            let b3 = self.read_region8(aligned.wrapping_add(3)) as u32;
            b0 | (b1 << 8) | (b2 << 16) | (b3 << 24)
        };
        rotate_misaligned_word(addr, value)
    }

    fn write8(&mut self, addr: u32, value: u8) {
        self.write_region8(addr, value);
    }

    fn write16(&mut self, addr: u32, value: u16) {
        let addr = addr & !1;
        if addr >> 24 == 0x04 {
            self.mmio.write_mmio16(addr, value, self.is_arm9);
            return;
        }
        self.write_region8(addr, value as u8);
        self.write_region8(addr.wrapping_add(1), (value >> 8) as u8);
    }

    fn write32(&mut self, addr: u32, value: u32) {
        let addr = addr & !3;
        if addr >> 24 == 0x04 {
            self.mmio.write_mmio32(addr, value, self.is_arm9);
            return;
        }
        self.write_region8(addr, value as u8);
        self.write_region8(addr.wrapping_add(1), (value >> 8) as u8);
        self.write_region8(addr.wrapping_add(2), (value >> 16) as u8);
        self.write_region8(addr.wrapping_add(3), (value >> 24) as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullMmio;
    impl MmioHandler for NullMmio {
        fn read_mmio8(&mut self, _addr: u32, _is_arm9: bool) -> u8 {
            0
        }
        fn read_mmio16(&mut self, _addr: u32, _is_arm9: bool) -> u16 {
            0
        }
        fn read_mmio32(&mut self, _addr: u32, _is_arm9: bool) -> u32 {
            0
        }
        fn write_mmio8(&mut self, _addr: u32, _value: u8, _is_arm9: bool) {}
        fn write_mmio16(&mut self, _addr: u32, _value: u16, _is_arm9: bool) {}
        fn write_mmio32(&mut self, _addr: u32, _value: u32, _is_arm9: bool) {}
    }

    #[test]
    fn main_ram_round_trips_on_arm9() {
        let mut map = MemoryMap::new(false);
        let mut mmio = NullMmio;
        let mut bus = CpuBus::for_arm9(&mut map, &mut mmio);
        bus.write32(0x0200_1000, 0xDEAD_BEEF);
        assert_eq!(bus.read32(0x0200_1000), 0xDEAD_BEEF);
    }

    #[test]
    fn main_ram_mirrors_across_8mib_window() {
        let mut map = MemoryMap::new(false);
        let mut mmio = NullMmio;
        let mut bus = CpuBus::for_arm9(&mut map, &mut mmio);
        bus.write8(0x0200_0010, 0x55);
        assert_eq!(bus.read8(0x0240_0010), 0x55);
    }

    #[test]
    fn misaligned_word_read_rotates() {
        let mut map = MemoryMap::new(false);
        let mut mmio = NullMmio;
        let mut bus = CpuBus::for_arm9(&mut map, &mut mmio);
        bus.write32(0x0200_0000, 0x1122_3344);
        let value = bus.read32(0x0200_0001);
        assert_eq!(value, 0x1122_3344u32.rotate_right(8));
    }

    #[test]
    fn arm7_private_wram_used_when_shared_view_empty() {
        let mut map = MemoryMap::new(false);
        let mut wram = Box::new([0u8; ARM7_WRAM_SIZE]);
        let mut mmio = NullMmio;
        let mut bus = CpuBus::for_arm7(&mut map, &mut wram, &mut mmio);
        bus.write8(0x0380_0000, 7);
        assert_eq!(bus.read8(0x0380_0000), 7);
    }
}
