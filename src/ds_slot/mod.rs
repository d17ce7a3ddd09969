//! Cartridge engine: the command-driven ROM bus (`ROMCMD`/`ROMCTRL`/
//! `ROMDATA`) plus the save-RAM chip behind it and its background
//! flusher.

pub mod flusher;
pub mod rom;
pub mod save;

use flusher::Flusher;
use rom::{chip_id, Key1, Key2, Phase};
use save::{ChipKind, SaveChip};
use std::collections::VecDeque;
use std::path::PathBuf;

pub struct Cartridge {
    rom: Vec<u8>,
    phase: Phase,
    key1: Option<Key1>,
    key2: Option<Key2>,
    pending_words: VecDeque<u32>,
    save: Option<SaveChip>,
    flusher: Option<Flusher>,
}

impl Cartridge {
    /// `save_contents` is `None` for a cart with no save chip. `key_table`
    /// is the BIOS `0x30..0x1078` window, needed only to run the KEY1
    /// handshake; omit it (pass an empty slice) to keep the cart in the
    /// always-plaintext `Raw` phase, which is enough for homebrew ROMs
    /// that never issue the secure-area command.
    pub fn new(
        rom: Vec<u8>,
        gamecode: u32,
        key_table: &[u8],
        save_contents: Option<(ChipKind, Vec<u8>)>,
        save_path: Option<PathBuf>,
    ) -> Self {
        let key1 = if key_table.len() >= rom::KEY_BUF_LEN * 4 {
            Some(Key1::new(key_table, gamecode, 2))
        } else {
            None
        };
        let (save, flusher) = match save_contents {
            Some((kind, contents)) => {
                let flusher = save_path.map(|path| Flusher::spawn(path, contents.clone()));
                (Some(SaveChip::new(kind, contents)), flusher)
            }
            None => (None, None),
        };
        Cartridge {
            rom,
            phase: Phase::Raw,
            key1,
            key2: None,
            pending_words: VecDeque::new(),
            save,
            flusher,
        }
    }

    pub fn is_loaded(&self) -> bool {
        !self.rom.is_empty()
    }

    /// Raw cartridge bytes, for direct-boot setup that copies the ARM7/ARM9
    /// binaries into RAM without going through the `ROMCMD` protocol.
    pub fn rom(&self) -> &[u8] {
        &self.rom
    }

    fn rom_word(&self, addr: usize) -> u32 {
        if self.rom.is_empty() {
            return 0xFFFF_FFFF;
        }
        let addr = addr % self.rom.len().max(4);
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = *self.rom.get(addr + i).unwrap_or(&0xFF);
        }
        u32::from_le_bytes(bytes)
    }

    /// Handles an 8-byte command as written to `ROMCMD`, queuing
    /// `word_count` 4-byte words for subsequent `ROMDATA` reads.
    pub fn handle_command(&mut self, mut command: [u8; 8], word_count: u32) {
        if let Some(key1) = &self.key1 {
            if self.phase == Phase::Key1 {
                let hi = u32::from_be_bytes(command[0..4].try_into().unwrap());
                let lo = u32::from_be_bytes(command[4..8].try_into().unwrap());
                let (dhi, dlo) = key1.decrypt(hi, lo);
                command[0..4].copy_from_slice(&dhi.to_be_bytes());
                command[4..8].copy_from_slice(&dlo.to_be_bytes());
            }
        }

        self.pending_words.clear();
        if !self.is_loaded() {
            for _ in 0..word_count {
                self.pending_words.push_back(0xFFFF_FFFF);
            }
            return;
        }

        match command[0] {
            0x9F => {
                for _ in 0..word_count {
                    self.pending_words.push_back(0xFFFF_FFFF);
                }
            }
            0x00 => {
                // Get header: 0x200 bytes from ROM offset 0.
                for i in 0..word_count {
                    self.pending_words.push_back(self.rom_word(i as usize * 4));
                }
            }
            0x90 | 0x1C => {
                let id = chip_id(self.rom.len());
                for _ in 0..word_count {
                    self.pending_words.push_back(id);
                }
            }
            0x3C => {
                self.phase = Phase::Key1;
            }
            0xB7 => {
                let addr = u32::from_be_bytes([0, command[1], command[2], command[3]]) as usize;
                for i in 0..word_count {
                    self.pending_words.push_back(self.rom_word(addr + i as usize * 4));
                }
            }
            _ => {
                for _ in 0..word_count {
                    self.pending_words.push_back(0xFFFF_FFFF);
                }
            }
        }
    }

    /// Enters KEY2 mode once the BIOS has finished the KEY1 handshake;
    /// `seed_x`/`seed_y` are derived from the chip ID per the real
    /// handshake (see module docs on [`Key2`] for why they're caller
    /// supplied rather than hardcoded).
    pub fn enter_key2(&mut self, seed_x: u64, seed_y: u64) {
        self.phase = Phase::Key2;
        self.key2 = Some(Key2::new(seed_x, seed_y));
    }

    /// Pops the next word queued by the last `handle_command`, applying
    /// KEY2 if active. Returns `0xFFFF_FFFF` once the queue is drained
    /// (matching real hardware's "unknown command" all-ones fallback).
    pub fn read_data(&mut self) -> u32 {
        let word = self.pending_words.pop_front().unwrap_or(0xFFFF_FFFF);
        if let Some(key2) = &mut self.key2 {
            let mut bytes = word.to_le_bytes();
            key2.apply(&mut bytes);
            u32::from_le_bytes(bytes)
        } else {
            word
        }
    }

    pub fn save(&self) -> Option<&SaveChip> {
        self.save.as_ref()
    }

    pub fn save_mut(&mut self) -> Option<&mut SaveChip> {
        self.save.as_mut()
    }

    /// Routes one SPI byte to the save chip, requesting a background
    /// flush if the byte dirtied it.
    pub fn handle_save_byte(&mut self, value: u8, is_first: bool) -> u8 {
        let Some(save) = self.save.as_mut() else {
            return 0xFF;
        };
        let out = save.handle_byte(value, is_first);
        if save.dirty {
            save.dirty = false;
            if let Some(flusher) = &self.flusher {
                flusher.request_flush(save.contents());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unloaded_cart_returns_all_ones() {
        let mut cart = Cartridge::new(Vec::new(), 0, &[], None, None);
        cart.handle_command([0; 8], 2);
        assert_eq!(cart.read_data(), 0xFFFF_FFFF);
        assert_eq!(cart.read_data(), 0xFFFF_FFFF);
    }

    #[test]
    fn unknown_command_returns_declared_word_count_of_all_ones() {
        let mut cart = Cartridge::new(vec![0xAA; 0x1000], 0, &[], None, None);
        cart.handle_command([0x42, 0, 0, 0, 0, 0, 0, 0], 3);
        assert_eq!(cart.read_data(), 0xFFFF_FFFF);
        assert_eq!(cart.read_data(), 0xFFFF_FFFF);
        assert_eq!(cart.read_data(), 0xFFFF_FFFF);
    }

    #[test]
    fn header_command_reads_from_rom_start() {
        let mut rom = vec![0u8; 0x1000];
        rom[0..4].copy_from_slice(&0x1234_5678u32.to_le_bytes());
        let mut cart = Cartridge::new(rom, 0, &[], None, None);
        cart.handle_command([0x00, 0, 0, 0, 0, 0, 0, 0], 1);
        assert_eq!(cart.read_data(), 0x1234_5678);
    }
}
