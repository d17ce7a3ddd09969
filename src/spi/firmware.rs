//! Firmware container: the flash image backing the SPI firmware chip,
//! holding Wi-Fi config, up to 3 access-point profiles, and two redundant
//! user-settings blocks the console alternates between on every save (so
//! a power loss mid-write never corrupts both).
//!
//! CRC layout and the counter-wraparound rule for picking the newer user
//! settings block are grounded on the teacher's `spi::firmware` module;
//! the bit-reflected CRC16 itself is the same `POLY = 0xA001` algorithm
//! used by the HLE `GetCRC16` BIOS call in [`crate::cpu::interpreter::swi`].

use crate::Model;

pub const WIFI_CRC_LEN_OFFSET: usize = 0x2C;
pub const WIFI_CRC_STORED_OFFSET: usize = 0x2A;
pub const CONSOLE_TYPE_OFFSET: usize = 0x1D;
pub const DSI_CONSOLE_TYPE: u8 = 0x57;
pub const USER_SETTINGS_OFFSET_PTR: usize = 0x20;
pub const USER_SLOT_SIZE: usize = 0x100;
pub const USER_DATA_LEN: usize = 0x70;
pub const USER_COUNTER_OFFSET: usize = 0x70;
pub const USER_CRC_OFFSET: usize = 0x72;
pub const USER_EXTENDED_FLAG_OFFSET: usize = 0x74;
pub const USER_EXTENDED_CRC_LEN: usize = 0x8A;
pub const USER_EXTENDED_CRC_OFFSET: usize = 0xFE;

/// Access-point table: 3 plain slots immediately below the user-settings
/// pair, each independently CRC'd.
pub const AP_REGION_OFFSET_FROM_USER_DATA: usize = 0x400;
pub const AP_SLOT_SIZE: usize = 0x100;
pub const AP_SLOT_COUNT: usize = 3;
pub const AP_CRC_LEN: usize = 0xFE;
pub const AP_CRC_OFFSET: usize = 0xFE;

/// DSi-only extended access-point table: 3 slots, each a plain AP slot
/// followed by 0xFE bytes of extended data with its own CRC.
pub const EXTENDED_AP_REGION_OFFSET_FROM_USER_DATA: usize = 0xA00;
pub const EXTENDED_AP_SLOT_SIZE: usize = 0x200;
pub const EXTENDED_AP_DATA_OFFSET: usize = 0x100;
pub const EXTENDED_AP_CRC_LEN: usize = 0xFE;
pub const EXTENDED_AP_CRC_OFFSET: usize = 0x1FE;

fn crc16(init: u16, bytes: &[u8]) -> u16 {
    crate::cpu::interpreter::swi::get_crc16(init, bytes)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerificationRegion {
    Wifi,
    User0,
    User1,
    ExtendedUser0,
    ExtendedUser1,
    AccessPoint(usize),
    ExtendedAccessPoint(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    IncorrectSize { expected_power_of_two_range: (usize, usize), got: usize },
    IncorrectCrc16 { region: VerificationRegion, calculated: u16, expected: u16 },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IncorrectSize { expected_power_of_two_range, got } => write!(
                f,
                "firmware size {got} is not a power of two in {:?}",
                expected_power_of_two_range
            ),
            Error::IncorrectCrc16 { region, calculated, expected } => write!(
                f,
                "{region:?} CRC16 mismatch: calculated {calculated:#06x}, stored {expected:#06x}"
            ),
        }
    }
}

impl std::error::Error for Error {}

pub fn is_valid_size(len: usize) -> bool {
    len.is_power_of_two() && (0x2_0000..=0x8_0000).contains(&len)
}

fn read_le_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn write_le_u16(bytes: &mut [u8], offset: usize, value: u16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

proc_bitfield::bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Status(pub u8): Debug {
        pub write_in_progress: bool @ 0,
        pub write_enabled: bool @ 1,
    }
}

pub struct Firmware {
    bytes: Vec<u8>,
    status: Status,
    cur_command: u8,
    cur_command_pos: u8,
    cur_addr: u32,
    pub contents_dirty: bool,
}

impl Firmware {
    pub fn load_from_bytes(bytes: Vec<u8>) -> Result<Self, Error> {
        if !is_valid_size(bytes.len()) {
            return Err(Error::IncorrectSize {
                expected_power_of_two_range: (0x2_0000, 0x8_0000),
                got: bytes.len(),
            });
        }
        Ok(Firmware {
            bytes,
            status: Status(0),
            cur_command: 0,
            cur_command_pos: 0,
            cur_addr: 0,
            contents_dirty: false,
        })
    }

    /// Processes one byte of the SPI flash protocol (READ/FAST_READ,
    /// RDSR, WREN/WRDI, PP, SE, CE), mirroring the save-RAM chip's
    /// byte-wise command dispatch in [`crate::ds_slot::save`].
    pub fn handle_byte(&mut self, value: u8, is_first: bool, is_last: bool) -> u8 {
        if is_first {
            self.cur_command = value;
            self.cur_command_pos = 0;
        }
        let len_mask = (self.bytes.len() - 1) as u32;
        match self.cur_command {
            0x06 => {
                self.status.set_write_enabled(true);
                0xFF
            }
            0x04 => {
                self.status.set_write_enabled(false);
                0xFF
            }
            0x05 => self.status.raw(),
            0x03 | 0x0B => {
                let data_start = 3 + u8::from(self.cur_command == 0x0B);
                if self.cur_command_pos < 3 {
                    self.cur_addr = ((self.cur_addr << 8) | value as u32) & len_mask;
                    self.cur_command_pos += 1;
                    0xFF
                } else if self.cur_command_pos < data_start {
                    self.cur_command_pos += 1;
                    0xFF
                } else {
                    let out = self.bytes[self.cur_addr as usize];
                    self.cur_addr = self.cur_addr.wrapping_add(1) & len_mask;
                    out
                }
            }
            0x02 => {
                if self.cur_command_pos < 3 {
                    self.cur_addr = ((self.cur_addr << 8) | value as u32) & len_mask;
                    self.cur_command_pos += 1;
                } else if self.status.write_enabled() {
                    self.bytes[self.cur_addr as usize] = value;
                    self.cur_addr = self.cur_addr.wrapping_add(1) & len_mask;
                    self.contents_dirty = true;
                    if is_last {
                        self.update_checksums();
                    }
                }
                0xFF
            }
            0xD8 => {
                // Sector erase: 3-byte address selects a 64 KiB sector.
                if self.cur_command_pos < 3 {
                    self.cur_addr = ((self.cur_addr << 8) | value as u32) & len_mask;
                    self.cur_command_pos += 1;
                    if self.cur_command_pos == 3 && self.status.write_enabled() {
                        let sector_base = (self.cur_addr & !0xFFFF) as usize;
                        let sector_len = 0x1_0000.min(self.bytes.len());
                        self.bytes[sector_base..sector_base + sector_len].fill(0xFF);
                        self.contents_dirty = true;
                    }
                }
                0xFF
            }
            0xC7 => {
                if self.status.write_enabled() {
                    self.bytes.fill(0xFF);
                    self.contents_dirty = true;
                }
                0xFF
            }
            _ => 0xFF,
        }
    }

    /// Builds a minimal but CRC-consistent firmware image: empty AP
    /// slots, one valid user-settings block at counter 0, checksums
    /// already up to date.
    pub fn generate_default(model: Model) -> Self {
        let len = if model.is_dsi() { 0x2_0000 } else { 0x4_0000 };
        let mut bytes = vec![0u8; len];
        let masked_offset = 0x7_FE00 & (len - 1);
        write_le_u16(&mut bytes, USER_SETTINGS_OFFSET_PTR, (masked_offset >> 3) as u16);
        if model.is_dsi() {
            bytes[CONSOLE_TYPE_OFFSET] = DSI_CONSOLE_TYPE;
        }
        let mut fw = Firmware {
            bytes,
            status: Status(0),
            cur_command: 0,
            cur_command_pos: 0,
            cur_addr: 0,
            contents_dirty: false,
        };
        fw.update_checksums();
        fw
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn user_settings_base(&self) -> usize {
        (read_le_u16(&self.bytes, USER_SETTINGS_OFFSET_PTR) as usize) << 3
    }

    fn user_slot_range(&self, slot: usize) -> std::ops::Range<usize> {
        let base = self.user_settings_base() + slot * USER_SLOT_SIZE;
        base..base + USER_SLOT_SIZE
    }

    fn user_slot_valid(&self, slot: usize) -> bool {
        let range = self.user_slot_range(slot);
        if range.end > self.bytes.len() {
            return false;
        }
        let data = &self.bytes[range.start..range.start + USER_DATA_LEN];
        let expected = read_le_u16(&self.bytes, range.start + USER_CRC_OFFSET);
        crc16(0xFFFF, data) == expected
    }

    fn user_slot_counter(&self, slot: usize) -> u16 {
        let range = self.user_slot_range(slot);
        read_le_u16(&self.bytes, range.start + USER_COUNTER_OFFSET)
    }

    /// Picks the newer of the two user-settings blocks, following the
    /// same wraparound-aware comparison the original firmware loader
    /// uses: block 1 is newer only if its counter is exactly one past
    /// block 0's (mod 128), otherwise block 0 wins. Falls back to
    /// whichever block passes its CRC if the other doesn't.
    pub fn effective_user_data(&self) -> &[u8] {
        let valid0 = self.user_slot_valid(0);
        let valid1 = self.user_slot_valid(1);
        let use_slot1 = if valid0 && valid1 {
            let c0 = self.user_slot_counter(0);
            let c1 = self.user_slot_counter(1);
            c1 == (c0.wrapping_add(1)) & 0x7F
        } else {
            valid1 && !valid0
        };
        let slot = usize::from(use_slot1);
        let range = self.user_slot_range(slot);
        &self.bytes[range.start..range.start + USER_DATA_LEN]
    }

    pub fn effective_user_data_counter(&self) -> u16 {
        let valid0 = self.user_slot_valid(0);
        let valid1 = self.user_slot_valid(1);
        let use_slot1 = if valid0 && valid1 {
            let c0 = self.user_slot_counter(0);
            let c1 = self.user_slot_counter(1);
            c1 == (c0.wrapping_add(1)) & 0x7F
        } else {
            valid1 && !valid0
        };
        self.user_slot_counter(usize::from(use_slot1))
    }

    fn is_dsi(&self) -> bool {
        self.bytes.get(CONSOLE_TYPE_OFFSET).copied() == Some(DSI_CONSOLE_TYPE)
    }

    fn ap_slot_range(&self, slot: usize) -> Option<std::ops::Range<usize>> {
        let base = self
            .user_settings_base()
            .checked_sub(AP_REGION_OFFSET_FROM_USER_DATA)?
            + slot * AP_SLOT_SIZE;
        let end = base + AP_SLOT_SIZE;
        (end <= self.bytes.len()).then_some(base..end)
    }

    fn extended_ap_slot_range(&self, slot: usize) -> Option<std::ops::Range<usize>> {
        let base = self
            .user_settings_base()
            .checked_sub(EXTENDED_AP_REGION_OFFSET_FROM_USER_DATA)?
            + slot * EXTENDED_AP_SLOT_SIZE;
        let end = base + EXTENDED_AP_SLOT_SIZE;
        (end <= self.bytes.len()).then_some(base..end)
    }

    /// Recomputes every stored CRC field from its covered byte range;
    /// idempotent.
    pub fn update_checksums(&mut self) {
        let wifi_len = read_le_u16(&self.bytes, WIFI_CRC_LEN_OFFSET) as usize;
        if WIFI_CRC_LEN_OFFSET + wifi_len <= self.bytes.len() {
            let crc = crc16(0, &self.bytes[WIFI_CRC_LEN_OFFSET..WIFI_CRC_LEN_OFFSET + wifi_len]);
            write_le_u16(&mut self.bytes, WIFI_CRC_STORED_OFFSET, crc);
        }
        for slot in 0..AP_SLOT_COUNT {
            if let Some(range) = self.ap_slot_range(slot) {
                let crc = crc16(0, &self.bytes[range.start..range.start + AP_CRC_LEN]);
                write_le_u16(&mut self.bytes, range.start + AP_CRC_OFFSET, crc);
            }
        }
        if self.is_dsi() {
            for slot in 0..AP_SLOT_COUNT {
                if let Some(range) = self.extended_ap_slot_range(slot) {
                    let crc = crc16(0, &self.bytes[range.start..range.start + AP_CRC_LEN]);
                    write_le_u16(&mut self.bytes, range.start + AP_CRC_OFFSET, crc);
                    let ext_start = range.start + EXTENDED_AP_DATA_OFFSET;
                    let crc = crc16(0, &self.bytes[ext_start..ext_start + EXTENDED_AP_CRC_LEN]);
                    write_le_u16(&mut self.bytes, range.start + EXTENDED_AP_CRC_OFFSET, crc);
                }
            }
        }
        for slot in 0..2 {
            let range = self.user_slot_range(slot);
            if range.end > self.bytes.len() {
                continue;
            }
            let data_end = range.start + USER_DATA_LEN;
            let crc = crc16(0xFFFF, &self.bytes[range.start..data_end]);
            write_le_u16(&mut self.bytes, range.start + USER_CRC_OFFSET, crc);
            if self.bytes[range.start + USER_EXTENDED_FLAG_OFFSET] == 1 {
                let ext_start = range.start + USER_EXTENDED_FLAG_OFFSET;
                let crc = crc16(0xFFFF, &self.bytes[ext_start..ext_start + USER_EXTENDED_CRC_LEN]);
                write_le_u16(&mut self.bytes, range.start + USER_EXTENDED_CRC_OFFSET, crc);
            }
        }
    }

    pub fn verify(&self) -> Result<(), Error> {
        if !is_valid_size(self.bytes.len()) {
            return Err(Error::IncorrectSize {
                expected_power_of_two_range: (0x2_0000, 0x8_0000),
                got: self.bytes.len(),
            });
        }
        let wifi_len = read_le_u16(&self.bytes, WIFI_CRC_LEN_OFFSET) as usize;
        let calculated = crc16(0, &self.bytes[WIFI_CRC_LEN_OFFSET..WIFI_CRC_LEN_OFFSET + wifi_len]);
        let expected = read_le_u16(&self.bytes, WIFI_CRC_STORED_OFFSET);
        if calculated != expected {
            return Err(Error::IncorrectCrc16 {
                region: VerificationRegion::Wifi,
                calculated,
                expected,
            });
        }
        for slot in 0..AP_SLOT_COUNT {
            if let Some(range) = self.ap_slot_range(slot) {
                let calculated = crc16(0, &self.bytes[range.start..range.start + AP_CRC_LEN]);
                let expected = read_le_u16(&self.bytes, range.start + AP_CRC_OFFSET);
                if calculated != expected {
                    return Err(Error::IncorrectCrc16 {
                        region: VerificationRegion::AccessPoint(slot),
                        calculated,
                        expected,
                    });
                }
            }
        }
        if self.is_dsi() {
            for slot in 0..AP_SLOT_COUNT {
                if let Some(range) = self.extended_ap_slot_range(slot) {
                    let ext_start = range.start + EXTENDED_AP_DATA_OFFSET;
                    let calculated = crc16(0, &self.bytes[ext_start..ext_start + EXTENDED_AP_CRC_LEN]);
                    let expected = read_le_u16(&self.bytes, range.start + EXTENDED_AP_CRC_OFFSET);
                    if calculated != expected {
                        return Err(Error::IncorrectCrc16 {
                            region: VerificationRegion::ExtendedAccessPoint(slot),
                            calculated,
                            expected,
                        });
                    }
                }
            }
        }
        for (slot, region) in [(0, VerificationRegion::User0), (1, VerificationRegion::User1)] {
            let range = self.user_slot_range(slot);
            let data = &self.bytes[range.start..range.start + USER_DATA_LEN];
            let calculated = crc16(0xFFFF, data);
            let expected = read_le_u16(&self.bytes, range.start + USER_CRC_OFFSET);
            if calculated != expected {
                return Err(Error::IncorrectCrc16 { region, calculated, expected });
            }
            if self.bytes[range.start + USER_EXTENDED_FLAG_OFFSET] == 1 {
                let ext_start = range.start + USER_EXTENDED_FLAG_OFFSET;
                let calculated = crc16(0xFFFF, &self.bytes[ext_start..ext_start + USER_EXTENDED_CRC_LEN]);
                let expected = read_le_u16(&self.bytes, range.start + USER_EXTENDED_CRC_OFFSET);
                if calculated != expected {
                    return Err(Error::IncorrectCrc16 {
                        region: if slot == 0 {
                            VerificationRegion::ExtendedUser0
                        } else {
                            VerificationRegion::ExtendedUser1
                        },
                        calculated,
                        expected,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_checksums_is_idempotent() {
        let mut fw = Firmware::generate_default(Model::Lite);
        let before = fw.bytes().to_vec();
        fw.update_checksums();
        assert_eq!(fw.bytes(), before.as_slice());
        assert!(fw.verify().is_ok());
    }

    #[test]
    fn effective_user_data_prefers_higher_counter_when_not_adjacent() {
        let mut fw = Firmware::generate_default(Model::Lite);
        let base = fw.user_settings_base();
        write_le_u16(&mut fw.bytes, base + USER_COUNTER_OFFSET, 5);
        write_le_u16(&mut fw.bytes, base + USER_SLOT_SIZE + USER_COUNTER_OFFSET, 3);
        fw.update_checksums();
        assert_eq!(fw.effective_user_data_counter(), 5);
    }

    #[test]
    fn effective_user_data_follows_wraparound_adjacency() {
        let mut fw = Firmware::generate_default(Model::Lite);
        let base = fw.user_settings_base();
        write_le_u16(&mut fw.bytes, base + USER_COUNTER_OFFSET, 0x7F);
        write_le_u16(&mut fw.bytes, base + USER_SLOT_SIZE + USER_COUNTER_OFFSET, 0);
        fw.update_checksums();
        assert_eq!(fw.effective_user_data_counter(), 0);
    }

    #[test]
    fn access_point_crcs_are_checked() {
        let mut fw = Firmware::generate_default(Model::Lite);
        assert!(fw.verify().is_ok());
        let range = fw.ap_slot_range(1).unwrap();
        fw.bytes[range.start] ^= 0xFF;
        assert_eq!(
            fw.verify(),
            Err(Error::IncorrectCrc16 {
                region: VerificationRegion::AccessPoint(1),
                calculated: crc16(0, &fw.bytes[range.start..range.start + AP_CRC_LEN]),
                expected: read_le_u16(&fw.bytes, range.start + AP_CRC_OFFSET),
            })
        );
    }

    #[test]
    fn extended_access_point_crcs_only_apply_to_dsi() {
        let lite = Firmware::generate_default(Model::Lite);
        assert!(!lite.is_dsi());
        assert!(lite.verify().is_ok());

        let mut dsi = Firmware::generate_default(Model::Dsi);
        assert!(dsi.is_dsi());
        assert!(dsi.verify().is_ok());
        let range = dsi.extended_ap_slot_range(0).unwrap();
        let ext_start = range.start + EXTENDED_AP_DATA_OFFSET;
        dsi.bytes[ext_start] ^= 0xFF;
        assert_eq!(
            dsi.verify(),
            Err(Error::IncorrectCrc16 {
                region: VerificationRegion::ExtendedAccessPoint(0),
                calculated: crc16(0, &dsi.bytes[ext_start..ext_start + EXTENDED_AP_CRC_LEN]),
                expected: read_le_u16(&dsi.bytes, range.start + EXTENDED_AP_CRC_OFFSET),
            })
        );
    }

    #[test]
    fn extended_user_settings_crc_is_checked_when_flagged() {
        let mut fw = Firmware::generate_default(Model::Lite);
        let base = fw.user_settings_base();
        fw.bytes[base + USER_EXTENDED_FLAG_OFFSET] = 1;
        fw.update_checksums();
        assert!(fw.verify().is_ok());
        let ext_start = base + USER_EXTENDED_FLAG_OFFSET;
        fw.bytes[ext_start + 1] ^= 0xFF;
        assert_eq!(
            fw.verify(),
            Err(Error::IncorrectCrc16 {
                region: VerificationRegion::ExtendedUser0,
                calculated: crc16(0xFFFF, &fw.bytes[ext_start..ext_start + USER_EXTENDED_CRC_LEN]),
                expected: read_le_u16(&fw.bytes, base + USER_EXTENDED_CRC_OFFSET),
            })
        );
    }
}
