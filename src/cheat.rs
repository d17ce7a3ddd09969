//! `MLAR` cheat list format: a header, followed by `MLCD`-tagged entries
//! each carrying a UTF-8 name and a list of Action Replay code words.
//!
//! Grounded on melonDS's `ARCodeList.cpp` header-comment layout, which
//! this crate's original source ships only as documentation (the actual
//! C++ implementation was filtered out of the retrieval pack); the binary
//! layout below follows that comment exactly.

use crate::error::{Error, Result};

const MLAR_MAGIC: [u8; 4] = *b"MLAR";
const MLCD_MAGIC: [u8; 4] = *b"MLCD";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheatCode {
    pub name: String,
    pub enabled: bool,
    /// Action Replay code words, each a 32-bit opcode/operand pair
    /// flattened in file order.
    pub code: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheatList {
    pub version_major: u16,
    pub version_minor: u16,
    pub codes: Vec<CheatCode>,
}

impl CheatList {
    pub fn new(version_major: u16, version_minor: u16) -> Self {
        CheatList {
            version_major,
            version_minor,
            codes: Vec::new(),
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 16 || bytes[0..4] != MLAR_MAGIC {
            return Err(Error::RomInvalid);
        }
        let version_major = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
        let version_minor = u16::from_le_bytes(bytes[6..8].try_into().unwrap());
        let count = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;

        let mut codes = Vec::with_capacity(count);
        let mut pos = 16;
        for _ in 0..count {
            if pos + 16 > bytes.len() || bytes[pos..pos + 4] != MLCD_MAGIC {
                return Err(Error::RomInvalid);
            }
            let name_len = u32::from_le_bytes(bytes[pos + 4..pos + 8].try_into().unwrap()) as usize;
            let code_len_words = u32::from_le_bytes(bytes[pos + 8..pos + 12].try_into().unwrap()) as usize;
            let enabled = u32::from_le_bytes(bytes[pos + 12..pos + 16].try_into().unwrap()) != 0;
            pos += 16;

            if pos + name_len > bytes.len() {
                return Err(Error::RomInvalid);
            }
            let name = String::from_utf8_lossy(&bytes[pos..pos + name_len]).into_owned();
            pos += name_len;

            let code_len_bytes = code_len_words * 4;
            if pos + code_len_bytes > bytes.len() {
                return Err(Error::RomInvalid);
            }
            let mut code = Vec::with_capacity(code_len_words);
            for chunk in bytes[pos..pos + code_len_bytes].chunks_exact(4) {
                code.push(u32::from_le_bytes(chunk.try_into().unwrap()));
            }
            pos += code_len_bytes;

            codes.push(CheatCode { name, enabled, code });
        }

        Ok(CheatList {
            version_major,
            version_minor,
            codes,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut entries = Vec::new();
        for code in &self.codes {
            let name_bytes = code.name.as_bytes();
            entries.extend_from_slice(&MLCD_MAGIC);
            entries.extend_from_slice(&(name_bytes.len() as u32).to_le_bytes());
            entries.extend_from_slice(&(code.code.len() as u32).to_le_bytes());
            entries.extend_from_slice(&(code.enabled as u32).to_le_bytes());
            entries.extend_from_slice(name_bytes);
            for word in &code.code {
                entries.extend_from_slice(&word.to_le_bytes());
            }
        }

        let mut out = Vec::with_capacity(16 + entries.len());
        out.extend_from_slice(&MLAR_MAGIC);
        out.extend_from_slice(&self.version_major.to_le_bytes());
        out.extend_from_slice(&self.version_minor.to_le_bytes());
        out.extend_from_slice(&((16 + entries.len()) as u32).to_le_bytes());
        out.extend_from_slice(&(self.codes.len() as u32).to_le_bytes());
        out.extend_from_slice(&entries);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_serialize_and_parse() {
        let mut list = CheatList::new(1, 0);
        list.codes.push(CheatCode {
            name: "Infinite HP".to_string(),
            enabled: true,
            code: vec![0x1234_5678, 0x0000_0063],
        });
        list.codes.push(CheatCode {
            name: "Disabled code".to_string(),
            enabled: false,
            code: vec![0xDEAD_BEEF],
        });

        let bytes = list.serialize();
        let parsed = CheatList::parse(&bytes).unwrap();
        assert_eq!(parsed, list);
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(CheatList::parse(b"NOPE0000000000000").is_err());
    }

    #[test]
    fn empty_list_round_trips() {
        let list = CheatList::new(2, 1);
        let bytes = list.serialize();
        let parsed = CheatList::parse(&bytes).unwrap();
        assert_eq!(parsed.codes.len(), 0);
        assert_eq!(parsed.version_major, 2);
        assert_eq!(parsed.version_minor, 1);
    }
}
