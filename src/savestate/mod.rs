//! Savestate stream: a single magic-prefixed, section-tagged byte stream
//! shared by every component's `do_state`.
//!
//! The teacher derives this mechanically with a `#[derive(Savestate)]`
//! proc-macro from its own `emu-utils` crate, a private git dependency this
//! crate cannot fetch. The wire format below (magic, `u32` version, a
//! stream of 4-byte-tag/4-byte-length sections, a zero-tag terminator, a
//! trailing CRC32) is specified directly rather than derived from the
//! teacher, so every component here hand-writes its own `do_state` instead
//! of deriving it.

use crate::error::{Error, Result};

pub const MAGIC: [u8; 4] = *b"MELN";

fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in bytes {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

/// A component's state, written or read in a fixed field order. The same
/// implementation runs in both directions: [`Writer`]-backed sections
/// append fields, [`Reader`]-backed sections consume them.
pub struct SectionWriter {
    pub version: u32,
    buf: Vec<u8>,
}

impl SectionWriter {
    pub fn new(version: u32) -> Self {
        SectionWriter {
            version,
            buf: Vec::new(),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        self.write_u32(value.len() as u32);
        self.buf.extend_from_slice(value);
    }
}

pub struct SectionReader<'a> {
    pub version: u32,
    buf: &'a [u8],
    pos: usize,
    tag: [u8; 4],
}

impl<'a> SectionReader<'a> {
    fn new(tag: [u8; 4], body: &'a [u8]) -> Result<Self> {
        if body.len() < 4 {
            return Err(Error::SavestateTruncated);
        }
        let version = u32::from_le_bytes(body[0..4].try_into().unwrap());
        Ok(SectionReader {
            version,
            buf: &body[4..],
            pos: 0,
            tag,
        })
    }

    /// Fails with [`Error::SavestateUnsupportedVersion`] unless the
    /// section's recorded version is one `do_state` knows how to read.
    pub fn require_version(&self, max_supported: u32) -> Result<()> {
        if self.version > max_supported {
            Err(Error::SavestateUnsupportedVersion {
                section: self.tag,
                version: self.version,
            })
        } else {
            Ok(())
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return Err(Error::SavestateTruncated);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new(version: u32) -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&version.to_le_bytes());
        Writer { buf }
    }

    pub fn write_section(&mut self, tag: [u8; 4], section: SectionWriter) {
        let mut body = Vec::with_capacity(4 + section.buf.len());
        body.extend_from_slice(&section.version.to_le_bytes());
        body.extend_from_slice(&section.buf);
        self.buf.extend_from_slice(&tag);
        self.buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(&body);
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf.extend_from_slice(&[0; 4]);
        self.buf.extend_from_slice(&0u32.to_le_bytes());
        let crc = crc32(&self.buf);
        self.buf.extend_from_slice(&crc.to_le_bytes());
        self.buf
    }
}

pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    pub top_level_version: u32,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < 8 || buf[0..4] != MAGIC {
            return Err(Error::SavestateMagicMismatch);
        }
        let top_level_version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        Ok(Reader {
            buf,
            pos: 8,
            top_level_version,
        })
    }

    /// Returns the next section, or `None` once the zero-tag terminator
    /// is reached (after validating the trailing CRC32 over everything
    /// read so far, terminator included).
    pub fn next_section(&mut self) -> Result<Option<([u8; 4], SectionReader<'a>)>> {
        if self.pos + 8 > self.buf.len() {
            return Err(Error::SavestateTruncated);
        }
        let tag: [u8; 4] = self.buf[self.pos..self.pos + 4].try_into().unwrap();
        let len = u32::from_le_bytes(self.buf[self.pos + 4..self.pos + 8].try_into().unwrap()) as usize;
        let body_start = self.pos + 8;
        if body_start + len > self.buf.len() {
            return Err(Error::SavestateTruncated);
        }
        let body = &self.buf[body_start..body_start + len];
        self.pos = body_start + len;
        if tag == [0; 4] {
            if self.pos + 4 > self.buf.len() {
                return Err(Error::SavestateTruncated);
            }
            let stored_crc = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
            if crc32(&self.buf[..self.pos]) != stored_crc {
                return Err(Error::SavestateTruncated);
            }
            return Ok(None);
        }
        Ok(Some((tag, SectionReader::new(tag, body)?)))
    }
}

/// Implemented by every stateful component; `tag` identifies its section
/// in the stream and `VERSION` is the version written on save.
pub trait SaveState {
    const TAG: [u8; 4];
    const VERSION: u32;

    fn save_state(&self, section: &mut SectionWriter);

    /// Restores fields from `section`, which has already passed
    /// [`SectionReader::require_version`]. Any events the component owned
    /// before the savestate was taken must be re-armed against the
    /// scheduler here, never deserialized as raw queue entries.
    fn load_state(&mut self, section: &mut SectionReader<'_>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_round_trips_through_writer_and_reader() {
        let mut writer = Writer::new(1);
        let mut section = SectionWriter::new(3);
        section.write_u32(0xDEAD_BEEF);
        section.write_bytes(b"hello");
        writer.write_section(*b"TEST", section);
        let bytes = writer.finish();

        let mut reader = Reader::new(&bytes).unwrap();
        assert_eq!(reader.top_level_version, 1);
        let (tag, mut section) = reader.next_section().unwrap().unwrap();
        assert_eq!(&tag, b"TEST");
        assert_eq!(section.version, 3);
        assert_eq!(section.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(section.read_bytes().unwrap(), b"hello");
        assert!(reader.next_section().unwrap().is_none());
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut writer = Writer::new(1);
        writer.write_section(*b"TEST", SectionWriter::new(99));
        let bytes = writer.finish();
        let mut reader = Reader::new(&bytes).unwrap();
        let (_, section) = reader.next_section().unwrap().unwrap();
        assert!(matches!(
            section.require_version(1),
            Err(Error::SavestateUnsupportedVersion { version: 99, .. })
        ));
    }

    #[test]
    fn bad_magic_is_rejected() {
        assert!(matches!(Reader::new(b"XXXX1234"), Err(Error::SavestateMagicMismatch)));
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let writer = Writer::new(1);
        let mut bytes = writer.finish();
        bytes.truncate(bytes.len() - 2);
        let mut reader = Reader::new(&bytes).unwrap();
        assert!(reader.next_section().is_err());
    }
}
