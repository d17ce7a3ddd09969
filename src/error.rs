//! Fatal and caller-visible error kinds.
//!
//! Transient, in-frame conditions (`UnmappedAccess`, `FifoError`,
//! `SaveRamIoFailed`) never propagate out of [`crate::emu::Emu::run`]; they
//! are observed through registers or the log, per the propagation policy
//! in the core's error handling design. This enum only covers conditions
//! that must be surfaced synchronously to the caller: ROM/BIOS/firmware
//! load failures, savestate decode failures and JIT allocation failure.

use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    BiosMissing,
    FirmwareMissing,
    FirmwareInvalid(crate::spi::firmware::Error),
    RomInvalid,
    SavestateMagicMismatch,
    SavestateUnsupportedVersion { section: [u8; 4], version: u32 },
    SavestateTruncated,
    JitAllocFailed,
}

impl From<crate::spi::firmware::Error> for Error {
    fn from(err: crate::spi::firmware::Error) -> Self {
        Error::FirmwareInvalid(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BiosMissing => write!(f, "required BIOS image is missing"),
            Error::FirmwareMissing => write!(f, "required firmware image is missing"),
            Error::FirmwareInvalid(err) => write!(f, "firmware image failed verification: {err}"),
            Error::RomInvalid => write!(f, "cartridge ROM image is invalid or truncated"),
            Error::SavestateMagicMismatch => write!(f, "savestate magic does not match"),
            Error::SavestateUnsupportedVersion { section, version } => write!(
                f,
                "savestate section {:?} has unsupported version {version}",
                String::from_utf8_lossy(section)
            ),
            Error::SavestateTruncated => write!(f, "savestate stream ended unexpectedly"),
            Error::JitAllocFailed => write!(f, "JIT arena has no free executable slices"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;
