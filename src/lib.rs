#![warn(clippy::pedantic)]
#![allow(
    clippy::cast_lossless,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_possible_truncation,
    clippy::struct_excessive_bools,
    clippy::used_underscore_binding,
    clippy::too_many_lines,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::unused_self,
    clippy::missing_errors_doc,
    clippy::wildcard_imports
)]

//! Dual-ARM handheld emulation core.
//!
//! This crate owns the instruction-cycle-scheduled engine shared by a
//! Nintendo DS / DSi style system: the cycle scheduler, interrupt
//! controllers, memory map, CPU interpreters, DMA engines, inter-core FIFO,
//! cartridge protocol with its save-RAM subsystem, SPI/I2C buses, firmware
//! container, savestate serializer and the JIT executable-memory arena.
//! The 2D/3D pixel pipeline, audio mixer and any GUI shell are external
//! collaborators and are not implemented here.

pub mod cheat;
pub mod cpu;
pub mod ds_slot;
pub mod emu;
pub mod error;
pub mod i2c;
pub mod ipc;
pub mod jit;
pub mod memory;
pub mod rtc;
pub mod savestate;
pub mod scheduler;
pub mod spi;

pub use emu::{Builder, Emu, RunOutput};
pub use error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum Model {
    Ds,
    #[default]
    Lite,
    Dsi,
}

impl Model {
    #[inline]
    pub const fn is_dsi(self) -> bool {
        matches!(self, Model::Dsi)
    }
}

/// Save-RAM contents supplied when loading a cartridge: either bytes read
/// from an existing save file, or a request to create `len` zeroed bytes.
#[derive(Clone)]
pub enum SaveContents {
    Existing(Vec<u8>),
    New(usize),
}

impl From<Vec<u8>> for SaveContents {
    #[inline]
    fn from(other: Vec<u8>) -> Self {
        Self::Existing(other)
    }
}

impl SaveContents {
    pub(crate) fn get_or_create(self, f: impl FnOnce(usize) -> Vec<u8>) -> Vec<u8> {
        match self {
            Self::Existing(data) => data,
            Self::New(len) => f(len),
        }
    }

    #[inline]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        match self {
            Self::Existing(data) => data.len(),
            Self::New(len) => *len,
        }
    }
}
