use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use thiserror::Error;

use crate::types::Generation;

/// Returned by the adapter when the cartridge clocked nothing out before
/// its internal timeout. Never an error; the mediator's keep-alive logic
/// retries on it.
pub const NO_DATA: u8 = 0x00;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("adapter disconnected: {0}")]
    Disconnected(String),
    #[error("adapter rejected command: {0}")]
    Command(String),
}

/// Link-cable drive voltage. Original GB/GBC cartridges clock at 5V,
/// GBA cartridges at 3.3V.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Voltage {
    Gb,
    Gba,
}

impl Voltage {
    pub fn for_generation(gen: Generation) -> Self {
        match gen {
            Generation::One | Generation::Two => Self::Gb,
            Generation::Three => Self::Gba,
        }
    }
}

/// Raw exchange primitive over the USB link adapter. Half-duplex at the
/// protocol level but symmetric: every write produces exactly one read.
/// A timed-out cartridge read comes back as [`NO_DATA`], not an `Err`;
/// `Err` means the adapter itself is gone.
pub trait ByteLink {
    fn exchange(&mut self, out: u8) -> Result<u8, LinkError>;
    fn exchange32(&mut self, out: u32) -> Result<u32, LinkError>;
    fn set_voltage(&mut self, voltage: Voltage) -> Result<(), LinkError>;
}

// Adapter firmware command prefixes. Plain data bytes are sent bare; the
// 0xF8 escape selects out-of-band commands.
const CMD_ESCAPE: u8 = 0xF8;
const CMD_VOLTAGE_GB: u8 = 0x01;
const CMD_VOLTAGE_GBA: u8 = 0x02;
const CMD_WORD_MODE: u8 = 0x03;

/// [`ByteLink`] over the adapter's CDC-ACM character device. The firmware
/// answers every poll, substituting [`NO_DATA`] when the cartridge side
/// timed out, so blocking reads are safe here.
pub struct DeviceLink {
    file: File,
    word_mode: bool,
}

impl DeviceLink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LinkError> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|e| LinkError::Disconnected(e.to_string()))?;
        Ok(Self {
            file,
            word_mode: false,
        })
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), LinkError> {
        self.file
            .write_all(buf)
            .map_err(|e| LinkError::Disconnected(e.to_string()))
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), LinkError> {
        self.file
            .read_exact(buf)
            .map_err(|e| LinkError::Disconnected(e.to_string()))
    }

    fn enter_word_mode(&mut self) -> Result<(), LinkError> {
        if !self.word_mode {
            self.write_all(&[CMD_ESCAPE, CMD_WORD_MODE])?;
            self.word_mode = true;
        }
        Ok(())
    }
}

impl ByteLink for DeviceLink {
    fn exchange(&mut self, out: u8) -> Result<u8, LinkError> {
        self.write_all(&[out])?;
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn exchange32(&mut self, out: u32) -> Result<u32, LinkError> {
        self.enter_word_mode()?;
        self.write_all(&out.to_le_bytes())?;
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn set_voltage(&mut self, voltage: Voltage) -> Result<(), LinkError> {
        let code = match voltage {
            Voltage::Gb => CMD_VOLTAGE_GB,
            Voltage::Gba => CMD_VOLTAGE_GBA,
        };
        self.write_all(&[CMD_ESCAPE, code])
    }
}
