//! IO device interface
//!
//! An IO space operates on an "IO device", an abstraction providing
//! byte-oriented positioned read and write over some underlying
//! entity: a file, the memory of a process, a network block device.
//!
//! Devices are byte-oriented: endianness, bit alignment and negative
//! encoding are not their concern. Device offsets are always byte
//! counts.
//!
//! Each backend contributes a [`DeviceInterface`]: a handler
//! normalizer used for backend selection plus an open function. The
//! selection is order-sensitive; the file backend accepts any
//! handler and therefore goes last.

use bitflags::bitflags;
use std::fmt;

use super::IosStack;

bitflags! {
    /// The 64-bit flag word associated with IO spaces.
    ///
    /// Bits 0..8 are the mode, bits 8..32 are generic flags, bits
    /// 32..64 are reserved for device-specific flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IosFlags: u64 {
        const READ = 1;
        const WRITE = 2;
        const TRUNCATE = 8;
        const CREATE = 16;

        const _ = !0;
    }
}

impl IosFlags {
    pub const RDONLY: IosFlags = IosFlags::READ;
    pub const WRONLY: IosFlags = IosFlags::WRITE;
    pub const RDWR: IosFlags = IosFlags::READ.union(IosFlags::WRITE);

    /// The mode byte, bits 0..8.
    pub fn mode(self) -> IosFlags {
        IosFlags::from_bits_retain(self.bits() & 0xff)
    }
}

/// Status codes devices report. The absence of an error is an
/// ordinary `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevError {
    /// Generic error.
    Error,
    /// The provided offset is invalid.
    InvalidOffset,
    /// Invalid flags specified.
    InvalidFlags,
    /// Memory allocation failure.
    NoMem,
    /// End of file / input.
    Eof,
    /// Invalid argument.
    InvalidArg,
}

impl fmt::Display for DevError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self {
            DevError::Error => "device error",
            DevError::InvalidOffset => "invalid offset",
            DevError::InvalidFlags => "invalid flags",
            DevError::NoMem => "out of memory",
            DevError::Eof => "end of file",
            DevError::InvalidArg => "invalid argument",
        };
        f.write_str(what)
    }
}

pub type DevResult<T> = Result<T, DevError>;

/// An open IO device.
///
/// `pread` fills the whole buffer or fails; a read crossing the
/// device size reports [`DevError::Eof`]. `pwrite` writes the whole
/// buffer or fails.
///
/// The `stack` parameter gives pass-through devices (the sub-range
/// backend) access to their base space; leaf backends ignore it.
pub trait Device {
    fn pread(&mut self, stack: &mut IosStack, buf: &mut [u8], offset: u64) -> DevResult<()>;
    fn pwrite(&mut self, stack: &mut IosStack, buf: &[u8], offset: u64) -> DevResult<()>;
    fn flags(&self) -> IosFlags;
    fn size(&mut self, stack: &mut IosStack) -> u64;
    fn flush(&mut self, _stack: &mut IosStack, _offset: u64) -> DevResult<()> {
        Ok(())
    }
    fn close(&mut self) -> DevResult<()> {
        Ok(())
    }
}

/// One backend: a name, a handler normalizer and an open function.
///
/// `handler_normalize` returns the canonical handler when the
/// backend recognizes the handler, `None` otherwise. The first
/// backend in registration order that recognizes a handler wins.
pub struct DeviceInterface {
    pub name: &'static str,
    pub handler_normalize: fn(&str, IosFlags) -> Option<String>,
    pub open: fn(&mut IosStack, &str, IosFlags) -> DevResult<Box<dyn Device>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_byte_masks_high_bits() {
        let flags = IosFlags::from_bits_retain(0xdead_0000_0000_0003);
        assert_eq!(flags.mode(), IosFlags::RDWR);
        assert!(flags.contains(IosFlags::READ));
    }

    #[test]
    fn composite_modes() {
        assert_eq!(IosFlags::RDWR.bits(), 3);
        assert_eq!(IosFlags::RDONLY.bits(), 1);
        assert_eq!(IosFlags::WRONLY.bits(), 2);
        assert_eq!(IosFlags::CREATE.bits(), 16);
    }
}
