//! Memory IO devices
//!
//! A growable byte buffer behind a `*name*` handler. Writes may grow
//! the device by up to one step past its current size; reads beyond
//! the end report EOF.

use super::dev::{DevError, DevResult, Device, DeviceInterface, IosFlags};
use super::IosStack;

/// Growth step, in bytes.
const MEM_STEP: usize = 512 * 8;

pub struct MemDevice {
    bytes: Vec<u8>,
}

fn handler_normalize(handler: &str, _flags: IosFlags) -> Option<String> {
    let bytes = handler.as_bytes();
    if !bytes.is_empty() && bytes[0] == b'*' && bytes[bytes.len() - 1] == b'*' {
        Some(handler.to_string())
    } else {
        None
    }
}

fn open_dev(_stack: &mut IosStack, _handler: &str, _flags: IosFlags) -> DevResult<Box<dyn Device>> {
    Ok(Box::new(MemDevice {
        bytes: vec![0; MEM_STEP],
    }))
}

impl Device for MemDevice {
    fn pread(&mut self, _stack: &mut IosStack, buf: &mut [u8], offset: u64) -> DevResult<()> {
        let end = offset as usize + buf.len();
        if end > self.bytes.len() {
            return Err(DevError::Eof);
        }
        buf.copy_from_slice(&self.bytes[offset as usize..end]);
        Ok(())
    }

    fn pwrite(&mut self, _stack: &mut IosStack, buf: &[u8], offset: u64) -> DevResult<()> {
        let end = offset as usize + buf.len();
        if end > self.bytes.len() + MEM_STEP {
            return Err(DevError::Eof);
        }
        if end > self.bytes.len() {
            let grown = self.bytes.len() + MEM_STEP;
            self.bytes.resize(grown, 0);
        }
        self.bytes[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn flags(&self) -> IosFlags {
        IosFlags::RDWR
    }

    fn size(&mut self, _stack: &mut IosStack) -> u64 {
        self.bytes.len() as u64
    }
}

pub const INTERFACE: DeviceInterface = DeviceInterface {
    name: "MEMORY",
    handler_normalize,
    open: open_dev,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_needs_both_stars() {
        assert_eq!(
            handler_normalize("*scratch*", IosFlags::empty()),
            Some("*scratch*".to_string())
        );
        assert_eq!(handler_normalize("*scratch", IosFlags::empty()), None);
        assert_eq!(handler_normalize("scratch*", IosFlags::empty()), None);
        assert_eq!(handler_normalize("", IosFlags::empty()), None);
    }
}
