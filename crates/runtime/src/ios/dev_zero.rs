//! Zero IO devices
//!
//! Reads return zeroed bytes at any offset, writes are discarded and
//! the size is "infinite". Mainly used for testing.

use super::dev::{DevResult, Device, DeviceInterface, IosFlags};
use super::IosStack;

pub struct ZeroDevice;

fn handler_normalize(handler: &str, _flags: IosFlags) -> Option<String> {
    if handler == "<zero>" {
        Some(handler.to_string())
    } else {
        None
    }
}

fn open_dev(_stack: &mut IosStack, _handler: &str, _flags: IosFlags) -> DevResult<Box<dyn Device>> {
    Ok(Box::new(ZeroDevice))
}

impl Device for ZeroDevice {
    fn pread(&mut self, _stack: &mut IosStack, buf: &mut [u8], _offset: u64) -> DevResult<()> {
        buf.fill(0);
        Ok(())
    }

    fn pwrite(&mut self, _stack: &mut IosStack, _buf: &[u8], _offset: u64) -> DevResult<()> {
        Ok(())
    }

    fn flags(&self) -> IosFlags {
        IosFlags::RDWR
    }

    fn size(&mut self, _stack: &mut IosStack) -> u64 {
        u64::MAX
    }
}

pub const INTERFACE: DeviceInterface = DeviceInterface {
    name: "ZERO",
    handler_normalize,
    open: open_dev,
};
