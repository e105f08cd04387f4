//! Process memory IO devices
//!
//! `pid://N` edits the memory of a live process through the file
//! device machinery on `/proc/N/mem`. The reported size is infinite;
//! valid offsets are determined by the process mappings, and the
//! kernel reports IO errors for holes.

use super::dev::{DevError, DevResult, Device, DeviceInterface, IosFlags};
use super::{dev_file, IosStack};

pub struct ProcDevice {
    memfile: Box<dyn Device>,
}

fn handler_normalize(handler: &str, _flags: IosFlags) -> Option<String> {
    if handler.len() > 6 && handler.starts_with("pid://") {
        Some(handler.to_string())
    } else {
        None
    }
}

fn open_dev(_stack: &mut IosStack, handler: &str, _flags: IosFlags) -> DevResult<Box<dyn Device>> {
    let pid_str = &handler[6..];
    if pid_str.is_empty() || pid_str.parse::<u32>().is_err() {
        return Err(DevError::Error);
    }

    let memfile_path = format!("/proc/{}/mem", pid_str);
    let memfile = dev_file::open(&memfile_path, IosFlags::RDWR)?;
    Ok(Box::new(ProcDevice { memfile }))
}

impl Device for ProcDevice {
    fn pread(&mut self, stack: &mut IosStack, buf: &mut [u8], offset: u64) -> DevResult<()> {
        self.memfile.pread(stack, buf, offset)
    }

    fn pwrite(&mut self, stack: &mut IosStack, buf: &[u8], offset: u64) -> DevResult<()> {
        self.memfile.pwrite(stack, buf, offset)
    }

    fn flags(&self) -> IosFlags {
        IosFlags::RDWR
    }

    fn size(&mut self, _stack: &mut IosStack) -> u64 {
        u64::MAX
    }

    fn close(&mut self) -> DevResult<()> {
        self.memfile.close()
    }
}

pub const INTERFACE: DeviceInterface = DeviceInterface {
    name: "PROC",
    handler_normalize,
    open: open_dev,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_requires_a_pid() {
        assert!(handler_normalize("pid://123", IosFlags::empty()).is_some());
        assert!(handler_normalize("pid://", IosFlags::empty()).is_none());
        assert!(handler_normalize("proc://1", IosFlags::empty()).is_none());
    }
}
