//! File IO devices
//!
//! The universal fallback backend: its normalizer accepts any
//! handler, which is why it registers last. Relative names that
//! could be confused with scheme syntax get a `./` prefix so the
//! canonical handler is unambiguous.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::FileExt;

use super::dev::{DevError, DevResult, Device, DeviceInterface, IosFlags};
use super::IosStack;

pub struct FileDevice {
    file: std::fs::File,
    flags: IosFlags,
}

/// Characters that cannot be confused with a handler scheme.
const SAFE: &str = "abcdefghijklmnopqrstuvwxyz\
                    ABCDEFGHIJKLMNOPQRSTUVWXYZ\
                    0123456789/+_-";

fn handler_normalize(handler: &str, _flags: IosFlags) -> Option<String> {
    if handler.starts_with('/') || handler.chars().all(|c| SAFE.contains(c)) {
        Some(handler.to_string())
    } else {
        Some(format!("./{}", handler))
    }
}

fn map_open_err(e: io::Error) -> DevError {
    match e.kind() {
        io::ErrorKind::InvalidInput => DevError::InvalidArg,
        io::ErrorKind::OutOfMemory => DevError::NoMem,
        _ => DevError::Error,
    }
}

pub fn open(handler: &str, flags: IosFlags) -> DevResult<Box<dyn Device>> {
    let mode = flags.mode();

    let (file, flags) = if !mode.is_empty() {
        let file = if mode == IosFlags::READ {
            OpenOptions::new().read(true).open(handler)
        } else if mode == IosFlags::WRITE | IosFlags::CREATE | IosFlags::TRUNCATE {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(handler)
        } else if mode == IosFlags::RDWR {
            OpenOptions::new().read(true).write(true).open(handler)
        } else if mode == IosFlags::RDWR | IosFlags::CREATE | IosFlags::TRUNCATE {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(handler)
        } else {
            return Err(DevError::InvalidFlags);
        };
        (file.map_err(map_open_err)?, flags)
    } else {
        // No explicit mode: try read-write first, then read-only.
        match OpenOptions::new().read(true).write(true).open(handler) {
            Ok(f) => (f, flags | IosFlags::RDWR),
            Err(_) => {
                let f = OpenOptions::new()
                    .read(true)
                    .open(handler)
                    .map_err(map_open_err)?;
                (f, (flags | IosFlags::READ) - IosFlags::WRITE)
            }
        }
    };

    Ok(Box::new(FileDevice { file, flags }))
}

fn open_dev(_stack: &mut IosStack, handler: &str, flags: IosFlags) -> DevResult<Box<dyn Device>> {
    open(handler, flags)
}

impl Device for FileDevice {
    fn pread(&mut self, _stack: &mut IosStack, buf: &mut [u8], offset: u64) -> DevResult<()> {
        match self.file.read_exact_at(buf, offset) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(DevError::Eof),
            Err(_) => Err(DevError::Error),
        }
    }

    fn pwrite(&mut self, _stack: &mut IosStack, buf: &[u8], offset: u64) -> DevResult<()> {
        self.file.write_all_at(buf, offset).map_err(|_| DevError::Eof)
    }

    fn flags(&self) -> IosFlags {
        self.flags
    }

    fn size(&mut self, _stack: &mut IosStack) -> u64 {
        self.file.metadata().map(|m| m.len()).unwrap_or(0)
    }

    fn close(&mut self) -> DevResult<()> {
        self.file.sync_all().ok();
        Ok(())
    }
}

pub const INTERFACE: DeviceInterface = DeviceInterface {
    name: "FILE",
    handler_normalize,
    open: open_dev,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_names_pass_through() {
        assert_eq!(
            handler_normalize("/etc/motd", IosFlags::empty()),
            Some("/etc/motd".to_string())
        );
        assert_eq!(
            handler_normalize("disk+image-1", IosFlags::empty()),
            Some("disk+image-1".to_string())
        );
    }

    #[test]
    fn ambiguous_names_get_a_prefix() {
        assert_eq!(
            handler_normalize("a:b", IosFlags::empty()),
            Some("./a:b".to_string())
        );
        assert_eq!(
            handler_normalize("*weird*", IosFlags::empty()),
            Some("./*weird*".to_string())
        );
    }
}
