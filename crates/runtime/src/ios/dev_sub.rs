//! Sub-range IO devices
//!
//! A pseudo-device exposing a window of another IO space, behind
//! handlers of the form `sub://IOS/BASE/SIZE/NAME`. Reads and writes
//! are bounds-checked against the window size and forwarded to the
//! base space's device after adding the window base.
//!
//! The base space is looked up by id on every operation. When the
//! base has been closed, operations on the sub space fail with the
//! generic device error.

use super::dev::{DevError, DevResult, Device, DeviceInterface, IosFlags};
use super::IosStack;

pub struct SubDevice {
    base_ios_id: i32,
    base: u64,
    size: u64,
    #[allow(dead_code)]
    name: String,
    flags: IosFlags,
}

fn handler_normalize(handler: &str, _flags: IosFlags) -> Option<String> {
    if handler.len() > 6 && handler.starts_with("sub://") {
        Some(handler.to_string())
    } else {
        None
    }
}

/// Parse `sub://IOS/BASE/SIZE/NAME`. The name may be empty.
fn parse_handler(handler: &str) -> Option<(i32, u64, u64, String)> {
    let rest = handler.strip_prefix("sub://")?;
    let mut parts = rest.splitn(4, '/');
    let ios = parts.next()?.parse::<i32>().ok()?;
    let base = parts.next()?.parse::<u64>().ok()?;
    let size = parts.next()?.parse::<u64>().ok()?;
    let name = parts.next().unwrap_or("").to_string();
    Some((ios, base, size, name))
}

fn open_dev(stack: &mut IosStack, handler: &str, flags: IosFlags) -> DevResult<Box<dyn Device>> {
    let explicit_flags_p = !flags.is_empty();

    // Only the read and write mode bits make sense for a window.
    let sub_flags = if explicit_flags_p { flags } else { IosFlags::RDWR };
    if sub_flags.intersects(!IosFlags::RDWR) {
        return Err(DevError::InvalidFlags);
    }

    let (base_ios_id, base, size, name) = parse_handler(handler).ok_or(DevError::Error)?;

    // The referred space must exist and the window must lie inside it.
    if !stack.id_is_open(base_ios_id) {
        return Err(DevError::Error);
    }
    let base_size = stack.dev_size(base_ios_id)?;
    if base >= base_size || base + size > base_size {
        return Err(DevError::Error);
    }

    // Explicit flags must not contradict the base space's flags.
    let base_flags = stack.dev_flags(base_ios_id)?;
    if explicit_flags_p
        && ((sub_flags.contains(IosFlags::READ) && !base_flags.contains(IosFlags::READ))
            || (sub_flags.contains(IosFlags::WRITE) && !base_flags.contains(IosFlags::WRITE)))
    {
        return Err(DevError::InvalidFlags);
    }

    Ok(Box::new(SubDevice {
        base_ios_id,
        base,
        size,
        name,
        flags: sub_flags,
    }))
}

impl Device for SubDevice {
    fn pread(&mut self, stack: &mut IosStack, buf: &mut [u8], offset: u64) -> DevResult<()> {
        if !self.flags.contains(IosFlags::READ) || !stack.id_is_open(self.base_ios_id) {
            return Err(DevError::Error);
        }
        if offset >= self.size {
            return Err(DevError::Eof);
        }
        stack.dev_pread(self.base_ios_id, buf, self.base + offset)
    }

    fn pwrite(&mut self, stack: &mut IosStack, buf: &[u8], offset: u64) -> DevResult<()> {
        if !self.flags.contains(IosFlags::WRITE) || !stack.id_is_open(self.base_ios_id) {
            return Err(DevError::Error);
        }
        // Writes past the end of the window are not accepted.
        if offset >= self.size {
            return Err(DevError::Eof);
        }
        stack.dev_pwrite(self.base_ios_id, buf, self.base + offset)
    }

    fn flags(&self) -> IosFlags {
        self.flags
    }

    fn size(&mut self, _stack: &mut IosStack) -> u64 {
        self.size
    }
}

pub const INTERFACE: DeviceInterface = DeviceInterface {
    name: "SUB",
    handler_normalize,
    open: open_dev,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_parses_all_fields() {
        assert_eq!(
            parse_handler("sub://3/10/16/win"),
            Some((3, 10, 16, "win".to_string()))
        );
        assert_eq!(
            parse_handler("sub://0/0/4/"),
            Some((0, 0, 4, String::new()))
        );
        assert_eq!(parse_handler("sub://x/0/4/n"), None);
        assert_eq!(parse_handler("sub://1/2"), None);
    }

    #[test]
    fn normalizer_requires_scheme() {
        assert!(handler_normalize("sub://1/0/8/w", IosFlags::empty()).is_some());
        assert!(handler_normalize("sub:", IosFlags::empty()).is_none());
        assert!(handler_normalize("subx://1/0/8/w", IosFlags::empty()).is_none());
    }
}
