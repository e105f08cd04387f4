//! IO spaces
//!
//! IO spaces abstract the heterogeneous devices that are suitable to
//! be edited (files, process memory, streams, ...) into
//! bit-addressable spaces supporting reads and writes of:
//!
//! - signed and unsigned integers from 1 to 64 bits wide, stored in
//!   either MSB or LSB endianness, with negative quantities in one of
//!   the supported negative encodings;
//! - strings: byte sequences terminated by a NUL byte.
//!
//! Offsets into an IO space are signed 64-bit bit counts; device
//! offsets are unsigned byte counts. The bit/byte translation, the
//! per-space bias and the permission checks all live here.
//!
//! Open spaces form a list with one designated current space.
//! Backend selection asks each registered backend to normalize the
//! handler, in declaration order; the file backend accepts anything
//! and goes last.

pub mod buffer;
pub mod dev;
pub mod dev_file;
pub mod dev_mem;
pub mod dev_nbd;
pub mod dev_proc;
pub mod dev_stream;
pub mod dev_sub;
pub mod dev_zero;

use std::fmt;

use tracing::debug;

use self::dev::{DevError, DevResult, Device, DeviceInterface, IosFlags};

/// Byte endianness of integers stored in a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Msb,
    Lsb,
}

/// Negative encoding of signed integers stored in a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nenc {
    /// One's complement.
    One,
    /// Two's complement.
    Two,
}

/// IO-space tier status codes: the device statuses plus the
/// permission and double-open conditions this layer adds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IosError {
    Error,
    InvalidOffset,
    InvalidFlags,
    NoMem,
    Eof,
    InvalidArg,
    /// IO space is already open.
    Open,
    /// Insufficient permissions for the requested operation.
    Perm,
}

impl fmt::Display for IosError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self {
            IosError::Error => "IO error",
            IosError::InvalidOffset => "invalid offset",
            IosError::InvalidFlags => "invalid flags",
            IosError::NoMem => "out of memory",
            IosError::Eof => "end of file",
            IosError::InvalidArg => "invalid argument",
            IosError::Open => "IO space is already open",
            IosError::Perm => "insufficient permissions",
        };
        f.write_str(what)
    }
}

impl From<DevError> for IosError {
    fn from(e: DevError) -> IosError {
        match e {
            DevError::Error => IosError::Error,
            DevError::InvalidOffset => IosError::InvalidOffset,
            DevError::InvalidFlags => IosError::InvalidFlags,
            DevError::NoMem => IosError::NoMem,
            DevError::Eof => IosError::Eof,
            DevError::InvalidArg => IosError::InvalidArg,
        }
    }
}

pub type IosResult<T> = Result<T, IosError>;

/// One open IO space.
struct Ios {
    id: i32,
    handler: String,
    /// Taken out while an operation runs on it, so pass-through
    /// devices can re-enter the stack for their base space.
    device: Option<Box<dyn Device>>,
    if_name: &'static str,
    /// Bit-level bias added to every user-supplied offset.
    bias: i64,
}

/// The registered backends, in selection order. The file backend
/// must be last: it is the universal fallback.
fn interfaces() -> &'static [&'static DeviceInterface] {
    &[
        &dev_zero::INTERFACE,
        &dev_mem::INTERFACE,
        &dev_stream::INTERFACE,
        &dev_nbd::INTERFACE,
        &dev_proc::INTERFACE,
        &dev_sub::INTERFACE,
        &dev_file::INTERFACE,
    ]
}

/// The collection of open IO spaces plus the current-space pointer.
#[derive(Default)]
pub struct IosStack {
    /// Most recently opened first.
    list: Vec<Ios>,
    cur: Option<i32>,
    next_id: i32,
}

impl IosStack {
    pub fn new() -> IosStack {
        IosStack::default()
    }

    /* Collection management.  */

    /// Open an IO space. Returns the id of the new space.
    ///
    /// If no read/write mode flags are given the space is opened in
    /// whatever mode makes more sense for the backend. The id
    /// counter only advances once every possible error is ruled out.
    pub fn open(&mut self, handler: &str, flags: IosFlags, set_cur: bool) -> IosResult<i32> {
        let mut selected: Option<(&'static DeviceInterface, String)> = None;
        for interface in interfaces() {
            if let Some(canonical) = (interface.handler_normalize)(handler, flags) {
                selected = Some((interface, canonical));
                break;
            }
        }
        let (interface, canonical) = selected.ok_or(IosError::Error)?;

        // Do not re-open an already-open IO space.
        if self.list.iter().any(|io| io.handler == canonical) {
            return Err(IosError::Open);
        }

        let device = (interface.open)(self, handler, flags)?;

        let id = self.next_id;
        self.next_id += 1;

        debug!(id, handler = %canonical, backend = interface.name, "opening IO space");

        self.list.insert(
            0,
            Ios {
                id,
                handler: canonical,
                device: Some(device),
                if_name: interface.name,
                bias: 0,
            },
        );

        if self.cur.is_none() || set_cur {
            self.cur = Some(id);
        }

        Ok(id)
    }

    /// Close a space, releasing the device and unlinking it. If the
    /// closed space was current, the list head becomes current.
    pub fn close(&mut self, id: i32) -> IosResult<()> {
        let index = self
            .list
            .iter()
            .position(|io| io.id == id)
            .ok_or(IosError::Error)?;
        let mut io = self.list.remove(index);
        debug!(id, handler = %io.handler, "closing IO space");
        let ret = match io.device.as_mut() {
            Some(dev) => dev.close(),
            None => Err(DevError::Error),
        };
        if self.cur == Some(id) {
            self.cur = self.list.first().map(|io| io.id);
        }
        ret.map_err(IosError::from)
    }

    /// Close every open space, most recently opened first.
    pub fn shutdown(&mut self) {
        while let Some(io) = self.list.first() {
            let id = io.id;
            let _ = self.close(id);
        }
    }

    pub fn cur(&self) -> Option<i32> {
        self.cur
    }

    pub fn set_cur(&mut self, id: i32) -> bool {
        if self.id_is_open(id) {
            self.cur = Some(id);
            true
        } else {
            false
        }
    }

    pub fn id_is_open(&self, id: i32) -> bool {
        self.list.iter().any(|io| io.id == id)
    }

    /// The space operating the given canonical handler.
    pub fn search(&self, handler: &str) -> Option<i32> {
        self.list
            .iter()
            .find(|io| io.handler == handler)
            .map(|io| io.id)
    }

    /// Ids of the open spaces, most recently opened first.
    pub fn ids(&self) -> Vec<i32> {
        self.list.iter().map(|io| io.id).collect()
    }

    pub fn handler(&self, id: i32) -> Option<&str> {
        self.find(id).map(|io| io.handler.as_str())
    }

    pub fn if_name(&self, id: i32) -> Option<&'static str> {
        self.find(id).map(|io| io.if_name)
    }

    pub fn get_bias(&self, id: i32) -> Option<i64> {
        self.find(id).map(|io| io.bias)
    }

    pub fn set_bias(&mut self, id: i32, bias: i64) -> bool {
        match self.list.iter_mut().find(|io| io.id == id) {
            Some(io) => {
                io.bias = bias;
                true
            }
            None => false,
        }
    }

    fn find(&self, id: i32) -> Option<&Ios> {
        self.list.iter().find(|io| io.id == id)
    }

    /* Device pass-through. Used internally and by the sub-range
    backend, which re-enters the stack for its base space. The
    device is taken out of its slot for the duration of the call;
    a space can therefore not operate on itself.  */

    fn with_dev<R>(
        &mut self,
        id: i32,
        f: impl FnOnce(&mut dyn Device, &mut IosStack) -> R,
    ) -> DevResult<R> {
        let index = self
            .list
            .iter()
            .position(|io| io.id == id)
            .ok_or(DevError::Error)?;
        let mut device = self.list[index].device.take().ok_or(DevError::Error)?;
        let result = f(device.as_mut(), self);
        if let Some(io) = self.list.iter_mut().find(|io| io.id == id) {
            io.device = Some(device);
        }
        Ok(result)
    }

    pub fn dev_pread(&mut self, id: i32, buf: &mut [u8], offset: u64) -> DevResult<()> {
        self.with_dev(id, |dev, stack| dev.pread(stack, buf, offset))?
    }

    pub fn dev_pwrite(&mut self, id: i32, buf: &[u8], offset: u64) -> DevResult<()> {
        self.with_dev(id, |dev, stack| dev.pwrite(stack, buf, offset))?
    }

    pub fn dev_size(&mut self, id: i32) -> DevResult<u64> {
        self.with_dev(id, |dev, stack| dev.size(stack))
    }

    pub fn dev_flags(&mut self, id: i32) -> DevResult<IosFlags> {
        self.with_dev(id, |dev, _| dev.flags())
    }

    /// Flags active in a space. These need not match the flags the
    /// space was opened with: backends may adjust them.
    pub fn flags(&mut self, id: i32) -> IosResult<IosFlags> {
        self.dev_flags(id).map_err(IosError::from)
    }

    /// Size of the space, in bytes.
    pub fn size(&mut self, id: i32) -> IosResult<u64> {
        self.dev_size(id).map_err(IosError::from)
    }

    /// Flush the space down to the given bit offset. On stream
    /// devices this discards buffered bytes below `offset / 8`.
    pub fn flush(&mut self, id: i32, offset: i64) -> IosResult<()> {
        let offset = self.effective_offset(id, offset)?.max(0);
        self.with_dev(id, |dev, stack| dev.flush(stack, (offset / 8) as u64))?
            .map_err(IosError::from)
    }

    /* Bit-level integer IO.  */

    fn effective_offset(&self, id: i32, offset: i64) -> IosResult<i64> {
        let bias = self.get_bias(id).ok_or(IosError::Error)?;
        Ok(offset + bias)
    }

    fn check_perm(&mut self, id: i32, needed: IosFlags) -> IosResult<()> {
        let flags = self.dev_flags(id).map_err(IosError::from)?;
        if flags.contains(needed) {
            Ok(())
        } else {
            Err(IosError::Perm)
        }
    }

    /// Read an unsigned integer of 1..=64 bits at a bit offset.
    pub fn read_uint(
        &mut self,
        id: i32,
        offset: i64,
        bits: u32,
        endian: Endian,
    ) -> IosResult<u64> {
        self.check_perm(id, IosFlags::READ)?;
        let offset = self.effective_offset(id, offset)?;
        self.read_uint_raw(id, offset, bits, endian)
    }

    /// Read a signed integer; the result comes back sign-extended.
    /// One's-complement decoding applies after sign extension.
    pub fn read_int(
        &mut self,
        id: i32,
        offset: i64,
        bits: u32,
        endian: Endian,
        nenc: Nenc,
    ) -> IosResult<i64> {
        let raw = self.read_uint(id, offset, bits, endian)?;
        let mut value = sign_extend(raw, bits);
        if nenc == Nenc::One && value < 0 {
            value = -(!value);
        }
        Ok(value)
    }

    /// Write an unsigned integer of 1..=64 bits at a bit offset. A
    /// wider input is silently truncated to `bits`.
    pub fn write_uint(
        &mut self,
        id: i32,
        offset: i64,
        bits: u32,
        endian: Endian,
        value: u64,
    ) -> IosResult<()> {
        self.check_perm(id, IosFlags::WRITE)?;
        let offset = self.effective_offset(id, offset)?;
        self.write_uint_raw(id, offset, bits, endian, value)
    }

    /// Write a signed integer, encoding negatives per `nenc`.
    pub fn write_int(
        &mut self,
        id: i32,
        offset: i64,
        bits: u32,
        endian: Endian,
        nenc: Nenc,
        value: i64,
    ) -> IosResult<()> {
        let raw = if nenc == Nenc::One && value < 0 {
            !(-value) as u64
        } else {
            value as u64
        };
        self.write_uint(id, offset, bits, endian, raw)
    }

    fn read_uint_raw(&mut self, id: i32, offset: i64, bits: u32, endian: Endian) -> IosResult<u64> {
        debug_assert!((1..=64).contains(&bits));
        if offset < 0 {
            return Err(IosError::InvalidOffset);
        }
        let offset = offset as u64;
        let o = (offset % 8) as u32;

        // Fast track for byte-aligned 8x widths.
        if o == 0 && bits % 8 == 0 {
            let nbytes = (bits / 8) as usize;
            let mut c = [0u8; 8];
            self.dev_pread(id, &mut c[..nbytes], offset / 8)?;
            let mut value: u64 = 0;
            match endian {
                Endian::Lsb => {
                    for i in (0..nbytes).rev() {
                        value = (value << 8) | c[i] as u64;
                    }
                }
                Endian::Msb => {
                    for byte in c[..nbytes].iter() {
                        value = (value << 8) | *byte as u64;
                    }
                }
            }
            return Ok(value);
        }

        // The general case: up to 9 bytes, leading and trailing
        // partial bits masked away.
        let firstbyte_bits = 8 - o;
        let bytes_minus1 = ((bits as i64 - firstbyte_bits as i64 + 7) / 8) as usize;
        let nbytes = bytes_minus1 + 1;

        let mut c = [0u8; 9];
        self.dev_pread(id, &mut c[..nbytes], offset / 8)?;

        // Assemble the stream: the `bits` contiguous bits starting
        // at bit `o` of the byte sequence, most significant first.
        let mut acc: u128 = 0;
        for byte in c[..nbytes].iter() {
            acc = (acc << 8) | *byte as u128;
        }
        let total_bits = (nbytes * 8) as u32;
        let stream = ((acc >> (total_bits - o - bits)) as u64) & width_mask(bits);

        let value = match endian {
            Endian::Msb => stream,
            // A value of eight bits or fewer has a single partial
            // byte; its bit order does not depend on endianness.
            Endian::Lsb if bits <= 8 => stream,
            Endian::Lsb => {
                if o == 0 {
                    // Byte-aligned LSB: whole bytes little-endian,
                    // the partial top byte contributes its low bits.
                    let full = bytes_minus1;
                    let p = bits % 8;
                    let mut value: u64 = 0;
                    for (i, byte) in c[..full].iter().enumerate() {
                        value |= (*byte as u64) << (8 * i);
                    }
                    value | (((c[full] & width_mask(p) as u8) as u64) << (8 * full))
                } else {
                    lsb_from_stream(stream, bits)
                }
            }
        };
        Ok(value)
    }

    fn write_uint_raw(
        &mut self,
        id: i32,
        offset: i64,
        bits: u32,
        endian: Endian,
        value: u64,
    ) -> IosResult<()> {
        debug_assert!((1..=64).contains(&bits));
        if offset < 0 {
            return Err(IosError::InvalidOffset);
        }
        let offset = offset as u64;
        let o = (offset % 8) as u32;
        let value = value & width_mask(bits);

        // Fast track for byte-aligned 8x widths.
        if o == 0 && bits % 8 == 0 {
            let nbytes = (bits / 8) as usize;
            let mut c = [0u8; 8];
            match endian {
                Endian::Lsb => {
                    for (i, byte) in c[..nbytes].iter_mut().enumerate() {
                        *byte = (value >> (8 * i)) as u8;
                    }
                }
                Endian::Msb => {
                    for (i, byte) in c[..nbytes].iter_mut().enumerate() {
                        *byte = (value >> (8 * (nbytes - 1 - i))) as u8;
                    }
                }
            }
            return self.dev_pwrite(id, &c[..nbytes], offset / 8).map_err(IosError::from);
        }

        // Partial bytes must be completed from the existing
        // contents, so the space must also be readable.
        self.check_perm(id, IosFlags::READ)?;

        let firstbyte_bits = 8 - o;
        let bytes_minus1 = ((bits as i64 - firstbyte_bits as i64 + 7) / 8) as usize;
        let nbytes = bytes_minus1 + 1;
        let lastbyte_bits = match (bits + o) % 8 {
            0 => 8,
            n => n,
        };

        if endian == Endian::Lsb && o == 0 && bits > 8 {
            // Byte-aligned LSB, width not a byte multiple: whole
            // bytes little-endian, the top partial byte merges its
            // low bits with the stored high bits.
            let full = bytes_minus1;
            let p = bits % 8;
            let mut c = [0u8; 9];
            for i in 0..full {
                c[i] = (value >> (8 * i)) as u8;
            }
            let existing = self.complete_byte(id, offset / 8 + full as u64)?;
            c[full] = (existing & !(width_mask(p) as u8)) | ((value >> (8 * full)) as u8 & width_mask(p) as u8);
            return self.dev_pwrite(id, &c[..nbytes], offset / 8).map_err(IosError::from);
        }

        // Compute the stream bits to store.
        let stream = match endian {
            Endian::Msb => value,
            Endian::Lsb if bits <= 8 => value,
            Endian::Lsb => lsb_to_stream(value, bits),
        };

        // Lay the stream into the write region and complete the
        // partial leading and trailing bytes from the device.
        let total_bits = (nbytes * 8) as u32;
        let acc: u128 = (stream as u128) << (total_bits - o - bits);
        let mut c = [0u8; 9];
        for i in 0..nbytes {
            c[i] = (acc >> (8 * (nbytes - 1 - i))) as u8;
        }

        let first_keep = if o > 0 {
            self.complete_byte(id, offset / 8)? & (0xffu8 << (8 - o))
        } else {
            0
        };
        let last_keep = if lastbyte_bits < 8 {
            self.complete_byte(id, offset / 8 + bytes_minus1 as u64)? & (0xffu8 >> lastbyte_bits)
        } else {
            0
        };
        c[0] |= first_keep;
        c[bytes_minus1] |= last_keep;

        self.dev_pwrite(id, &c[..nbytes], offset / 8).map_err(IosError::from)
    }

    /// Fetch the byte a partial write merges into. A byte past the
    /// end of the space reads as zero; whether the completed byte
    /// can be stored there is resolved when it is written back.
    fn complete_byte(&mut self, id: i32, byte_offset: u64) -> IosResult<u8> {
        let mut b = [0u8; 1];
        match self.dev_pread(id, &mut b, byte_offset) {
            Ok(()) => Ok(b[0]),
            Err(DevError::Eof) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /* Strings.  */

    /// Read a NUL-terminated string starting at a bit offset.
    pub fn read_string(&mut self, id: i32, offset: i64) -> IosResult<String> {
        self.check_perm(id, IosFlags::READ)?;
        let mut offset = self.effective_offset(id, offset)?;

        let mut bytes: Vec<u8> = Vec::new();
        if offset % 8 == 0 {
            // Byte-aligned: read bytes from the device until NUL.
            if offset < 0 {
                return Err(IosError::InvalidOffset);
            }
            let mut at = (offset / 8) as u64;
            loop {
                if bytes.len() % 128 == 0 {
                    bytes.reserve(128);
                }
                let mut b = [0u8; 1];
                self.dev_pread(id, &mut b, at)?;
                if b[0] == 0 {
                    break;
                }
                bytes.push(b[0]);
                at += 1;
            }
        } else {
            // Unaligned: go through 8-bit unsigned integer reads.
            loop {
                if bytes.len() % 128 == 0 {
                    bytes.reserve(128);
                }
                let b = self.read_uint_raw(id, offset, 8, Endian::Msb)? as u8;
                if b == 0 {
                    break;
                }
                bytes.push(b);
                offset += 8;
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Write a string plus its terminating NUL at a bit offset.
    pub fn write_string(&mut self, id: i32, offset: i64, value: &str) -> IosResult<()> {
        self.check_perm(id, IosFlags::WRITE)?;
        let offset = self.effective_offset(id, offset)?;

        if offset % 8 == 0 {
            if offset < 0 {
                return Err(IosError::InvalidOffset);
            }
            let at = (offset / 8) as u64;
            for (i, byte) in value.bytes().chain(std::iter::once(0)).enumerate() {
                self.dev_pwrite(id, &[byte], at + i as u64)?;
            }
        } else {
            let mut at = offset;
            for byte in value.bytes().chain(std::iter::once(0)) {
                self.write_uint_raw(id, at, 8, Endian::Msb, byte as u64)?;
                at += 8;
            }
        }
        Ok(())
    }
}

/// Sign-extend the low `bits` bits of `raw`.
fn sign_extend(raw: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((raw << shift) as i64) >> shift
}

fn width_mask(bits: u32) -> u64 {
    if bits == 0 {
        0
    } else if bits == 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Reassemble an unaligned little-endian value from its stream
/// bits: the first eight stream bits are value bits 7..0, the next
/// eight are 15..8, and the final partial group holds the top bits.
fn lsb_from_stream(stream: u64, bits: u32) -> u64 {
    let full = (bits / 8) as usize;
    let p = bits % 8;
    let mut value: u64 = 0;
    for k in 0..full {
        let chunk = (stream >> (bits - 8 * (k as u32 + 1))) & 0xff;
        value |= chunk << (8 * k);
    }
    if p > 0 {
        value |= (stream & width_mask(p)) << (8 * full);
    }
    value
}

/// The inverse of [`lsb_from_stream`].
fn lsb_to_stream(value: u64, bits: u32) -> u64 {
    let full = (bits / 8) as usize;
    let p = bits % 8;
    let mut stream: u64 = 0;
    for k in 0..full {
        let chunk = (value >> (8 * k)) & 0xff;
        stream |= chunk << (bits - 8 * (k as u32 + 1));
    }
    if p > 0 {
        stream |= (value >> (8 * full)) & width_mask(p);
    }
    stream
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_stack() -> (IosStack, i32) {
        let mut stack = IosStack::new();
        let id = stack.open("*scratch*", IosFlags::empty(), true).unwrap();
        (stack, id)
    }

    #[test]
    fn open_selects_backends_in_order() {
        let mut stack = IosStack::new();
        let z = stack.open("<zero>", IosFlags::empty(), false).unwrap();
        let m = stack.open("*m*", IosFlags::empty(), false).unwrap();
        assert_eq!(stack.if_name(z), Some("ZERO"));
        assert_eq!(stack.if_name(m), Some("MEMORY"));
        assert_eq!(stack.cur(), Some(z));
    }

    #[test]
    fn double_open_is_rejected() {
        let mut stack = IosStack::new();
        stack.open("*m*", IosFlags::empty(), true).unwrap();
        assert_eq!(
            stack.open("*m*", IosFlags::empty(), true),
            Err(IosError::Open)
        );
    }

    #[test]
    fn close_moves_the_current_space() {
        let mut stack = IosStack::new();
        let a = stack.open("*a*", IosFlags::empty(), true).unwrap();
        let b = stack.open("*b*", IosFlags::empty(), true).unwrap();
        assert_eq!(stack.cur(), Some(b));
        stack.close(b).unwrap();
        // The list head (the most recently opened survivor) becomes
        // current.
        assert_eq!(stack.cur(), Some(a));
        assert!(!stack.id_is_open(b));
    }

    #[test]
    fn ids_are_not_reused() {
        let mut stack = IosStack::new();
        let a = stack.open("*a*", IosFlags::empty(), true).unwrap();
        stack.close(a).unwrap();
        let b = stack.open("*a*", IosFlags::empty(), true).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn packed_integers_msb_and_lsb() {
        // The four bytes AB CD EF 12.
        let (mut stack, id) = mem_stack();
        stack.dev_pwrite(id, &[0xab, 0xcd, 0xef, 0x12], 0).unwrap();

        // 12 bits at bit offset 4, MSB.
        let v = stack.read_int(id, 4, 12, Endian::Msb, Nenc::Two).unwrap();
        assert_eq!(v as u64 & 0xfff, 0xbcd);

        // 12 bits at bit offset 0, LSB: whole low byte plus the low
        // nibble of the second byte on top.
        let v = stack.read_int(id, 0, 12, Endian::Lsb, Nenc::Two).unwrap();
        assert_eq!(v as u64 & 0xfff, 0xdab);
    }

    #[test]
    fn aligned_fast_paths() {
        let (mut stack, id) = mem_stack();
        stack
            .dev_pwrite(id, &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88], 0)
            .unwrap();
        assert_eq!(
            stack.read_uint(id, 0, 32, Endian::Msb).unwrap(),
            0x1122_3344
        );
        assert_eq!(
            stack.read_uint(id, 0, 32, Endian::Lsb).unwrap(),
            0x4433_2211
        );
        assert_eq!(
            stack.read_uint(id, 8, 24, Endian::Msb).unwrap(),
            0x2233_44
        );
        assert_eq!(
            stack.read_uint(id, 0, 64, Endian::Lsb).unwrap(),
            0x8877_6655_4433_2211
        );
    }

    #[test]
    fn bit_level_round_trip_all_widths_and_alignments() {
        let (mut stack, id) = mem_stack();
        let pattern: u64 = 0xa5de_97c3_1b2f_6e84;
        for endian in [Endian::Msb, Endian::Lsb] {
            for bits in 1..=64u32 {
                for shift in 0..8i64 {
                    let offset = 64 + shift;
                    let value = pattern & width_mask(bits);
                    stack.write_uint(id, offset, bits, endian, value).unwrap();
                    let back = stack.read_uint(id, offset, bits, endian).unwrap();
                    assert_eq!(
                        back, value,
                        "uint width {} at +{} {:?}",
                        bits, shift, endian
                    );
                }
            }
        }
    }

    #[test]
    fn signed_round_trip_sign_extends() {
        let (mut stack, id) = mem_stack();
        for endian in [Endian::Msb, Endian::Lsb] {
            // -3 needs at least three bits.
            for bits in 3..=64u32 {
                let value = -3i64;
                stack
                    .write_int(id, 128, bits, endian, Nenc::Two, value)
                    .unwrap();
                let back = stack.read_int(id, 128, bits, endian, Nenc::Two).unwrap();
                assert_eq!(back, value, "int width {} {:?}", bits, endian);
            }
        }
    }

    #[test]
    fn ones_complement_decoding() {
        let (mut stack, id) = mem_stack();
        // 4-bit pattern 0b1110 is -2 in two's complement, -1 in
        // one's complement.
        stack.write_uint(id, 0, 4, Endian::Msb, 0b1110).unwrap();
        assert_eq!(
            stack.read_int(id, 0, 4, Endian::Msb, Nenc::Two).unwrap(),
            -2
        );
        assert_eq!(
            stack.read_int(id, 0, 4, Endian::Msb, Nenc::One).unwrap(),
            -1
        );
        // And the encode side mirrors it.
        stack.write_int(id, 8, 4, Endian::Msb, Nenc::One, -1).unwrap();
        assert_eq!(stack.read_uint(id, 8, 4, Endian::Msb).unwrap(), 0b1110);
    }

    #[test]
    fn unaligned_writes_preserve_neighbors() {
        let (mut stack, id) = mem_stack();
        stack.dev_pwrite(id, &[0xff, 0xff, 0xff], 0).unwrap();
        stack.write_uint(id, 4, 12, Endian::Msb, 0).unwrap();
        let mut out = [0u8; 3];
        stack.dev_pread(id, &mut out, 0).unwrap();
        assert_eq!(out, [0xf0, 0x00, 0xff]);
    }

    #[test]
    fn bias_shifts_every_access() {
        let (mut stack, id) = mem_stack();
        stack.dev_pwrite(id, &[0x00, 0x42], 0).unwrap();
        stack.set_bias(id, 8);
        assert_eq!(stack.read_uint(id, 0, 8, Endian::Msb).unwrap(), 0x42);
    }

    #[test]
    fn strings_round_trip_aligned_and_not() {
        let (mut stack, id) = mem_stack();
        stack.write_string(id, 0, "poke").unwrap();
        assert_eq!(stack.read_string(id, 0).unwrap(), "poke");

        stack.write_string(id, 100 * 8 + 3, "shifted").unwrap();
        assert_eq!(stack.read_string(id, 100 * 8 + 3).unwrap(), "shifted");
    }

    #[test]
    fn permissions_are_checked() {
        let mut stack = IosStack::new();
        // A read-only stream device over a fixed source.
        let id = {
            let dev = dev_stream::StreamDevice::read_from(Box::new(std::io::Cursor::new(
                vec![1u8, 2, 3, 4],
            )));
            stack.insert_for_tests("<fixture>", Box::new(dev))
        };
        assert_eq!(
            stack.write_uint(id, 0, 8, Endian::Msb, 1),
            Err(IosError::Perm)
        );
        assert_eq!(stack.read_uint(id, 0, 8, Endian::Msb).unwrap(), 1);
    }

    #[test]
    fn sub_spaces_pass_through_with_bounds() {
        let (mut stack, base) = mem_stack();
        // Fill the first 100 bytes with 0xff.
        stack.dev_pwrite(base, &[0xff; 100], 0).unwrap();

        let sub = stack
            .open(&format!("sub://{}/10/16/win", base), IosFlags::empty(), false)
            .unwrap();
        assert_eq!(stack.if_name(sub), Some("SUB"));
        assert_eq!(stack.size(sub).unwrap(), 16);

        let mut buf = [0u8; 8];
        stack.dev_pread(sub, &mut buf, 0).unwrap();
        assert_eq!(buf, [0xff; 8]);

        // Writes land in the base window.
        stack.dev_pwrite(sub, &[0x01; 8], 0).unwrap();
        let mut base_bytes = [0u8; 8];
        stack.dev_pread(base, &mut base_bytes, 10).unwrap();
        assert_eq!(base_bytes, [0x01; 8]);

        // Reading at the window size reports EOF.
        assert_eq!(
            stack.dev_pread(sub, &mut buf, 16),
            Err(DevError::Eof)
        );

        // Operations after the base closes fail.
        stack.close(base).unwrap();
        assert_eq!(stack.dev_pread(sub, &mut buf, 0), Err(DevError::Error));
    }

    #[test]
    fn stream_scenario_with_flush() {
        let mut stack = IosStack::new();
        let dev = dev_stream::StreamDevice::read_from(Box::new(std::io::Cursor::new(vec![
            1u8, 2, 3, 4, 5,
        ])));
        let id = stack.insert_for_tests("<fixture>", Box::new(dev));

        let mut buf = [0u8; 3];
        stack.dev_pread(id, &mut buf, 0).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        stack.dev_pread(id, &mut buf, 2).unwrap();
        assert_eq!(buf, [3, 4, 5]);

        // Flushing at 3 bytes keeps chunk 0 (it is 2 KiB wide), so
        // everything stays readable.
        stack.flush(id, 3 * 8).unwrap();
        let mut one = [0u8; 1];
        stack.dev_pread(id, &mut one, 2).unwrap();
        assert_eq!(one, [3]);
        stack.dev_pread(id, &mut one, 0).unwrap();
        assert_eq!(one, [1]);
    }
}

#[cfg(test)]
impl IosStack {
    /// Install a prebuilt device, for fixtures that cannot go
    /// through handler-based opening (e.g. streams over cursors).
    pub(crate) fn insert_for_tests(&mut self, handler: &str, device: Box<dyn Device>) -> i32 {
        let id = self.next_id;
        self.next_id += 1;
        self.list.insert(
            0,
            Ios {
                id,
                handler: handler.to_string(),
                device: Some(device),
                if_name: "TEST",
                bias: 0,
            },
        );
        if self.cur.is_none() {
            self.cur = Some(id);
        }
        id
    }
}
