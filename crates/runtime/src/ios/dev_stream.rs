//! Streaming IO devices
//!
//! `<stdin>` is a read-through device: everything consumed from the
//! stream lands in a chunked back store so earlier offsets stay
//! readable until they are explicitly discarded with `flush`.
//!
//! `<stdout>` and `<stderr>` are write-forward devices with a
//! watermark: writing past the watermark pads with zero bytes,
//! writing below it fails EOF. The watermark rule holds even on
//! seekable substrates, mirroring the read side's discard.

use std::io::{Read, Write};

use super::buffer::IosBuffer;
use super::dev::{DevError, DevResult, Device, DeviceInterface, IosFlags};
use super::IosStack;

const STDIN_HANDLER: &str = "<stdin>";
const STDOUT_HANDLER: &str = "<stdout>";
const STDERR_HANDLER: &str = "<stderr>";

enum StreamKind {
    /// Read side: underlying stream plus the back store.
    In {
        src: Box<dyn Read>,
        buffer: IosBuffer,
    },
    /// Write side: underlying sink plus the watermark.
    Out {
        sink: Box<dyn Write>,
        write_offset: u64,
    },
}

pub struct StreamDevice {
    kind: StreamKind,
}

impl StreamDevice {
    /// A read-through stream over an arbitrary source. The `open`
    /// entry point wires this to stdin; tests feed it cursors.
    pub fn read_from(src: Box<dyn Read>) -> StreamDevice {
        StreamDevice {
            kind: StreamKind::In {
                src,
                buffer: IosBuffer::new(),
            },
        }
    }

    /// A write-forward stream over an arbitrary sink.
    pub fn write_to(sink: Box<dyn Write>) -> StreamDevice {
        StreamDevice {
            kind: StreamKind::Out {
                sink,
                write_offset: 0,
            },
        }
    }
}

fn handler_normalize(handler: &str, _flags: IosFlags) -> Option<String> {
    match handler {
        STDIN_HANDLER | STDOUT_HANDLER | STDERR_HANDLER => Some(handler.to_string()),
        _ => None,
    }
}

fn open_dev(_stack: &mut IosStack, handler: &str, _flags: IosFlags) -> DevResult<Box<dyn Device>> {
    let dev = match handler {
        STDIN_HANDLER => StreamDevice::read_from(Box::new(std::io::stdin())),
        STDOUT_HANDLER => StreamDevice::write_to(Box::new(std::io::stdout())),
        STDERR_HANDLER => StreamDevice::write_to(Box::new(std::io::stderr())),
        _ => return Err(DevError::Error),
    };
    Ok(Box::new(dev))
}

impl Device for StreamDevice {
    fn pread(&mut self, _stack: &mut IosStack, buf: &mut [u8], offset: u64) -> DevResult<()> {
        let (src, buffer) = match &mut self.kind {
            StreamKind::In { src, buffer } => (src, buffer),
            StreamKind::Out { .. } => return Err(DevError::Error),
        };

        // Below the discarded prefix there is nothing left to serve.
        if buffer.begin_offset() > offset {
            return Err(DevError::Eof);
        }

        let count = buf.len() as u64;
        if buffer.end_offset() >= offset + count {
            buffer.pread(buf, offset);
            return Ok(());
        }

        // Serve what the buffer has, then fetch the tail from the
        // stream and append it to the buffer so the read is atomic
        // from the caller's point of view.
        let from_buffer = buffer.end_offset().saturating_sub(offset) as usize;
        if from_buffer > 0 {
            buffer.pread(&mut buf[..from_buffer], offset);
        }

        // The gap between the buffer end and an offset past it must
        // also come from the stream.
        let fetch_from = buffer.end_offset();
        let fetch_count = (offset + count - fetch_from) as usize;
        let mut fetched = vec![0u8; fetch_count];
        let mut total = 0usize;
        while total < fetch_count {
            match src.read(&mut fetched[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(_) => break,
            }
        }
        buffer.pwrite(&fetched[..total], fetch_from);

        if total < fetch_count {
            return Err(DevError::Eof);
        }
        let skip = (offset - fetch_from.min(offset)) as usize;
        let remaining = buf.len() - from_buffer;
        buf[from_buffer..].copy_from_slice(&fetched[skip..skip + remaining]);
        Ok(())
    }

    fn pwrite(&mut self, _stack: &mut IosStack, buf: &[u8], offset: u64) -> DevResult<()> {
        let (sink, write_offset) = match &mut self.kind {
            StreamKind::Out { sink, write_offset } => (sink, write_offset),
            StreamKind::In { .. } => return Err(DevError::Error),
        };

        // Offsets already written out are gone.
        if *write_offset > offset {
            return Err(DevError::Eof);
        }

        if offset > *write_offset {
            let pad = vec![0u8; (offset - *write_offset) as usize];
            sink.write_all(&pad).map_err(|_| DevError::Error)?;
        }
        sink.write_all(buf).map_err(|_| DevError::Error)?;
        *write_offset = offset + buf.len() as u64;
        Ok(())
    }

    fn flags(&self) -> IosFlags {
        match self.kind {
            StreamKind::In { .. } => IosFlags::READ,
            StreamKind::Out { .. } => IosFlags::WRITE,
        }
    }

    fn size(&mut self, _stack: &mut IosStack) -> u64 {
        match &self.kind {
            StreamKind::In { buffer, .. } => buffer.end_offset(),
            StreamKind::Out { write_offset, .. } => *write_offset,
        }
    }

    fn flush(&mut self, _stack: &mut IosStack, offset: u64) -> DevResult<()> {
        if let StreamKind::In { buffer, .. } = &mut self.kind {
            if offset > buffer.begin_offset() && offset <= buffer.end_offset() {
                buffer.forget_till(offset);
            }
        }
        Ok(())
    }

    fn close(&mut self) -> DevResult<()> {
        // Do not close the standard streams; the user may still be
        // in interactive mode.
        if let StreamKind::Out { sink, .. } = &mut self.kind {
            sink.flush().ok();
        }
        Ok(())
    }
}

pub const INTERFACE: DeviceInterface = DeviceInterface {
    name: "STREAM",
    handler_normalize,
    open: open_dev,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn stack() -> IosStack {
        IosStack::new()
    }

    #[test]
    fn reads_are_served_from_buffer_and_stream() {
        let mut st = stack();
        let mut dev = StreamDevice::read_from(Box::new(Cursor::new(vec![1, 2, 3, 4, 5])));
        let mut buf = [0u8; 3];
        dev.pread(&mut st, &mut buf, 0).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        // Overlapping read: two bytes from the buffer, one fetched.
        dev.pread(&mut st, &mut buf, 2).unwrap();
        assert_eq!(buf, [3, 4, 5]);
        assert_eq!(dev.size(&mut st), 5);
    }

    #[test]
    fn reading_past_the_stream_end_is_eof() {
        let mut st = stack();
        let mut dev = StreamDevice::read_from(Box::new(Cursor::new(vec![9])));
        let mut buf = [0u8; 4];
        assert_eq!(dev.pread(&mut st, &mut buf, 0), Err(DevError::Eof));
    }

    #[test]
    fn writes_below_watermark_fail_eof() {
        let mut st = stack();
        let mut dev = StreamDevice::write_to(Box::new(Vec::new()));
        dev.pwrite(&mut st, &[1, 2], 0).unwrap();
        assert_eq!(dev.pwrite(&mut st, &[3], 1), Err(DevError::Eof));
        // Past the watermark pads with zeroes.
        dev.pwrite(&mut st, &[7], 4).unwrap();
        assert_eq!(dev.size(&mut st), 5);
    }
}
