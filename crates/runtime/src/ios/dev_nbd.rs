//! Network block device IO
//!
//! A minimal NBD client speaking the fixed-newstyle handshake with
//! `NBD_OPT_GO`, behind `nbd://host[:port]/export` and
//! `nbd+unix:///export?socket=PATH` handlers. Writability is probed
//! from the transmission flags the server advertises.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;

use super::dev::{DevError, DevResult, Device, DeviceInterface, IosFlags};
use super::IosStack;

const NBD_DEFAULT_PORT: u16 = 10809;

const NBDMAGIC: u64 = 0x4e42444d41474943; // "NBDMAGIC"
const IHAVEOPT: u64 = 0x49484156454f5054; // "IHAVEOPT"
const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1;
const NBD_FLAG_C_FIXED_NEWSTYLE: u32 = 1;

const NBD_OPT_GO: u32 = 7;
const NBD_REP_ACK: u32 = 1;
const NBD_REP_INFO: u32 = 3;
const NBD_INFO_EXPORT: u16 = 0;

const NBD_FLAG_READ_ONLY: u16 = 2;

const NBD_REQUEST_MAGIC: u32 = 0x25609513;
const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x67446698;

const NBD_CMD_READ: u16 = 0;
const NBD_CMD_WRITE: u16 = 1;
const NBD_CMD_DISC: u16 = 2;
const NBD_CMD_FLUSH: u16 = 3;

trait Socket: Read + Write {}
impl<T: Read + Write> Socket for T {}

pub struct NbdDevice {
    sock: Box<dyn Socket>,
    size: u64,
    flags: IosFlags,
    next_handle: u64,
}

fn handler_normalize(handler: &str, _flags: IosFlags) -> Option<String> {
    if handler.starts_with("nbd://") || handler.starts_with("nbd+unix://") {
        Some(handler.to_string())
    } else {
        None
    }
}

struct Uri {
    unix_socket: Option<String>,
    host: String,
    port: u16,
    export: String,
}

fn parse_uri(handler: &str) -> Option<Uri> {
    if let Some(rest) = handler.strip_prefix("nbd+unix://") {
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        let (export, query) = match rest.split_once('?') {
            Some((e, q)) => (e, q),
            None => (rest, ""),
        };
        let socket = query
            .split('&')
            .find_map(|kv| kv.strip_prefix("socket="))?
            .to_string();
        Some(Uri {
            unix_socket: Some(socket),
            host: String::new(),
            port: 0,
            export: export.to_string(),
        })
    } else if let Some(rest) = handler.strip_prefix("nbd://") {
        let (authority, export) = match rest.split_once('/') {
            Some((a, e)) => (a, e),
            None => (rest, ""),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().ok()?),
            None => (authority.to_string(), NBD_DEFAULT_PORT),
        };
        Some(Uri {
            unix_socket: None,
            host,
            port,
            export: export.to_string(),
        })
    } else {
        None
    }
}

fn read_u16(sock: &mut dyn Socket) -> DevResult<u16> {
    let mut b = [0u8; 2];
    sock.read_exact(&mut b).map_err(|_| DevError::Error)?;
    Ok(u16::from_be_bytes(b))
}

fn read_u32(sock: &mut dyn Socket) -> DevResult<u32> {
    let mut b = [0u8; 4];
    sock.read_exact(&mut b).map_err(|_| DevError::Error)?;
    Ok(u32::from_be_bytes(b))
}

fn read_u64(sock: &mut dyn Socket) -> DevResult<u64> {
    let mut b = [0u8; 8];
    sock.read_exact(&mut b).map_err(|_| DevError::Error)?;
    Ok(u64::from_be_bytes(b))
}

/// Run the fixed-newstyle handshake and negotiate the export.
/// Returns the export size and transmission flags.
fn handshake(sock: &mut dyn Socket, export: &str) -> DevResult<(u64, u16)> {
    if read_u64(sock)? != NBDMAGIC || read_u64(sock)? != IHAVEOPT {
        return Err(DevError::Error);
    }
    let hs_flags = read_u16(sock)?;
    if hs_flags & NBD_FLAG_FIXED_NEWSTYLE == 0 {
        return Err(DevError::Error);
    }
    sock.write_all(&(NBD_FLAG_C_FIXED_NEWSTYLE).to_be_bytes())
        .map_err(|_| DevError::Error)?;

    // NBD_OPT_GO: export name length + name, zero information requests.
    let mut opt = Vec::new();
    opt.extend_from_slice(&IHAVEOPT.to_be_bytes());
    opt.extend_from_slice(&NBD_OPT_GO.to_be_bytes());
    opt.extend_from_slice(&((4 + export.len() + 2) as u32).to_be_bytes());
    opt.extend_from_slice(&(export.len() as u32).to_be_bytes());
    opt.extend_from_slice(export.as_bytes());
    opt.extend_from_slice(&0u16.to_be_bytes());
    sock.write_all(&opt).map_err(|_| DevError::Error)?;

    let mut export_info: Option<(u64, u16)> = None;
    loop {
        let magic = read_u64(sock)?;
        if magic != 0x3e889045565a9 {
            return Err(DevError::Error);
        }
        let _option = read_u32(sock)?;
        let reply = read_u32(sock)?;
        let len = read_u32(sock)? as usize;
        let mut payload = vec![0u8; len];
        sock.read_exact(&mut payload).map_err(|_| DevError::Error)?;

        if reply & 0x8000_0000 != 0 {
            // Error reply from the server.
            return Err(DevError::Error);
        }
        match reply {
            NBD_REP_INFO => {
                if len >= 2 {
                    let info = u16::from_be_bytes([payload[0], payload[1]]);
                    if info == NBD_INFO_EXPORT && len >= 12 {
                        let size = u64::from_be_bytes(payload[2..10].try_into().unwrap());
                        let tflags = u16::from_be_bytes([payload[10], payload[11]]);
                        export_info = Some((size, tflags));
                    }
                }
            }
            NBD_REP_ACK => break,
            _ => {}
        }
    }
    export_info.ok_or(DevError::Error)
}

fn open_dev(_stack: &mut IosStack, handler: &str, _flags: IosFlags) -> DevResult<Box<dyn Device>> {
    let uri = parse_uri(handler).ok_or(DevError::Error)?;

    let mut sock: Box<dyn Socket> = match &uri.unix_socket {
        Some(path) => Box::new(UnixStream::connect(path).map_err(|_| DevError::Error)?),
        None => Box::new(
            TcpStream::connect((uri.host.as_str(), uri.port)).map_err(|_| DevError::Error)?,
        ),
    };

    let (size, tflags) = handshake(sock.as_mut(), &uri.export)?;

    // Probe for writability.
    let flags = if tflags & NBD_FLAG_READ_ONLY != 0 {
        IosFlags::READ
    } else {
        IosFlags::RDWR
    };

    Ok(Box::new(NbdDevice {
        sock,
        size,
        flags,
        next_handle: 1,
    }))
}

impl NbdDevice {
    fn request(&mut self, cmd: u16, offset: u64, len: u32, data: Option<&[u8]>) -> DevResult<u64> {
        let handle = self.next_handle;
        self.next_handle += 1;

        let mut req = Vec::with_capacity(28 + data.map_or(0, <[u8]>::len));
        req.extend_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        req.extend_from_slice(&0u16.to_be_bytes());
        req.extend_from_slice(&cmd.to_be_bytes());
        req.extend_from_slice(&handle.to_be_bytes());
        req.extend_from_slice(&offset.to_be_bytes());
        req.extend_from_slice(&len.to_be_bytes());
        if let Some(data) = data {
            req.extend_from_slice(data);
        }
        self.sock.write_all(&req).map_err(|_| DevError::Error)?;
        Ok(handle)
    }

    fn simple_reply(&mut self, handle: u64) -> DevResult<()> {
        if read_u32(self.sock.as_mut())? != NBD_SIMPLE_REPLY_MAGIC {
            return Err(DevError::Error);
        }
        let error = read_u32(self.sock.as_mut())?;
        let got_handle = read_u64(self.sock.as_mut())?;
        if got_handle != handle {
            return Err(DevError::Error);
        }
        if error != 0 {
            return Err(DevError::Error);
        }
        Ok(())
    }
}

impl Device for NbdDevice {
    fn pread(&mut self, _stack: &mut IosStack, buf: &mut [u8], offset: u64) -> DevResult<()> {
        if offset + buf.len() as u64 > self.size {
            return Err(DevError::Eof);
        }
        let handle = self.request(NBD_CMD_READ, offset, buf.len() as u32, None)?;
        self.simple_reply(handle)?;
        self.sock.read_exact(buf).map_err(|_| DevError::Error)
    }

    fn pwrite(&mut self, _stack: &mut IosStack, buf: &[u8], offset: u64) -> DevResult<()> {
        if offset + buf.len() as u64 > self.size {
            return Err(DevError::Eof);
        }
        let handle = self.request(NBD_CMD_WRITE, offset, buf.len() as u32, Some(buf))?;
        self.simple_reply(handle)
    }

    fn flags(&self) -> IosFlags {
        self.flags
    }

    fn size(&mut self, _stack: &mut IosStack) -> u64 {
        self.size
    }

    fn flush(&mut self, _stack: &mut IosStack, _offset: u64) -> DevResult<()> {
        let handle = self.request(NBD_CMD_FLUSH, 0, 0, None)?;
        self.simple_reply(handle)
    }

    fn close(&mut self) -> DevResult<()> {
        // Disconnect is fire-and-forget; the server does not reply.
        self.request(NBD_CMD_DISC, 0, 0, None).ok();
        Ok(())
    }
}

pub const INTERFACE: DeviceInterface = DeviceInterface {
    name: "NBD",
    handler_normalize,
    open: open_dev,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_uris_parse() {
        let uri = parse_uri("nbd://localhost:9999/disk").unwrap();
        assert_eq!(uri.host, "localhost");
        assert_eq!(uri.port, 9999);
        assert_eq!(uri.export, "disk");
        assert!(uri.unix_socket.is_none());

        let uri = parse_uri("nbd://server").unwrap();
        assert_eq!(uri.port, NBD_DEFAULT_PORT);
        assert_eq!(uri.export, "");
    }

    #[test]
    fn unix_uris_need_a_socket() {
        let uri = parse_uri("nbd+unix:///disk?socket=/tmp/nbd.sock").unwrap();
        assert_eq!(uri.unix_socket.as_deref(), Some("/tmp/nbd.sock"));
        assert_eq!(uri.export, "disk");
        assert!(parse_uri("nbd+unix:///disk").is_none());
    }
}
