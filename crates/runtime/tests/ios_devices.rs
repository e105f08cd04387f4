//! Device-level integration tests: real files, sub-range windows
//! over them, and an NBD session against a toy in-process server.

use std::io::Write;

use poke_runtime::ios::dev::{DevError, IosFlags};
use poke_runtime::ios::{Endian, IosError, IosStack, Nenc};

#[test]
fn file_device_round_trips_and_reports_eof() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(&[0u8; 64]).unwrap();
    let path = f.path().to_str().unwrap().to_string();

    let mut stack = IosStack::new();
    let id = stack.open(&path, IosFlags::empty(), true).unwrap();
    assert_eq!(stack.if_name(id), Some("FILE"));
    assert_eq!(stack.size(id).unwrap(), 64);

    stack.dev_pwrite(id, &[1, 2, 3, 4], 10).unwrap();
    let mut buf = [0u8; 4];
    stack.dev_pread(id, &mut buf, 10).unwrap();
    assert_eq!(buf, [1, 2, 3, 4]);

    // Crossing the size reports EOF.
    let mut buf = [0u8; 8];
    assert_eq!(stack.dev_pread(id, &mut buf, 60), Err(DevError::Eof));

    stack.close(id).unwrap();
}

#[test]
fn file_opened_read_only_rejects_writes() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(b"fixed").unwrap();
    let path = f.path().to_str().unwrap().to_string();

    let mut stack = IosStack::new();
    let id = stack.open(&path, IosFlags::READ, true).unwrap();
    assert_eq!(
        stack.write_uint(id, 0, 8, Endian::Msb, 0xff),
        Err(IosError::Perm)
    );
    assert_eq!(stack.read_uint(id, 0, 8, Endian::Msb).unwrap(), b'f' as u64);
}

#[test]
fn sub_window_over_a_file() {
    // A 100-byte file of 0xff.
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(&[0xff; 100]).unwrap();
    let path = f.path().to_str().unwrap().to_string();

    let mut stack = IosStack::new();
    let base = stack.open(&path, IosFlags::empty(), true).unwrap();

    let sub = stack
        .open(&format!("sub://{}/10/16/win", base), IosFlags::empty(), false)
        .unwrap();

    let mut buf = [0u8; 8];
    stack.dev_pread(sub, &mut buf, 0).unwrap();
    assert_eq!(buf, [0xff; 8]);

    // Writing through the window modifies file bytes 10..17.
    stack.dev_pwrite(sub, &[0xaa; 8], 0).unwrap();
    let mut direct = [0u8; 8];
    stack.dev_pread(base, &mut direct, 10).unwrap();
    assert_eq!(direct, [0xaa; 8]);

    // Reading at the window size is EOF.
    assert_eq!(stack.dev_pread(sub, &mut buf, 16), Err(DevError::Eof));
}

#[test]
fn sub_window_flags_cannot_exceed_base() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(&[0u8; 32]).unwrap();
    let path = f.path().to_str().unwrap().to_string();

    let mut stack = IosStack::new();
    let base = stack.open(&path, IosFlags::READ, true).unwrap();
    let err = stack
        .open(&format!("sub://{}/0/8/w", base), IosFlags::RDWR, false)
        .unwrap_err();
    assert_eq!(err, IosError::InvalidFlags);
}

#[test]
fn integers_round_trip_through_a_file() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(&[0u8; 32]).unwrap();
    let path = f.path().to_str().unwrap().to_string();

    let mut stack = IosStack::new();
    let id = stack.open(&path, IosFlags::empty(), true).unwrap();
    for (bits, offset) in [(7u32, 3i64), (12, 4), (33, 17), (64, 40)] {
        stack
            .write_int(id, offset, bits, Endian::Msb, Nenc::Two, -5)
            .unwrap();
        assert_eq!(
            stack
                .read_int(id, offset, bits, Endian::Msb, Nenc::Two)
                .unwrap(),
            -5
        );
    }
}

mod nbd {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    const NBDMAGIC: u64 = 0x4e42444d41474943;
    const IHAVEOPT: u64 = 0x49484156454f5054;
    const OPT_REPLY_MAGIC: u64 = 0x3e889045565a9;

    /// A single-connection NBD server exporting a fixed in-memory
    /// disk, enough protocol for one handshake plus a few commands.
    fn serve_one(listener: TcpListener, mut disk: Vec<u8>) {
        let (mut s, _) = listener.accept().unwrap();
        let size = disk.len() as u64;

        s.write_all(&NBDMAGIC.to_be_bytes()).unwrap();
        s.write_all(&IHAVEOPT.to_be_bytes()).unwrap();
        s.write_all(&1u16.to_be_bytes()).unwrap(); // fixed newstyle

        let mut cflags = [0u8; 4];
        s.read_exact(&mut cflags).unwrap();

        // Expect a single NBD_OPT_GO.
        let mut opt_head = [0u8; 16];
        s.read_exact(&mut opt_head).unwrap();
        let option = u32::from_be_bytes(opt_head[8..12].try_into().unwrap());
        let len = u32::from_be_bytes(opt_head[12..16].try_into().unwrap());
        let mut payload = vec![0u8; len as usize];
        s.read_exact(&mut payload).unwrap();
        assert_eq!(option, 7);

        // NBD_REP_INFO with NBD_INFO_EXPORT, then NBD_REP_ACK.
        s.write_all(&OPT_REPLY_MAGIC.to_be_bytes()).unwrap();
        s.write_all(&option.to_be_bytes()).unwrap();
        s.write_all(&3u32.to_be_bytes()).unwrap();
        s.write_all(&12u32.to_be_bytes()).unwrap();
        s.write_all(&0u16.to_be_bytes()).unwrap();
        s.write_all(&size.to_be_bytes()).unwrap();
        s.write_all(&1u16.to_be_bytes()).unwrap(); // HAS_FLAGS, writable

        s.write_all(&OPT_REPLY_MAGIC.to_be_bytes()).unwrap();
        s.write_all(&option.to_be_bytes()).unwrap();
        s.write_all(&1u32.to_be_bytes()).unwrap();
        s.write_all(&0u32.to_be_bytes()).unwrap();

        // Transmission phase.
        loop {
            let mut req = [0u8; 28];
            if s.read_exact(&mut req).is_err() {
                return;
            }
            let cmd = u16::from_be_bytes(req[6..8].try_into().unwrap());
            let handle = u64::from_be_bytes(req[8..16].try_into().unwrap());
            let offset = u64::from_be_bytes(req[16..24].try_into().unwrap()) as usize;
            let length = u32::from_be_bytes(req[24..28].try_into().unwrap()) as usize;

            match cmd {
                0 => {
                    // READ
                    s.write_all(&0x67446698u32.to_be_bytes()).unwrap();
                    s.write_all(&0u32.to_be_bytes()).unwrap();
                    s.write_all(&handle.to_be_bytes()).unwrap();
                    s.write_all(&disk[offset..offset + length]).unwrap();
                }
                1 => {
                    // WRITE
                    let mut data = vec![0u8; length];
                    s.read_exact(&mut data).unwrap();
                    disk[offset..offset + length].copy_from_slice(&data);
                    s.write_all(&0x67446698u32.to_be_bytes()).unwrap();
                    s.write_all(&0u32.to_be_bytes()).unwrap();
                    s.write_all(&handle.to_be_bytes()).unwrap();
                }
                2 => return, // DISC
                _ => {
                    s.write_all(&0x67446698u32.to_be_bytes()).unwrap();
                    s.write_all(&0u32.to_be_bytes()).unwrap();
                    s.write_all(&handle.to_be_bytes()).unwrap();
                }
            }
        }
    }

    #[test]
    fn nbd_device_reads_and_writes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || serve_one(listener, vec![0x5a; 4096]));

        let mut stack = IosStack::new();
        let id = stack
            .open(&format!("nbd://127.0.0.1:{}/", port), IosFlags::empty(), true)
            .unwrap();
        assert_eq!(stack.if_name(id), Some("NBD"));
        assert_eq!(stack.size(id).unwrap(), 4096);

        let mut buf = [0u8; 4];
        stack.dev_pread(id, &mut buf, 100).unwrap();
        assert_eq!(buf, [0x5a; 4]);

        stack.dev_pwrite(id, &[1, 2, 3, 4], 200).unwrap();
        stack.dev_pread(id, &mut buf, 200).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        stack.close(id).unwrap();
        server.join().unwrap();
    }
}
