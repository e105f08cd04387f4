//! Chunked back store for stream devices
//!
//! Stream devices cannot seek, so the read side keeps everything it
//! has consumed from the stream in a sparse set of fixed 2 KiB
//! chunks, hashed by chunk number into a small bucket array. The
//! buffer can later discard a prefix (`forget_till`), advancing its
//! begin offset; reads below the begin offset fail EOF at the device
//! layer.
//!
//! `begin_offset` is the first offset not yet discarded.
//! `end_offset` is the first offset not yet read into the buffer.

pub const CHUNK_SIZE: u64 = 2048;
const BUCKET_COUNT: usize = 8;

struct Chunk {
    chunk_no: u64,
    bytes: Box<[u8; CHUNK_SIZE as usize]>,
}

pub struct IosBuffer {
    buckets: [Vec<Chunk>; BUCKET_COUNT],
    begin_offset: u64,
    end_offset: u64,
    next_chunk_no: u64,
}

fn chunk_no(offset: u64) -> u64 {
    offset / CHUNK_SIZE
}

fn chunk_offset(offset: u64) -> usize {
    (offset % CHUNK_SIZE) as usize
}

fn bucket_no(chunk_no: u64) -> usize {
    (chunk_no % BUCKET_COUNT as u64) as usize
}

impl Default for IosBuffer {
    fn default() -> Self {
        IosBuffer {
            buckets: Default::default(),
            begin_offset: 0,
            end_offset: 0,
            next_chunk_no: 0,
        }
    }
}

impl IosBuffer {
    pub fn new() -> IosBuffer {
        IosBuffer::default()
    }

    pub fn begin_offset(&self) -> u64 {
        self.begin_offset
    }

    pub fn end_offset(&self) -> u64 {
        self.end_offset
    }

    fn chunk_mut(&mut self, no: u64) -> Option<&mut Chunk> {
        self.buckets[bucket_no(no)]
            .iter_mut()
            .find(|c| c.chunk_no == no)
    }

    /// Allocate every chunk number up to and including `final_no`.
    /// Chunk numbers are allocated contiguously so the buffer has no
    /// holes below `next_chunk_no`.
    fn allocate_to(&mut self, final_no: u64) {
        debug_assert!(self.next_chunk_no <= final_no);
        while self.next_chunk_no <= final_no {
            let no = self.next_chunk_no;
            self.buckets[bucket_no(no)].push(Chunk {
                chunk_no: no,
                bytes: Box::new([0; CHUNK_SIZE as usize]),
            });
            self.next_chunk_no += 1;
        }
    }

    fn ensure_chunk(&mut self, no: u64) {
        if self.chunk_mut(no).is_none() {
            self.allocate_to(no);
        }
    }

    /// Copy out of the buffer. The caller has already checked the
    /// range against the begin and end offsets.
    pub fn pread(&mut self, buf: &mut [u8], offset: u64) {
        let mut no = chunk_no(offset);
        let mut coff = chunk_offset(offset);
        let mut done = 0usize;
        while done < buf.len() {
            self.ensure_chunk(no);
            let chunk = self.chunk_mut(no).expect("chunk just ensured");
            let take = (CHUNK_SIZE as usize - coff).min(buf.len() - done);
            buf[done..done + take].copy_from_slice(&chunk.bytes[coff..coff + take]);
            done += take;
            no += 1;
            coff = 0;
        }
    }

    /// Copy into the buffer, allocating chunks as needed, and track
    /// the greatest offset written.
    pub fn pwrite(&mut self, buf: &[u8], offset: u64) {
        let mut no = chunk_no(offset);
        let mut coff = chunk_offset(offset);
        let mut done = 0usize;
        while done < buf.len() {
            self.ensure_chunk(no);
            let chunk = self.chunk_mut(no).expect("chunk just ensured");
            let take = (CHUNK_SIZE as usize - coff).min(buf.len() - done);
            chunk.bytes[coff..coff + take].copy_from_slice(&buf[done..done + take]);
            done += take;
            no += 1;
            coff = 0;
        }
        if self.end_offset < offset + buf.len() as u64 {
            self.end_offset = offset + buf.len() as u64;
        }
    }

    /// Drop every chunk whose chunk number is below `offset / CHUNK`
    /// and advance the begin offset to that chunk boundary.
    pub fn forget_till(&mut self, offset: u64) {
        let keep_from = chunk_no(offset);
        for bucket in &mut self.buckets {
            bucket.retain(|c| c.chunk_no >= keep_from);
        }
        self.begin_offset = keep_from * CHUNK_SIZE;
        debug_assert!(self.end_offset >= self.begin_offset);
        debug_assert!(self.begin_offset <= offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let mut b = IosBuffer::new();
        b.pwrite(&[1, 2, 3, 4, 5], 0);
        assert_eq!(b.end_offset(), 5);
        let mut out = [0u8; 3];
        b.pread(&mut out, 1);
        assert_eq!(out, [2, 3, 4]);
    }

    #[test]
    fn writes_crossing_chunks() {
        let mut b = IosBuffer::new();
        let data: Vec<u8> = (0..=255).cycle().take(3 * CHUNK_SIZE as usize).map(|x: u16| x as u8).collect();
        b.pwrite(&data, CHUNK_SIZE - 7);
        let mut out = vec![0u8; data.len()];
        b.pread(&mut out, CHUNK_SIZE - 7);
        assert_eq!(out, data);
    }

    #[test]
    fn forget_till_advances_to_chunk_boundary() {
        let mut b = IosBuffer::new();
        b.pwrite(&[0xaa; 5000], 0);
        // Inside chunk 1: only chunk 0 is dropped.
        b.forget_till(CHUNK_SIZE + 10);
        assert_eq!(b.begin_offset(), CHUNK_SIZE);
        let mut out = [0u8; 1];
        b.pread(&mut out, CHUNK_SIZE);
        assert_eq!(out, [0xaa]);
    }
}
