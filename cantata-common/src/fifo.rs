//! Bounded byte FIFO with speculative cursors
//!
//! Block transfers need to hand bytes to the wire (or accept them from it)
//! before the peer has acknowledged them. The FIFO therefore carries a
//! second pair of cursors: an *alt* read cursor that walks ahead of the main
//! read position without consuming, and an *alt* write region appended past
//! the committed data without publishing. `alt_finish` commits both at once,
//! optionally folding the committed bytes into a running CRC — so the CRC
//! covers every transferred byte exactly once, even across sub-block
//! retransmissions.

/// Running CRC-16 state with the parameters used by SDO block transfers
/// (polynomial 0x1021, initial value 0x0000)
pub type Crc16 = crc16::State<crc16::XMODEM>;

/// A bounded byte ring with speculative read/write cursors
#[derive(Debug)]
pub struct ByteFifo<const N: usize> {
    buf: [u8; N],
    /// Index of the next committed byte to read
    head: usize,
    /// Number of committed bytes available to read
    len: usize,
    /// Offset of the speculative read cursor, relative to `head`
    alt_read: usize,
    /// Number of speculatively written bytes past the committed region
    alt_write: usize,
}

impl<const N: usize> Default for ByteFifo<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ByteFifo<N> {
    /// Create a new, empty FIFO
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            head: 0,
            len: 0,
            alt_read: 0,
            alt_write: 0,
        }
    }

    /// Total capacity in bytes
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of committed bytes available to read
    pub fn occupied(&self) -> usize {
        self.len
    }

    /// Number of bytes which can still be written
    pub fn free(&self) -> usize {
        N - self.len - self.alt_write
    }

    /// Discard all contents and cursors
    pub fn reset(&mut self) {
        self.head = 0;
        self.len = 0;
        self.alt_read = 0;
        self.alt_write = 0;
    }

    /// Append bytes, optionally folding them into `crc`
    ///
    /// Returns the number of bytes accepted; never overwrites unread data.
    pub fn write(&mut self, data: &[u8], crc: Option<&mut Crc16>) -> usize {
        debug_assert_eq!(self.alt_write, 0, "write during speculative write");
        let count = data.len().min(self.free());
        self.copy_in((self.head + self.len) % N, &data[..count]);
        if let Some(crc) = crc {
            crc.update(&data[..count]);
        }
        self.len += count;
        count
    }

    /// Read and consume committed bytes
    ///
    /// Returns the number of bytes read. While a speculative read session
    /// has walked past the main position, the committed region belongs to it
    /// and nothing is returned until `alt_finish` runs.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        if self.alt_read > 0 {
            return 0;
        }
        let count = buf.len().min(self.len);
        self.copy_out(self.head, &mut buf[..count]);
        self.head = (self.head + count) % N;
        self.len -= count;
        count
    }

    /// Start a speculative session with the read cursor at `offset` bytes
    /// past the main read position
    ///
    /// `offset` must lie within the committed data. Re-positioning an active
    /// session is how a block download rewinds for retransmission.
    pub fn alt_begin(&mut self, offset: usize) {
        debug_assert!(offset <= self.len);
        self.alt_read = offset.min(self.len);
    }

    /// Current offset of the speculative read cursor, relative to the main
    /// read position
    pub fn alt_position(&self) -> usize {
        self.alt_read
    }

    /// Read committed bytes at the speculative cursor without consuming them
    pub fn alt_read(&mut self, buf: &mut [u8]) -> usize {
        let count = buf.len().min(self.len - self.alt_read);
        self.copy_out((self.head + self.alt_read) % N, &mut buf[..count]);
        self.alt_read += count;
        count
    }

    /// Append bytes speculatively, past the committed region
    ///
    /// The bytes are not visible to `read` until `alt_finish` publishes them.
    pub fn alt_write(&mut self, data: &[u8]) -> usize {
        let count = data.len().min(self.free());
        self.copy_in((self.head + self.len + self.alt_write) % N, &data[..count]);
        self.alt_write += count;
        count
    }

    /// Commit the speculative session
    ///
    /// Bytes walked by the alt read cursor are consumed, and speculatively
    /// written bytes are published. When `crc` is given it is updated over
    /// exactly the committed bytes. Returns the number of bytes consumed
    /// from the read side.
    pub fn alt_finish(&mut self, mut crc: Option<&mut Crc16>) -> usize {
        let consumed = self.alt_read;
        if let Some(crc) = crc.as_deref_mut() {
            self.crc_over(self.head, consumed, crc);
        }
        self.head = (self.head + consumed) % N;
        self.len -= consumed;
        self.alt_read = 0;

        if self.alt_write > 0 {
            if let Some(crc) = crc {
                self.crc_over((self.head + self.len) % N, self.alt_write, crc);
            }
            self.len += self.alt_write;
            self.alt_write = 0;
        }
        consumed
    }

    /// Discard any speculatively written bytes without publishing them
    pub fn alt_abandon(&mut self) {
        self.alt_read = 0;
        self.alt_write = 0;
    }

    fn copy_in(&mut self, pos: usize, data: &[u8]) {
        let first = data.len().min(N - pos);
        self.buf[pos..pos + first].copy_from_slice(&data[..first]);
        self.buf[..data.len() - first].copy_from_slice(&data[first..]);
    }

    fn copy_out(&self, pos: usize, buf: &mut [u8]) {
        let len = buf.len();
        let first = len.min(N - pos);
        buf[..first].copy_from_slice(&self.buf[pos..pos + first]);
        buf[first..].copy_from_slice(&self.buf[..len - first]);
    }

    fn crc_over(&self, pos: usize, count: usize, crc: &mut Crc16) {
        let first = count.min(N - pos);
        crc.update(&self.buf[pos..pos + first]);
        crc.update(&self.buf[..count - first]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut fifo = ByteFifo::<16>::new();
        assert_eq!(16, fifo.free());
        assert_eq!(5, fifo.write(&[1, 2, 3, 4, 5], None));
        assert_eq!(5, fifo.occupied());
        assert_eq!(11, fifo.free());

        let mut buf = [0; 8];
        assert_eq!(5, fifo.read(&mut buf));
        assert_eq!(&buf[..5], &[1, 2, 3, 4, 5]);
        assert_eq!(0, fifo.occupied());
    }

    #[test]
    fn test_never_overwrites_unread() {
        let mut fifo = ByteFifo::<8>::new();
        assert_eq!(8, fifo.write(&[0; 10], None));
        assert_eq!(0, fifo.write(&[0; 1], None));
        let mut buf = [0; 3];
        fifo.read(&mut buf);
        assert_eq!(3, fifo.write(&[1, 2, 3, 4], None));
    }

    #[test]
    fn test_wraparound() {
        let mut fifo = ByteFifo::<8>::new();
        let mut buf = [0; 8];
        // Push the cursors near the end, then write across the boundary
        fifo.write(&[0; 6], None);
        fifo.read(&mut buf[..6]);
        assert_eq!(5, fifo.write(&[10, 11, 12, 13, 14], None));
        let mut out = [0; 5];
        assert_eq!(5, fifo.read(&mut out));
        assert_eq!(out, [10, 11, 12, 13, 14]);
    }

    #[test]
    fn test_write_crc_matches_direct() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut fifo = ByteFifo::<128>::new();
        let mut crc = Crc16::new();
        fifo.write(&data, Some(&mut crc));
        assert_eq!(crc.get(), crc16::State::<crc16::XMODEM>::calculate(&data));
    }

    #[test]
    fn test_alt_read_commit_and_rewind() {
        let mut fifo = ByteFifo::<32>::new();
        let data: Vec<u8> = (0..21u8).collect();
        fifo.write(&data, None);

        // Speculatively read three segments
        fifo.alt_begin(0);
        let mut seg = [0; 7];
        for _ in 0..3 {
            assert_eq!(7, fifo.alt_read(&mut seg));
        }
        assert_eq!(21, fifo.occupied());

        // Peer only acked two segments; rewind and commit 14 bytes
        fifo.alt_begin(14);
        let mut crc = Crc16::new();
        assert_eq!(14, fifo.alt_finish(Some(&mut crc)));
        assert_eq!(7, fifo.occupied());
        assert_eq!(
            crc.get(),
            crc16::State::<crc16::XMODEM>::calculate(&data[..14])
        );

        // The remaining bytes replay from the new position
        fifo.alt_begin(0);
        assert_eq!(7, fifo.alt_read(&mut seg));
        assert_eq!(&seg, &data[14..21]);
    }

    #[test]
    fn test_alt_write_publish() {
        let mut fifo = ByteFifo::<32>::new();
        fifo.alt_begin(0);
        assert_eq!(7, fifo.alt_write(&[1, 2, 3, 4, 5, 6, 7]));
        assert_eq!(7, fifo.alt_write(&[8, 9, 10, 11, 12, 13, 14]));
        // Nothing readable until committed
        assert_eq!(0, fifo.occupied());
        assert_eq!(32 - 14, fifo.free());

        let mut crc = Crc16::new();
        fifo.alt_finish(Some(&mut crc));
        assert_eq!(14, fifo.occupied());
        let expect: Vec<u8> = (1..=14u8).collect();
        assert_eq!(
            crc.get(),
            crc16::State::<crc16::XMODEM>::calculate(&expect)
        );

        let mut out = [0; 14];
        assert_eq!(14, fifo.read(&mut out));
        assert_eq!(&out[..], &expect[..]);
    }

    #[test]
    fn test_alt_abandon() {
        let mut fifo = ByteFifo::<16>::new();
        fifo.alt_begin(0);
        fifo.alt_write(&[1, 2, 3]);
        fifo.alt_abandon();
        assert_eq!(0, fifo.occupied());
        assert_eq!(16, fifo.free());
    }
}
