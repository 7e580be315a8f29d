//! Object dictionary access
//!
//! The SDO server does not know how object data is stored; it sees only the
//! [`ObjectAccess`] capability, and drives a positioned [`Streamer`] over a
//! single `(index, sub)` entry for the duration of a transfer. This crate
//! also provides a few in-memory field types so a static OD table can be
//! assembled without code generation.

use core::cell::UnsafeCell;

use crate::sdo::AbortCode;
use crate::AtomicCell;

/// Access permissions of a sub object
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum AccessType {
    /// Read-only
    #[default]
    Ro,
    /// Write-only
    Wo,
    /// Read-write
    Rw,
    /// Read-only, and never changed internally by the device either
    Const,
    /// No SDO access at all; the entry is reserved for local use (e.g.
    /// PDO-only data)
    None,
}

impl AccessType {
    /// True when SDO uploads are allowed
    pub fn is_readable(&self) -> bool {
        matches!(self, AccessType::Ro | AccessType::Rw | AccessType::Const)
    }

    /// True when SDO downloads are allowed
    pub fn is_writable(&self) -> bool {
        matches!(self, AccessType::Wo | AccessType::Rw)
    }
}

/// CANopen data type of a sub object
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DataType {
    Boolean,
    Int8,
    Int16,
    Int32,
    #[default]
    UInt8,
    UInt16,
    UInt32,
    Real32,
    VisibleString,
    OctetString,
    UnicodeString,
    Domain,
}

impl DataType {
    /// Returns true for the string types, which may hold values shorter
    /// than their allocated size
    pub fn is_str(&self) -> bool {
        matches!(
            self,
            DataType::VisibleString | DataType::OctetString | DataType::UnicodeString
        )
    }
}

/// Metadata describing one sub object
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct SubInfo {
    /// Allocated size in bytes; 0 when the entry does not declare one
    pub size: usize,
    /// The data type of the entry
    pub data_type: DataType,
    /// Access permissions
    pub access_type: AccessType,
}

impl SubInfo {
    /// Metadata for a sub 0 "highest sub-index" entry
    pub const MAX_SUB_NUMBER: SubInfo = SubInfo {
        size: 1,
        data_type: DataType::UInt8,
        access_type: AccessType::Const,
    };
}

/// Outcome of one positioned read or write
///
/// Distinguishes a transfer that stopped because the data ended from one
/// that stopped because the source or sink could not move more bytes right
/// now. Streaming entries (domains backed by flash, a peripheral, ...) use
/// the `partial` flag to report the latter; plain memory-backed entries
/// always complete or end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// Bytes moved by this call
    pub len: usize,
    /// More data exists, but it could not be moved in this call
    pub partial: bool,
}

impl Chunk {
    /// A transfer that moved `len` bytes with nothing left pending
    pub const fn complete(len: usize) -> Self {
        Self {
            len,
            partial: false,
        }
    }

    /// A transfer that moved `len` bytes with more still pending
    pub const fn partial(len: usize) -> Self {
        Self { len, partial: true }
    }
}

/// Byte-level access to one object in the dictionary
///
/// Implementations must tolerate concurrent calls; entries which can also be
/// touched by local actors are expected to guard their storage internally.
pub trait ObjectAccess: Sync + Send {
    /// Read bytes from a sub object starting at `offset`
    ///
    /// Fewer bytes than `buf.len()` may be returned, either because the
    /// data ended or, for streaming entries, because no more bytes are
    /// available right now; the returned [`Chunk`] tells the two apart.
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<Chunk, AbortCode>;

    /// Write bytes to a sub object starting at `offset`
    ///
    /// Sinks which cannot take the whole slice report how much they
    /// accepted, with `partial` set when a later call could accept more.
    fn write(&self, sub: u8, offset: usize, data: &[u8]) -> Result<Chunk, AbortCode>;

    /// Get metadata about a sub object
    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode>;

    /// Declare the stored length of a sub object
    ///
    /// Only meaningful for entries whose stored value may be shorter than
    /// the allocated size (strings). The default refuses.
    fn set_current_size(&self, _sub: u8, _size: usize) -> Result<(), AbortCode> {
        Err(AbortCode::UnsupportedAccess)
    }

    /// Get the current size of a sub object's value
    ///
    /// For strings this is the stored length, found by scanning for a NUL
    /// terminator; for everything else it equals the allocated size.
    fn current_size(&self, sub: u8) -> Result<usize, AbortCode> {
        const SCAN: usize = 8;
        let info = self.sub_info(sub)?;
        if info.data_type.is_str() {
            let mut buf = [0; SCAN];
            let mut offset = 0;
            while offset < info.size {
                let chunk = self.read(sub, offset, &mut buf[..SCAN.min(info.size - offset)])?;
                if let Some(pos) = buf[..chunk.len].iter().position(|b| *b == 0) {
                    return Ok(offset + pos);
                }
                if chunk.len == 0 {
                    break;
                }
                offset += chunk.len;
            }
        }
        Ok(info.size)
    }

    /// Read a sub object as a u8
    fn read_u8(&self, sub: u8) -> Result<u8, AbortCode> {
        let mut buf = [0; 1];
        self.read(sub, 0, &mut buf)?;
        Ok(buf[0])
    }

    /// Read a sub object as a little-endian u16
    fn read_u16(&self, sub: u8) -> Result<u16, AbortCode> {
        let mut buf = [0; 2];
        self.read(sub, 0, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Read a sub object as a little-endian u32
    fn read_u32(&self, sub: u8) -> Result<u32, AbortCode> {
        let mut buf = [0; 4];
        self.read(sub, 0, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

/// Identifies one sub object in the dictionary
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectId {
    /// The object index
    pub index: u16,
    /// The sub index
    pub sub: u8,
}

/// One row of the in-memory object table
pub struct ODEntry<'a> {
    /// The object index
    pub index: u16,
    /// Access to the object's data
    pub data: &'a dyn ObjectAccess,
}

/// Look up an object by index
///
/// The table is sorted by index, so this is a binary search.
pub fn find_object<'a>(od: &'a [ODEntry<'a>], index: u16) -> Option<&'a dyn ObjectAccess> {
    od.binary_search_by_key(&index, |e| e.index)
        .ok()
        .map(|i| od[i].data)
}

/// Positioned sequential access to a single `(index, sub)` entry
///
/// This is the view the SDO server holds for the duration of one transfer:
/// it remembers the position, exposes the entry metadata, and handles the
/// end-of-write fixup for string entries.
#[derive(Clone, Copy)]
pub struct Streamer<'a> {
    obj: &'a dyn ObjectAccess,
    /// The object index this streamer is bound to
    pub index: u16,
    /// The sub index this streamer is bound to
    pub sub: u8,
    /// Metadata captured when the streamer was opened
    pub info: SubInfo,
    pos: usize,
}

impl<'a> Streamer<'a> {
    /// Open a streamer over `(index, sub)`
    pub fn open(od: &'a [ODEntry<'a>], index: u16, sub: u8) -> Result<Self, AbortCode> {
        let obj = find_object(od, index).ok_or(AbortCode::NoSuchObject)?;
        let info = obj.sub_info(sub)?;
        Ok(Self {
            obj,
            index,
            sub,
            info,
            pos: 0,
        })
    }

    /// The current position in bytes
    pub fn position(&self) -> usize {
        self.pos
    }

    /// The current stored length of the entry's value
    pub fn current_size(&self) -> Result<usize, AbortCode> {
        self.obj.current_size(self.sub)
    }

    /// Read the next chunk, advancing the position by the bytes moved
    pub fn read(&mut self, buf: &mut [u8]) -> Result<Chunk, AbortCode> {
        let chunk = self.obj.read(self.sub, self.pos, buf)?;
        self.pos += chunk.len;
        Ok(chunk)
    }

    /// Read exactly `buf.len()` bytes
    ///
    /// The entry ending early yields [`AbortCode::NoData`]; a streaming
    /// source which cannot deliver synchronously yields
    /// [`AbortCode::ResourceNotAvailable`].
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), AbortCode> {
        let mut filled = 0;
        while filled < buf.len() {
            let chunk = self.read(&mut buf[filled..])?;
            filled += chunk.len;
            if chunk.len == 0 {
                return Err(if chunk.partial {
                    AbortCode::ResourceNotAvailable
                } else {
                    AbortCode::NoData
                });
            }
        }
        Ok(())
    }

    /// Write the next chunk, advancing the position by the bytes moved
    pub fn write(&mut self, data: &[u8]) -> Result<Chunk, AbortCode> {
        let chunk = self.obj.write(self.sub, self.pos, data)?;
        self.pos += chunk.len;
        Ok(chunk)
    }

    /// Write all of `data`, treating a stalled sink as out-of-memory
    pub fn write_all(&mut self, data: &[u8]) -> Result<(), AbortCode> {
        let mut written = 0;
        while written < data.len() {
            let chunk = self.write(&data[written..])?;
            written += chunk.len;
            if chunk.len == 0 {
                return Err(AbortCode::OutOfMemory);
            }
        }
        Ok(())
    }

    /// Move the position backwards by `count` bytes
    ///
    /// Used when a block upload peer requests retransmission.
    pub fn rewind(&mut self, count: usize) {
        self.pos = self.pos.saturating_sub(count);
    }

    /// Finish a write at the current position
    ///
    /// String entries shorter than their allocation are NUL terminated (two
    /// bytes for unicode strings) and their declared length updated to the
    /// transferred length.
    pub fn finish_write(&mut self) -> Result<(), AbortCode> {
        if self.info.data_type.is_str() && self.pos < self.info.size {
            let pad: &[u8] = if self.info.data_type == DataType::UnicodeString {
                &[0, 0]
            } else {
                &[0]
            };
            let pad = &pad[..pad.len().min(self.info.size - self.pos)];
            let terminated = self.pos;
            self.write_all(pad)?;
            // Entries without length tracking fall back to the terminator
            let _ = self.obj.set_current_size(self.sub, terminated);
        }
        Ok(())
    }
}

/// A single scalar value exposed as a one-sub object
pub struct ScalarField<T: Copy> {
    value: AtomicCell<T>,
    access: AccessType,
}

impl<T: Send + Copy> ScalarField<T> {
    /// Atomically read the value of the field
    pub fn get(&self) -> T {
        self.value.load()
    }

    /// Atomically store a new value into the field
    pub fn set(&self, value: T) {
        self.value.store(value);
    }
}

macro_rules! impl_scalar_field {
    ($rust_type:ty, $data_type:expr) => {
        impl ScalarField<$rust_type> {
            /// Create a new read-write field with the given value
            pub const fn new(value: $rust_type) -> Self {
                Self {
                    value: AtomicCell::new(value),
                    access: AccessType::Rw,
                }
            }

            /// Create a new read-only field with the given value
            pub const fn new_ro(value: $rust_type) -> Self {
                Self {
                    value: AtomicCell::new(value),
                    access: AccessType::Ro,
                }
            }
        }

        impl ObjectAccess for ScalarField<$rust_type> {
            fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<Chunk, AbortCode> {
                if sub != 0 {
                    return Err(AbortCode::NoSuchSubIndex);
                }
                let bytes = self.value.load().to_le_bytes();
                if offset >= bytes.len() {
                    return Ok(Chunk::complete(0));
                }
                let n = buf.len().min(bytes.len() - offset);
                buf[..n].copy_from_slice(&bytes[offset..offset + n]);
                Ok(Chunk::complete(n))
            }

            fn write(&self, sub: u8, offset: usize, data: &[u8]) -> Result<Chunk, AbortCode> {
                if sub != 0 {
                    return Err(AbortCode::NoSuchSubIndex);
                }
                let mut bytes = self.value.load().to_le_bytes();
                if offset + data.len() > bytes.len() {
                    return Err(AbortCode::DataTypeMismatchLengthHigh);
                }
                bytes[offset..offset + data.len()].copy_from_slice(data);
                self.value.store(<$rust_type>::from_le_bytes(bytes));
                Ok(Chunk::complete(data.len()))
            }

            fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
                if sub != 0 {
                    return Err(AbortCode::NoSuchSubIndex);
                }
                Ok(SubInfo {
                    size: core::mem::size_of::<$rust_type>(),
                    data_type: $data_type,
                    access_type: self.access,
                })
            }
        }
    };
}

impl_scalar_field!(u8, DataType::UInt8);
impl_scalar_field!(u16, DataType::UInt16);
impl_scalar_field!(u32, DataType::UInt32);
impl_scalar_field!(i8, DataType::Int8);
impl_scalar_field!(i16, DataType::Int16);
impl_scalar_field!(i32, DataType::Int32);
impl_scalar_field!(f32, DataType::Real32);

/// A fixed-size byte buffer exposed as a one-sub object
///
/// The data type is chosen at construction; octet strings get short-write
/// semantics from the server, domains behave the same, and scalar-ish uses
/// can pick an exact-size type.
pub struct ByteField<const N: usize> {
    data: UnsafeCell<[u8; N]>,
    data_type: DataType,
    access: AccessType,
}

// Interior access is serialized through critical sections
unsafe impl<const N: usize> Sync for ByteField<N> {}

impl<const N: usize> ByteField<N> {
    /// Create a new read-write byte field
    pub const fn new(data_type: DataType, initial: [u8; N]) -> Self {
        Self {
            data: UnsafeCell::new(initial),
            data_type,
            access: AccessType::Rw,
        }
    }

    /// Copy out the current contents
    pub fn get(&self) -> [u8; N] {
        critical_section::with(|_| unsafe { *self.data.get() })
    }

    /// Replace the contents
    pub fn set(&self, value: [u8; N]) {
        critical_section::with(|_| unsafe { *self.data.get() = value });
    }
}

impl<const N: usize> ObjectAccess for ByteField<N> {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<Chunk, AbortCode> {
        if sub != 0 {
            return Err(AbortCode::NoSuchSubIndex);
        }
        if offset >= N {
            return Ok(Chunk::complete(0));
        }
        let n = buf.len().min(N - offset);
        critical_section::with(|_| unsafe {
            buf[..n].copy_from_slice(&(&*self.data.get())[offset..offset + n]);
        });
        Ok(Chunk::complete(n))
    }

    fn write(&self, sub: u8, offset: usize, data: &[u8]) -> Result<Chunk, AbortCode> {
        if sub != 0 {
            return Err(AbortCode::NoSuchSubIndex);
        }
        if offset + data.len() > N {
            return Err(AbortCode::DataTypeMismatchLengthHigh);
        }
        critical_section::with(|_| unsafe {
            (&mut *self.data.get())[offset..offset + data.len()].copy_from_slice(data);
        });
        Ok(Chunk::complete(data.len()))
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        if sub != 0 {
            return Err(AbortCode::NoSuchSubIndex);
        }
        Ok(SubInfo {
            size: N,
            data_type: self.data_type,
            access_type: self.access,
        })
    }

    fn current_size(&self, sub: u8) -> Result<usize, AbortCode> {
        if sub != 0 {
            return Err(AbortCode::NoSuchSubIndex);
        }
        // Binary contents carry no terminator; the whole allocation is the
        // value even for string-typed fields
        Ok(N)
    }
}

/// A visible-string field with explicit length tracking
///
/// Unlike [`ByteField`], the stored length is tracked directly rather than
/// recovered by scanning for a terminator, and shorter writes update it.
pub struct StringField<const N: usize> {
    data: UnsafeCell<[u8; N]>,
    len: AtomicCell<usize>,
}

unsafe impl<const N: usize> Sync for StringField<N> {}

impl<const N: usize> StringField<N> {
    /// Create a new empty string field
    pub const fn new() -> Self {
        Self {
            data: UnsafeCell::new([0; N]),
            len: AtomicCell::new(0),
        }
    }

    /// Copy out the stored value
    #[cfg(feature = "std")]
    pub fn get(&self) -> std::vec::Vec<u8> {
        let len = self.len.load();
        let mut out = std::vec![0; len];
        critical_section::with(|_| unsafe {
            out.copy_from_slice(&(&*self.data.get())[..len]);
        });
        out
    }

    /// Store a new value, tracking its length
    pub fn set(&self, value: &[u8]) {
        let n = value.len().min(N);
        critical_section::with(|_| unsafe {
            (&mut *self.data.get())[..n].copy_from_slice(&value[..n]);
        });
        self.len.store(n);
    }
}

impl<const N: usize> Default for StringField<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ObjectAccess for StringField<N> {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<Chunk, AbortCode> {
        if sub != 0 {
            return Err(AbortCode::NoSuchSubIndex);
        }
        let len = self.len.load();
        if offset >= len {
            return Ok(Chunk::complete(0));
        }
        let n = buf.len().min(len - offset);
        critical_section::with(|_| unsafe {
            buf[..n].copy_from_slice(&(&*self.data.get())[offset..offset + n]);
        });
        Ok(Chunk::complete(n))
    }

    fn write(&self, sub: u8, offset: usize, data: &[u8]) -> Result<Chunk, AbortCode> {
        if sub != 0 {
            return Err(AbortCode::NoSuchSubIndex);
        }
        if offset + data.len() > N {
            return Err(AbortCode::DataTypeMismatchLengthHigh);
        }
        critical_section::with(|_| unsafe {
            (&mut *self.data.get())[offset..offset + data.len()].copy_from_slice(data);
        });
        // Writes extend the value; the terminator fixup shrinks it via
        // set_current_size
        if offset + data.len() > self.len.load() {
            self.len.store(offset + data.len());
        }
        Ok(Chunk::complete(data.len()))
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        if sub != 0 {
            return Err(AbortCode::NoSuchSubIndex);
        }
        Ok(SubInfo {
            size: N,
            data_type: DataType::VisibleString,
            access_type: AccessType::Rw,
        })
    }

    fn set_current_size(&self, sub: u8, size: usize) -> Result<(), AbortCode> {
        if sub != 0 {
            return Err(AbortCode::NoSuchSubIndex);
        }
        if size > N {
            return Err(AbortCode::DataTypeMismatchLengthHigh);
        }
        self.len.store(size);
        Ok(())
    }

    fn current_size(&self, sub: u8) -> Result<usize, AbortCode> {
        if sub != 0 {
            return Err(AbortCode::NoSuchSubIndex);
        }
        Ok(self.len.load())
    }
}

/// An array object: sub 0 holds the element count, subs 1..=N hold u32
/// values
///
/// This is the shape of the heartbeat consumer table at 0x1016.
pub struct U32Array<const N: usize> {
    values: [AtomicCell<u32>; N],
    access: AccessType,
}

impl<const N: usize> U32Array<N> {
    /// Create a new read-write array with the given contents
    pub const fn new(initial: [u32; N]) -> Self {
        let mut values = [const { AtomicCell::new(0) }; N];
        let mut i = 0;
        while i < N {
            values[i] = AtomicCell::new(initial[i]);
            i += 1;
        }
        Self {
            values,
            access: AccessType::Rw,
        }
    }

    /// Atomically read element `i` (0-based)
    pub fn get(&self, i: usize) -> u32 {
        self.values[i].load()
    }

    /// Atomically store element `i` (0-based)
    pub fn set(&self, i: usize, value: u32) {
        self.values[i].store(value);
    }
}

impl<const N: usize> ObjectAccess for U32Array<N> {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<Chunk, AbortCode> {
        if sub == 0 {
            if offset >= 1 {
                return Ok(Chunk::complete(0));
            }
            buf[0] = N as u8;
            return Ok(Chunk::complete(1));
        }
        let idx = sub as usize - 1;
        if idx >= N {
            return Err(AbortCode::NoSuchSubIndex);
        }
        let bytes = self.values[idx].load().to_le_bytes();
        if offset >= bytes.len() {
            return Ok(Chunk::complete(0));
        }
        let n = buf.len().min(bytes.len() - offset);
        buf[..n].copy_from_slice(&bytes[offset..offset + n]);
        Ok(Chunk::complete(n))
    }

    fn write(&self, sub: u8, offset: usize, data: &[u8]) -> Result<Chunk, AbortCode> {
        if sub == 0 {
            return Err(AbortCode::ReadOnly);
        }
        let idx = sub as usize - 1;
        if idx >= N {
            return Err(AbortCode::NoSuchSubIndex);
        }
        let mut bytes = self.values[idx].load().to_le_bytes();
        if offset + data.len() > bytes.len() {
            return Err(AbortCode::DataTypeMismatchLengthHigh);
        }
        bytes[offset..offset + data.len()].copy_from_slice(data);
        self.values[idx].store(u32::from_le_bytes(bytes));
        Ok(Chunk::complete(data.len()))
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        if sub == 0 {
            return Ok(SubInfo::MAX_SUB_NUMBER);
        }
        if sub as usize > N {
            return Err(AbortCode::NoSuchSubIndex);
        }
        Ok(SubInfo {
            size: 4,
            data_type: DataType::UInt32,
            access_type: self.access,
        })
    }
}

/// An SDO parameter record, the shape stored at 0x1200 (server) and 0x1280
/// (client)
///
/// Sub 1 and 2 hold the request/response COB-ID values (bit 31 marks the
/// channel invalid), sub 3 the peer node id.
pub struct SdoParams {
    /// COB-ID for client-to-server requests
    pub cob_c2s: AtomicCell<u32>,
    /// COB-ID for server-to-client responses
    pub cob_s2c: AtomicCell<u32>,
    /// Node id of the peer
    pub peer_node_id: AtomicCell<u8>,
}

impl SdoParams {
    /// Create a record with both channels marked invalid
    pub const fn new() -> Self {
        Self {
            cob_c2s: AtomicCell::new(crate::constants::COB_ID_INVALID_FLAG),
            cob_s2c: AtomicCell::new(crate::constants::COB_ID_INVALID_FLAG),
            peer_node_id: AtomicCell::new(0),
        }
    }

    /// Create a record holding the default channel pair for `node_id`
    pub const fn new_default(node_id: u8) -> Self {
        Self {
            cob_c2s: AtomicCell::new(0x600 + node_id as u32),
            cob_s2c: AtomicCell::new(0x580 + node_id as u32),
            peer_node_id: AtomicCell::new(node_id),
        }
    }
}

impl Default for SdoParams {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectAccess for SdoParams {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<Chunk, AbortCode> {
        let bytes: ([u8; 4], usize) = match sub {
            0 => ([3, 0, 0, 0], 1),
            1 => (self.cob_c2s.load().to_le_bytes(), 4),
            2 => (self.cob_s2c.load().to_le_bytes(), 4),
            3 => ([self.peer_node_id.load(), 0, 0, 0], 1),
            _ => return Err(AbortCode::NoSuchSubIndex),
        };
        let (bytes, size) = bytes;
        if offset >= size {
            return Ok(Chunk::complete(0));
        }
        let n = buf.len().min(size - offset);
        buf[..n].copy_from_slice(&bytes[offset..offset + n]);
        Ok(Chunk::complete(n))
    }

    fn write(&self, sub: u8, offset: usize, data: &[u8]) -> Result<Chunk, AbortCode> {
        if offset != 0 {
            return Err(AbortCode::UnsupportedAccess);
        }
        match sub {
            0 => Err(AbortCode::ReadOnly),
            1 | 2 => {
                if data.len() != 4 {
                    return Err(AbortCode::DataTypeMismatch);
                }
                let value = u32::from_le_bytes(data.try_into().unwrap());
                if sub == 1 {
                    self.cob_c2s.store(value);
                } else {
                    self.cob_s2c.store(value);
                }
                Ok(Chunk::complete(4))
            }
            3 => {
                if data.len() != 1 {
                    return Err(AbortCode::DataTypeMismatch);
                }
                self.peer_node_id.store(data[0]);
                Ok(Chunk::complete(1))
            }
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        match sub {
            0 => Ok(SubInfo::MAX_SUB_NUMBER),
            1 | 2 => Ok(SubInfo {
                size: 4,
                data_type: DataType::UInt32,
                access_type: AccessType::Rw,
            }),
            3 => Ok(SubInfo {
                size: 1,
                data_type: DataType::UInt8,
                access_type: AccessType::Rw,
            }),
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trip() {
        let field = ScalarField::<u32>::new(0xDEADBEEF);
        assert_eq!(field.read_u32(0).unwrap(), 0xDEADBEEF);
        field.write(0, 0, &0x12345678u32.to_le_bytes()).unwrap();
        assert_eq!(field.get(), 0x12345678);
        assert!(field.read(1, 0, &mut [0; 4]).is_err());
    }

    #[test]
    fn test_byte_field_bounds() {
        let field = ByteField::<8>::new(DataType::OctetString, [0; 8]);
        assert!(field.write(0, 4, &[1, 2, 3, 4]).is_ok());
        assert_eq!(
            field.write(0, 5, &[1, 2, 3, 4]),
            Err(AbortCode::DataTypeMismatchLengthHigh)
        );
        let mut buf = [0; 16];
        assert_eq!(field.read(0, 0, &mut buf).unwrap(), Chunk::complete(8));
    }

    #[test]
    fn test_string_field_length_tracking() {
        let field = StringField::<16>::new();
        field.write(0, 0, b"hello").unwrap();
        assert_eq!(field.current_size(0).unwrap(), 5);
        field.set_current_size(0, 3).unwrap();
        assert_eq!(field.current_size(0).unwrap(), 3);
        let mut buf = [0; 16];
        assert_eq!(field.read(0, 0, &mut buf).unwrap().len, 3);
        assert_eq!(&buf[..3], b"hel");
    }

    #[test]
    fn test_streamer_string_fixup() {
        static FIELD: StringField<16> = StringField::new();
        static OD: &[ODEntry] = &[ODEntry {
            index: 0x2000,
            data: &FIELD,
        }];
        let mut streamer = Streamer::open(OD, 0x2000, 0).unwrap();
        streamer.write(b"abcdefg").unwrap();
        streamer.finish_write().unwrap();
        assert_eq!(FIELD.current_size(0).unwrap(), 7);
        assert_eq!(FIELD.get(), b"abcdefg");
    }

    #[test]
    fn test_find_object() {
        static A: ScalarField<u8> = ScalarField::<u8>::new(1);
        static B: ScalarField<u8> = ScalarField::<u8>::new(2);
        static OD: &[ODEntry] = &[
            ODEntry {
                index: 0x1000,
                data: &A,
            },
            ODEntry {
                index: 0x2000,
                data: &B,
            },
        ];
        assert!(find_object(OD, 0x1000).is_some());
        assert!(find_object(OD, 0x1800).is_none());
    }

    /// A domain-style source that can only deliver a prefix of its data
    /// synchronously
    struct TrickleSource {
        data: [u8; 24],
        ready: usize,
    }

    impl ObjectAccess for TrickleSource {
        fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<Chunk, AbortCode> {
            if sub != 0 {
                return Err(AbortCode::NoSuchSubIndex);
            }
            if offset >= self.ready {
                return Ok(Chunk::partial(0));
            }
            let n = buf.len().min(self.ready - offset);
            buf[..n].copy_from_slice(&self.data[offset..offset + n]);
            if offset + n < self.data.len() {
                Ok(Chunk::partial(n))
            } else {
                Ok(Chunk::complete(n))
            }
        }

        fn write(&self, _sub: u8, _offset: usize, _data: &[u8]) -> Result<Chunk, AbortCode> {
            Err(AbortCode::ReadOnly)
        }

        fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
            if sub != 0 {
                return Err(AbortCode::NoSuchSubIndex);
            }
            Ok(SubInfo {
                size: self.data.len(),
                data_type: DataType::Domain,
                access_type: AccessType::Ro,
            })
        }
    }

    #[test]
    fn test_streamer_read_exact_stalled_source() {
        let mut data = [0u8; 24];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        let src = TrickleSource { data, ready: 10 };
        let od = [ODEntry {
            index: 0x2000,
            data: &src,
        }];
        let mut streamer = Streamer::open(&od, 0x2000, 0).unwrap();

        let mut buf = [0u8; 10];
        streamer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, &data[..10]);

        // The rest exists but is not deliverable now
        let mut more = [0u8; 4];
        assert_eq!(
            streamer.read_exact(&mut more),
            Err(AbortCode::ResourceNotAvailable)
        );
    }

    #[test]
    fn test_u32_array() {
        let table = U32Array::<2>::new([0x0025_0064, 0x0026_0064]);
        assert_eq!(table.read_u8(0).unwrap(), 2);
        assert_eq!(table.read_u32(1).unwrap(), 0x0025_0064);
        table.write(2, 0, &0x0030_00C8u32.to_le_bytes()).unwrap();
        assert_eq!(table.get(1), 0x0030_00C8);
        assert!(table.sub_info(3).is_err());
    }
}
