//! SDO protocol messages
//!
//! Defines the request/response codecs, abort codes, and the raw-byte
//! helpers used by the block-transfer fast paths.

use int_enum::IntEnum;

use crate::messages::{CanId, CanMessage};

/// Server command specifier (SCS) values found in SDO response frames
#[derive(Clone, Copy, Debug, PartialEq)]
enum ServerCommand {
    SegmentUpload = 0,
    SegmentDownload = 1,
    Upload = 2,
    Download = 3,
    Abort = 4,
    BlockDownload = 5,
    BlockUpload = 6,
}

impl TryFrom<u8> for ServerCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ServerCommand::*;
        match value {
            0 => Ok(SegmentUpload),
            1 => Ok(SegmentDownload),
            2 => Ok(Upload),
            3 => Ok(Download),
            4 => Ok(Abort),
            5 => Ok(BlockDownload),
            6 => Ok(BlockUpload),
            _ => Err(()),
        }
    }
}

/// Client command specifier (CCS) values found in SDO request frames
#[derive(Clone, Copy, Debug, PartialEq)]
enum ClientCommand {
    DownloadSegment = 0,
    InitiateDownload = 1,
    InitiateUpload = 2,
    ReqUploadSegment = 3,
    Abort = 4,
    BlockUpload = 5,
    BlockDownload = 6,
}

impl TryFrom<u8> for ClientCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ClientCommand::*;
        match value {
            0 => Ok(DownloadSegment),
            1 => Ok(InitiateDownload),
            2 => Ok(InitiateUpload),
            3 => Ok(ReqUploadSegment),
            4 => Ok(Abort),
            5 => Ok(BlockUpload),
            6 => Ok(BlockDownload),
            _ => Err(()),
        }
    }
}

/// SDO abort code
///
/// The reason carried in the last four bytes of an abort frame
#[derive(Clone, Copy, Debug, PartialEq, IntEnum)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum AbortCode {
    /// Toggle bit not alternated
    ToggleNotAlternated = 0x0503_0000,
    /// SDO protocol timed out
    SdoTimeout = 0x0504_0000,
    /// Client/server command specifier not valid or unknown
    InvalidCommandSpecifier = 0x0504_0001,
    /// Invalid block size (block mode only)
    InvalidBlockSize = 0x0504_0002,
    /// Invalid sequence number (block mode only)
    InvalidSequenceNumber = 0x0504_0003,
    /// CRC error (block mode only)
    CrcError = 0x0504_0004,
    /// Out of memory
    OutOfMemory = 0x0504_0005,
    /// Unsupported access to an object
    UnsupportedAccess = 0x0601_0000,
    /// Attempt to read a write only object
    WriteOnly = 0x0601_0001,
    /// Attempt to write a read only object
    ReadOnly = 0x0601_0002,
    /// Object does not exist in the dictionary
    NoSuchObject = 0x0602_0000,
    /// General parameter incompatibility
    IncompatibleParameter = 0x0604_0043,
    /// Access failed due to hardware error
    HardwareError = 0x0606_0000,
    /// Data type does not match, length of service parameter does not match
    DataTypeMismatch = 0x0607_0010,
    /// Data type does not match, length of service parameter too high
    DataTypeMismatchLengthHigh = 0x0607_0012,
    /// Data type does not match, length of service parameter too low
    DataTypeMismatchLengthLow = 0x0607_0013,
    /// Sub-index does not exist
    NoSuchSubIndex = 0x0609_0011,
    /// Invalid value for parameter (download only)
    InvalidValue = 0x0609_0030,
    /// Resource isn't available
    ResourceNotAvailable = 0x060A_0023,
    /// General error
    GeneralError = 0x0800_0000,
    /// Data cannot be transferred or stored to the application
    CantStore = 0x0800_0020,
    /// No data available
    NoData = 0x0800_0024,
    /// General internal incompatibility in the device
    DeviceIncompatibility = 0x0804_0000,
}

/// Raw-byte views of an SDO frame payload
///
/// The block-transfer fast paths inspect incoming frames without building a
/// full [`SdoRequest`]/[`SdoResponse`], so the field extraction lives here as
/// plain functions over the 8 payload bytes.
pub mod raw {
    /// True when the frame is an abort (either direction)
    pub fn is_abort(data: &[u8]) -> bool {
        data[0] == 0x80
    }

    /// The 32-bit abort code from bytes 4..8
    pub fn abort_code(data: &[u8]) -> u32 {
        u32::from_le_bytes(data[4..8].try_into().unwrap())
    }

    /// The object index from bytes 1..3
    pub fn index(data: &[u8]) -> u16 {
        u16::from_le_bytes(data[1..3].try_into().unwrap())
    }

    /// The sub-index from byte 3
    pub fn subindex(data: &[u8]) -> u8 {
        data[3]
    }

    /// The toggle bit, masked in place (0x00 or 0x10)
    pub fn toggle(data: &[u8]) -> u8 {
        data[0] & 0x10
    }

    /// The negotiated block size from byte 4 of a block initiate frame
    pub fn block_size(data: &[u8]) -> u8 {
        data[4]
    }

    /// The CRC-support flag of a block initiate frame
    pub fn crc_enabled(data: &[u8]) -> bool {
        (data[0] & 0x04) != 0
    }

    /// The acknowledged segment count from byte 1 of a block confirm frame
    pub fn number_of_segments(data: &[u8]) -> u8 {
        data[1]
    }
}

/// The CAN message used to carry one segment of a block transfer
///
/// Block segments have no command specifier; the first byte holds a 7-bit
/// sequence number plus the last-segment flag.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlockSegment {
    /// Indicates this is the last segment of the entire transfer
    pub c: bool,
    /// Sequence number, 1..=127 within each sub-block
    pub seqnum: u8,
    /// The data bytes of this segment
    pub data: [u8; 7],
}

impl TryFrom<&[u8]> for BlockSegment {
    type Error = ();

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() != 8 {
            return Err(());
        }
        let c = (value[0] & (1 << 7)) != 0;
        let seqnum = value[0] & 0x7f;
        let data: [u8; 7] = value[1..8].try_into().unwrap();
        Ok(Self { c, seqnum, data })
    }
}

impl BlockSegment {
    /// Convert to the CAN message payload bytes
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0; 8];
        bytes[0] = ((self.c as u8) << 7) | (self.seqnum & 0x7f);
        bytes[1..8].copy_from_slice(&self.data);
        bytes
    }

    /// Create a CanMessage from the BlockSegment for transmission
    pub fn to_can_message(&self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.to_bytes())
    }
}

/// An SDO request, sent from client to server
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SdoRequest {
    /// Begin a download, writing data to an object on the server
    InitiateDownload {
        /// Number of unused bytes in data (expedited only)
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size-indicated flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Value when e=1, size when e=0 and s=1
        data: [u8; 4],
    },
    /// Send a segment of data to the server
    DownloadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// When set, this is the final segment
        c: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Begin an upload of data from an object on the server
    InitiateUpload {
        /// The requested object index
        index: u16,
        /// The requested sub object
        sub: u8,
    },
    /// Request the next segment in an upload
    ReqUploadSegment {
        /// Toggle flag
        t: bool,
    },
    /// Initiate a block download
    InitiateBlockDownload {
        /// Client CRC supported flag
        cc: bool,
        /// Size-indicated flag
        s: bool,
        /// Index of object to download to
        index: u16,
        /// Sub object to download to
        sub: u8,
        /// When s=1, the number of bytes to be downloaded
        size: u32,
    },
    /// End a block download
    EndBlockDownload {
        /// The number of bytes in the last segment which do not contain data
        n: u8,
        /// CRC of the downloaded data (when both sides support it)
        crc: u16,
    },
    /// Initiate a block upload
    InitiateBlockUpload {
        /// Client CRC supported flag
        cc: bool,
        /// Index of the object to upload
        index: u16,
        /// Sub index of the object to upload
        sub: u8,
        /// Number of segments per sub-block the client can accept
        blksize: u8,
        /// Protocol switch threshold
        ///
        /// When non-zero and the data size is `<= pst`, the server may
        /// answer with a segmented or expedited upload instead.
        pst: u8,
    },
    /// Request the server to start sending the first sub-block
    StartBlockUpload,
    /// Confirm receipt of a sub-block during a block upload
    ConfirmBlock {
        /// The sequence number of the last successfully received segment
        ackseq: u8,
        /// The number of segments to use for the next sub-block
        blksize: u8,
    },
    /// Acknowledge the end of a block upload
    EndBlockUpload,
    /// Sent by client to abort an ongoing transfer
    Abort {
        /// The object index of the active transfer
        index: u16,
        /// The sub object of the active transfer
        sub: u8,
        /// The abort reason
        abort_code: u32,
    },
}

impl SdoRequest {
    /// Create an abort message
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        SdoRequest::Abort {
            index,
            sub,
            abort_code: abort_code as u32,
        }
    }

    /// Create a segmented initiate download request
    pub fn initiate_download(index: u16, sub: u8, size: Option<u32>) -> Self {
        SdoRequest::InitiateDownload {
            n: 0,
            e: false,
            s: size.is_some(),
            index,
            sub,
            data: size.unwrap_or(0).to_le_bytes(),
        }
    }

    /// Create an expedited download request carrying up to 4 bytes
    pub fn expedited_download(index: u16, sub: u8, data: &[u8]) -> Self {
        let mut msg_data = [0; 4];
        msg_data[0..data.len()].copy_from_slice(data);
        SdoRequest::InitiateDownload {
            n: (4 - data.len()) as u8,
            e: true,
            s: true,
            index,
            sub,
            data: msg_data,
        }
    }

    /// Create a `DownloadSegment` request
    pub fn download_segment(toggle: bool, last_segment: bool, segment_data: &[u8]) -> Self {
        let mut data = [0; 7];
        data[0..segment_data.len()].copy_from_slice(segment_data);
        SdoRequest::DownloadSegment {
            t: toggle,
            n: 7 - segment_data.len() as u8,
            c: last_segment,
            data,
        }
    }

    /// Create an `InitiateUpload` request
    pub fn initiate_upload(index: u16, sub: u8) -> Self {
        SdoRequest::InitiateUpload { index, sub }
    }

    /// Create a `ReqUploadSegment` request
    pub fn upload_segment_request(toggle: bool) -> Self {
        SdoRequest::ReqUploadSegment { t: toggle }
    }

    /// Create an initiate block download request
    pub fn initiate_block_download(index: u16, sub: u8, crc_supported: bool, size: u32) -> Self {
        SdoRequest::InitiateBlockDownload {
            cc: crc_supported,
            s: true,
            index,
            sub,
            size,
        }
    }

    /// Create an end block download request
    ///
    /// # Arguments
    ///
    /// * `n` - Number of bytes in the last segment which do not contain data
    /// * `crc` - The CRC computed by the client for the downloaded data
    pub fn end_block_download(n: u8, crc: u16) -> Self {
        SdoRequest::EndBlockDownload { n, crc }
    }

    /// Create an initiate block upload request
    pub fn initiate_block_upload(index: u16, sub: u8, cc: bool, blksize: u8, pst: u8) -> Self {
        SdoRequest::InitiateBlockUpload {
            cc,
            index,
            sub,
            blksize,
            pst,
        }
    }

    /// Create a sub-block confirmation for a block upload
    pub fn confirm_block(ackseq: u8, blksize: u8) -> Self {
        SdoRequest::ConfirmBlock { ackseq, blksize }
    }

    /// Convert the request to message payload bytes
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0; 8];

        match self {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = ((ClientCommand::InitiateDownload as u8) << 5)
                    | ((n & 0x3) << 2)
                    | ((e as u8) << 1)
                    | s as u8;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoRequest::DownloadSegment { t, n, c, data } => {
                payload[0] = ((ClientCommand::DownloadSegment as u8) << 5)
                    | ((t as u8) << 4)
                    | ((n & 7) << 1)
                    | (c as u8);
                payload[1..8].copy_from_slice(&data);
            }
            SdoRequest::InitiateUpload { index, sub } => {
                payload[0] = (ClientCommand::InitiateUpload as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
            }
            SdoRequest::ReqUploadSegment { t } => {
                payload[0] = ((ClientCommand::ReqUploadSegment as u8) << 5) | ((t as u8) << 4);
            }
            SdoRequest::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ClientCommand::Abort as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
            SdoRequest::InitiateBlockDownload {
                cc,
                s,
                index,
                sub,
                size,
            } => {
                payload[0] = ((ClientCommand::BlockDownload as u8) << 5)
                    | ((cc as u8) << 2)
                    | ((s as u8) << 1);
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&size.to_le_bytes());
            }
            SdoRequest::EndBlockDownload { n, crc } => {
                payload[0] = ((ClientCommand::BlockDownload as u8) << 5)
                    | ((n & 7) << 2)
                    | BlockDownloadClientSub::EndDownload as u8;
                payload[1..3].copy_from_slice(&crc.to_le_bytes());
            }
            SdoRequest::InitiateBlockUpload {
                cc,
                index,
                sub,
                blksize,
                pst,
            } => {
                payload[0] = ((ClientCommand::BlockUpload as u8) << 5)
                    | ((cc as u8) << 2)
                    | BlockUploadClientSub::InitiateUpload as u8;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4] = blksize;
                payload[5] = pst;
            }
            SdoRequest::StartBlockUpload => {
                payload[0] = ((ClientCommand::BlockUpload as u8) << 5)
                    | BlockUploadClientSub::StartUpload as u8;
            }
            SdoRequest::ConfirmBlock { ackseq, blksize } => {
                payload[0] = ((ClientCommand::BlockUpload as u8) << 5)
                    | BlockUploadClientSub::ConfirmBlock as u8;
                payload[1] = ackseq;
                payload[2] = blksize;
            }
            SdoRequest::EndBlockUpload => {
                payload[0] = ((ClientCommand::BlockUpload as u8) << 5)
                    | BlockUploadClientSub::EndUpload as u8;
            }
        }
        payload
    }

    /// Convert the request to a CanMessage using the provided COB ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.to_bytes())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
enum BlockDownloadClientSub {
    InitiateDownload = 0,
    EndDownload = 1,
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
enum BlockUploadClientSub {
    InitiateUpload = 0,
    EndUpload = 1,
    ConfirmBlock = 2,
    StartUpload = 3,
}

impl TryFrom<u8> for BlockUploadClientSub {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::InitiateUpload),
            1 => Ok(Self::EndUpload),
            2 => Ok(Self::ConfirmBlock),
            3 => Ok(Self::StartUpload),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
enum BlockDownloadServerSub {
    InitiateAck = 0,
    EndAck = 1,
    ConfirmBlock = 2,
}

impl TryFrom<u8> for BlockDownloadServerSub {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::InitiateAck),
            1 => Ok(Self::EndAck),
            2 => Ok(Self::ConfirmBlock),
            _ => Err(()),
        }
    }
}

impl TryFrom<&[u8]> for SdoRequest {
    type Error = AbortCode;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(AbortCode::DataTypeMismatchLengthLow);
        }
        let ccs: ClientCommand = (value[0] >> 5)
            .try_into()
            .map_err(|_| AbortCode::InvalidCommandSpecifier)?;

        match ccs {
            ClientCommand::DownloadSegment => {
                let t = (value[0] & (1 << 4)) != 0;
                let n = (value[0] >> 1) & 0x7;
                let c = (value[0] & 1) != 0;
                let data = value[1..8].try_into().unwrap();
                Ok(SdoRequest::DownloadSegment { t, n, c, data })
            }
            ClientCommand::InitiateDownload => {
                let n = (value[0] >> 2) & 0x3;
                let e = (value[0] & (1 << 1)) != 0;
                let s = (value[0] & 1) != 0;
                let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
                let sub = value[3];
                let data = value[4..8].try_into().unwrap();
                Ok(SdoRequest::InitiateDownload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data,
                })
            }
            ClientCommand::InitiateUpload => {
                let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
                let sub = value[3];
                Ok(SdoRequest::InitiateUpload { index, sub })
            }
            ClientCommand::ReqUploadSegment => {
                let t = ((value[0] >> 4) & 1) != 0;
                Ok(SdoRequest::ReqUploadSegment { t })
            }
            ClientCommand::Abort => {
                let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
                let sub = value[3];
                let abort_code = u32::from_le_bytes(value[4..8].try_into().unwrap());
                Ok(SdoRequest::Abort {
                    index,
                    sub,
                    abort_code,
                })
            }
            ClientCommand::BlockUpload => {
                let sub_cmd = BlockUploadClientSub::try_from(value[0] & 0x3)
                    .map_err(|_| AbortCode::InvalidCommandSpecifier)?;
                match sub_cmd {
                    BlockUploadClientSub::InitiateUpload => {
                        let cc = (value[0] & (1 << 2)) != 0;
                        let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
                        let sub = value[3];
                        let blksize = value[4];
                        let pst = value[5];
                        Ok(SdoRequest::InitiateBlockUpload {
                            cc,
                            index,
                            sub,
                            blksize,
                            pst,
                        })
                    }
                    BlockUploadClientSub::EndUpload => Ok(SdoRequest::EndBlockUpload),
                    BlockUploadClientSub::ConfirmBlock => Ok(SdoRequest::ConfirmBlock {
                        ackseq: value[1],
                        blksize: value[2],
                    }),
                    BlockUploadClientSub::StartUpload => Ok(SdoRequest::StartBlockUpload),
                }
            }
            ClientCommand::BlockDownload => match value[0] & 0x1 {
                0 => {
                    let cc = (value[0] & (1 << 2)) != 0;
                    let s = (value[0] & (1 << 1)) != 0;
                    let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
                    let sub = value[3];
                    let size = u32::from_le_bytes(value[4..8].try_into().unwrap());
                    Ok(SdoRequest::InitiateBlockDownload {
                        cc,
                        s,
                        index,
                        sub,
                        size,
                    })
                }
                _ => {
                    let n = (value[0] >> 2) & 7;
                    let crc = u16::from_le_bytes(value[1..3].try_into().unwrap());
                    Ok(SdoRequest::EndBlockDownload { n, crc })
                }
            },
        }
    }
}

/// An SDO response, sent from server to client
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SdoResponse {
    /// Response to an [`SdoRequest::InitiateUpload`]
    ConfirmUpload {
        /// Number of unused bytes in data (expedited only)
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size-indicated flag
        s: bool,
        /// The index of the object being uploaded
        index: u16,
        /// The sub object being uploaded
        sub: u8,
        /// Value when e=1, size when s=1
        data: [u8; 4],
    },
    /// One segment of a segmented upload
    UploadSegment {
        /// Toggle flag
        t: bool,
        /// The number of unused bytes in data
        n: u8,
        /// Flag indicating this is the final segment
        c: bool,
        /// Object data
        data: [u8; 7],
    },
    /// Response to a [`SdoRequest::InitiateDownload`]
    ConfirmDownload {
        /// The index of the object being written
        index: u16,
        /// The sub object being written
        sub: u8,
    },
    /// Response to a [`SdoRequest::DownloadSegment`]
    ConfirmDownloadSegment {
        /// Toggle flag
        t: bool,
    },
    /// Confirm a block download initiation
    ConfirmBlockDownload {
        /// Flag indicating the server supports CRC checking
        sc: bool,
        /// Index of the object being downloaded
        index: u16,
        /// Sub index of the object being downloaded
        sub: u8,
        /// Number of segments the client shall send in the next sub-block
        blksize: u8,
    },
    /// Confirm receipt of a sub-block during a block download
    ConfirmBlock {
        /// Sequence number of the last segment successfully received
        ackseq: u8,
        /// Number of segments for the client to send in the next sub-block
        blksize: u8,
    },
    /// Confirm completion of a block download
    ConfirmBlockDownloadEnd,
    /// Confirm a block upload initiation
    ConfirmBlockUpload {
        /// Flag indicating the server supports CRC on block transfer
        sc: bool,
        /// Size-indicated flag
        s: bool,
        /// Index of the object being uploaded
        index: u16,
        /// Sub index of the object being uploaded
        sub: u8,
        /// Size of the object to be uploaded, when s=1
        size: u32,
    },
    /// Sent by the server after the last sub-block of a block upload
    BlockUploadEnd {
        /// The number of bytes in the last segment which are not valid
        n: u8,
        /// The CRC of the uploaded data (when both sides support it)
        crc: u16,
    },
    /// Sent by server to abort an ongoing transfer
    Abort {
        /// Object index of the active transfer
        index: u16,
        /// Sub object of the active transfer
        sub: u8,
        /// Abort reason
        abort_code: u32,
    },
}

impl SdoResponse {
    /// Create a `ConfirmUpload` response for an expedited upload
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than 4 bytes.
    pub fn expedited_upload(index: u16, sub: u8, data: &[u8]) -> SdoResponse {
        assert!(
            data.len() <= 4,
            "cannot create expedited upload with more than 4 bytes"
        );
        let mut msg_data = [0; 4];
        msg_data[0..data.len()].copy_from_slice(data);

        // For zero-length uploads the size bit is cleared to mark an empty
        // response
        let (s, n) = if data.is_empty() {
            (false, 0)
        } else {
            (true, 4 - data.len() as u8)
        };
        SdoResponse::ConfirmUpload {
            index,
            sub,
            e: true,
            s,
            n,
            data: msg_data,
        }
    }

    /// Create a `ConfirmUpload` response for a segmented upload
    pub fn upload_acknowledge(index: u16, sub: u8, size: Option<u32>) -> SdoResponse {
        SdoResponse::ConfirmUpload {
            n: 0,
            e: false,
            s: size.is_some(),
            index,
            sub,
            data: size.unwrap_or(0).to_le_bytes(),
        }
    }

    /// Create an `UploadSegment` response
    pub fn upload_segment(t: bool, c: bool, data: &[u8]) -> SdoResponse {
        let n = (7 - data.len()) as u8;
        let mut buf = [0; 7];
        buf[0..data.len()].copy_from_slice(data);
        SdoResponse::UploadSegment { t, n, c, data: buf }
    }

    /// Create a `ConfirmDownload` response
    pub fn download_acknowledge(index: u16, sub: u8) -> SdoResponse {
        SdoResponse::ConfirmDownload { index, sub }
    }

    /// Create a `ConfirmDownloadSegment` response
    pub fn download_segment_acknowledge(t: bool) -> SdoResponse {
        SdoResponse::ConfirmDownloadSegment { t }
    }

    /// Create a `ConfirmBlockDownload` response
    pub fn block_download_acknowledge(sc: bool, index: u16, sub: u8, blksize: u8) -> SdoResponse {
        SdoResponse::ConfirmBlockDownload {
            sc,
            index,
            sub,
            blksize,
        }
    }

    /// Create a `ConfirmBlockUpload` response
    pub fn block_upload_acknowledge(sc: bool, index: u16, sub: u8, size: Option<u32>) -> SdoResponse {
        SdoResponse::ConfirmBlockUpload {
            sc,
            s: size.is_some(),
            index,
            sub,
            size: size.unwrap_or(0),
        }
    }

    /// Create a `ConfirmBlock` response
    pub fn confirm_block(ackseq: u8, blksize: u8) -> SdoResponse {
        SdoResponse::ConfirmBlock { ackseq, blksize }
    }

    /// Create a `BlockUploadEnd` response
    pub fn block_upload_end(n: u8, crc: u16) -> SdoResponse {
        SdoResponse::BlockUploadEnd { n, crc }
    }

    /// Create an abort response
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> SdoResponse {
        SdoResponse::Abort {
            index,
            sub,
            abort_code: abort_code as u32,
        }
    }

    /// Convert the response to message payload bytes
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0; 8];

        match self {
            SdoResponse::ConfirmUpload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = ((ServerCommand::Upload as u8) << 5)
                    | ((n & 0x3) << 2)
                    | ((e as u8) << 1)
                    | (s as u8);
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoResponse::UploadSegment { t, n, c, data } => {
                payload[0] = ((ServerCommand::SegmentUpload as u8) << 5)
                    | ((t as u8) << 4)
                    | ((n & 7) << 1)
                    | c as u8;
                payload[1..8].copy_from_slice(&data);
            }
            SdoResponse::ConfirmDownload { index, sub } => {
                payload[0] = (ServerCommand::Download as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
            }
            SdoResponse::ConfirmDownloadSegment { t } => {
                payload[0] = ((ServerCommand::SegmentDownload as u8) << 5) | ((t as u8) << 4);
            }
            SdoResponse::ConfirmBlockDownload {
                sc,
                index,
                sub,
                blksize,
            } => {
                payload[0] = ((ServerCommand::BlockDownload as u8) << 5)
                    | ((sc as u8) << 2)
                    | BlockDownloadServerSub::InitiateAck as u8;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4] = blksize;
            }
            SdoResponse::ConfirmBlock { ackseq, blksize } => {
                payload[0] = ((ServerCommand::BlockDownload as u8) << 5)
                    | BlockDownloadServerSub::ConfirmBlock as u8;
                payload[1] = ackseq;
                payload[2] = blksize;
            }
            SdoResponse::ConfirmBlockDownloadEnd => {
                payload[0] = ((ServerCommand::BlockDownload as u8) << 5)
                    | BlockDownloadServerSub::EndAck as u8;
            }
            SdoResponse::ConfirmBlockUpload {
                sc,
                s,
                index,
                sub,
                size,
            } => {
                payload[0] = ((ServerCommand::BlockUpload as u8) << 5)
                    | ((sc as u8) << 2)
                    | ((s as u8) << 1);
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&size.to_le_bytes());
            }
            SdoResponse::BlockUploadEnd { n, crc } => {
                payload[0] = ((ServerCommand::BlockUpload as u8) << 5) | ((n & 7) << 2) | 0x1;
                payload[1..3].copy_from_slice(&crc.to_le_bytes());
            }
            SdoResponse::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ServerCommand::Abort as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }
        payload
    }

    /// Convert the response to a [CanMessage] using the provided COB ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.to_bytes())
    }
}

impl TryFrom<&[u8]> for SdoResponse {
    type Error = ();

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(());
        }
        let command: ServerCommand = (value[0] >> 5).try_into()?;
        match command {
            ServerCommand::SegmentUpload => {
                let t = (value[0] & (1 << 4)) != 0;
                let n = (value[0] >> 1) & 7;
                let c = (value[0] & 1) != 0;
                let data: [u8; 7] = value[1..8].try_into().unwrap();
                Ok(SdoResponse::UploadSegment { t, n, c, data })
            }
            ServerCommand::SegmentDownload => {
                let t = (value[0] & (1 << 4)) != 0;
                Ok(SdoResponse::ConfirmDownloadSegment { t })
            }
            ServerCommand::Upload => {
                let n = (value[0] >> 2) & 0x3;
                let e = (value[0] & (1 << 1)) != 0;
                let s = (value[0] & 1) != 0;
                let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
                let sub = value[3];
                let data: [u8; 4] = value[4..8].try_into().unwrap();
                Ok(SdoResponse::ConfirmUpload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data,
                })
            }
            ServerCommand::Download => {
                let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
                let sub = value[3];
                Ok(SdoResponse::ConfirmDownload { index, sub })
            }
            ServerCommand::BlockDownload => {
                match BlockDownloadServerSub::try_from(value[0] & 0x3)? {
                    BlockDownloadServerSub::InitiateAck => {
                        let sc = (value[0] & (1 << 2)) != 0;
                        let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
                        let sub = value[3];
                        let blksize = value[4];
                        Ok(SdoResponse::ConfirmBlockDownload {
                            sc,
                            index,
                            sub,
                            blksize,
                        })
                    }
                    BlockDownloadServerSub::EndAck => Ok(SdoResponse::ConfirmBlockDownloadEnd),
                    BlockDownloadServerSub::ConfirmBlock => Ok(SdoResponse::ConfirmBlock {
                        ackseq: value[1],
                        blksize: value[2],
                    }),
                }
            }
            ServerCommand::BlockUpload => {
                // The block upload sub-command is the single low bit; bits 1
                // and 2 carry the s/sc flags of the initiate ack
                if value[0] & 0x1 == 0 {
                    let s = (value[0] & (1 << 1)) != 0;
                    let sc = (value[0] & (1 << 2)) != 0;
                    let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
                    let sub = value[3];
                    let size = u32::from_le_bytes(value[4..8].try_into().unwrap());
                    Ok(SdoResponse::ConfirmBlockUpload {
                        sc,
                        s,
                        index,
                        sub,
                        size,
                    })
                } else {
                    let n = (value[0] >> 2) & 7;
                    let crc = u16::from_le_bytes(value[1..3].try_into().unwrap());
                    Ok(SdoResponse::BlockUploadEnd { n, crc })
                }
            }
            ServerCommand::Abort => {
                let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
                let sub = value[3];
                let abort_code = u32::from_le_bytes(value[4..8].try_into().unwrap());
                Ok(SdoResponse::Abort {
                    index,
                    sub,
                    abort_code,
                })
            }
        }
    }
}

impl TryFrom<CanMessage> for SdoResponse {
    type Error = ();

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        msg.data[..].try_into()
    }
}
