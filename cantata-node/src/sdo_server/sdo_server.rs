//! SDO server state machine

use crc16::CrcType as _;

use cantata_common::{
    messages::{CanId, CanMessage},
    objects::{ODEntry, ObjectId, Streamer, SubInfo},
    sdo::{AbortCode, BlockSegment, SdoRequest, SdoResponse},
};

use super::{sdo_receiver::SDO_BUFFER_SIZE, ReceiverState, SdoReceiver};

/// Number of segments per sub-block offered to downloading clients
///
/// The receive buffer holds a full 127-segment sub-block, so the maximum is
/// always offered.
const BLKSIZE: u8 = (SDO_BUFFER_SIZE / 7) as u8;

/// Default number of microseconds to wait for an expected message before
/// timing out a transfer
pub const DEFAULT_SDO_TIMEOUT_US: u32 = 1_000_000;

/// An outbound frame produced by the server
///
/// Block upload segments have no command specifier and so are not
/// representable as an [`SdoResponse`]; this wraps the two.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ServerFrame {
    /// A regular SDO response
    Response(SdoResponse),
    /// One segment of a block upload
    Segment(BlockSegment),
}

impl ServerFrame {
    /// Build the CAN message for this frame on the given COB-ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        match self {
            ServerFrame::Response(resp) => resp.to_can_message(id),
            ServerFrame::Segment(seg) => seg.to_can_message(id),
        }
    }
}

fn validate_download_size(dl_size: usize, info: &SubInfo) -> Result<(), AbortCode> {
    // Entries without a declared size accept whatever arrives and the
    // stored length is inferred from the transfer
    if info.size == 0 {
        return Ok(());
    }
    if info.data_type.is_str() {
        // Strings may be written shorter than their allocation
        if dl_size > info.size {
            return Err(AbortCode::DataTypeMismatchLengthHigh);
        }
    } else {
        if dl_size < info.size {
            return Err(AbortCode::DataTypeMismatchLengthLow);
        }
        if dl_size > info.size {
            return Err(AbortCode::DataTypeMismatchLengthHigh);
        }
    }
    Ok(())
}

/// Check SDO access permissions for the direction of a transfer
fn gate_access(info: &SubInfo, upload: bool) -> Result<(), AbortCode> {
    let access = info.access_type;
    if !access.is_readable() && !access.is_writable() {
        return Err(AbortCode::UnsupportedAccess);
    }
    if upload && !access.is_readable() {
        return Err(AbortCode::WriteOnly);
    }
    if !upload && !access.is_writable() {
        return Err(AbortCode::ReadOnly);
    }
    Ok(())
}

struct SdoResult {
    response: Option<SdoResponse>,
    updated_object: Option<ObjectId>,
    new_state: SdoState,
}

impl SdoResult {
    fn no_response(new_state: SdoState) -> Self {
        Self {
            response: None,
            updated_object: None,
            new_state,
        }
    }

    fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        Self {
            response: Some(SdoResponse::abort(index, sub, abort_code)),
            updated_object: None,
            new_state: SdoState::Idle,
        }
    }

    fn response(response: SdoResponse, new_state: SdoState) -> Self {
        Self {
            response: Some(response),
            updated_object: None,
            new_state,
        }
    }

    fn response_with_update(
        response: SdoResponse,
        index: u16,
        sub: u8,
        new_state: SdoState,
    ) -> Self {
        Self {
            response: Some(response),
            updated_object: Some(ObjectId { index, sub }),
            new_state,
        }
    }
}

#[derive(Clone, Copy)]
struct SegmentedDownload {
    streamer: Streamer<'static>,
    toggle: bool,
    /// Total size announced by the client, 0 when not indicated
    size_indicated: usize,
}

#[derive(Clone, Copy)]
struct SegmentedUpload {
    streamer: Streamer<'static>,
    toggle: bool,
    /// Bytes to transfer, captured when the upload began
    size: usize,
}

#[derive(Clone, Copy)]
struct BlockDownload {
    streamer: Streamer<'static>,
    client_crc: bool,
    crc: u16,
    size_indicated: usize,
    /// The final segment of the transfer, held back until the end request
    /// reveals how many of its bytes are padding
    last_data: [u8; 7],
}

#[derive(Clone, Copy)]
struct BlockUpload {
    streamer: Streamer<'static>,
    crc_enabled: bool,
    crc: u16,
    /// Total bytes to transfer, captured at initiate
    size: usize,
    /// Segments per sub-block requested by the client
    blksize: u8,
    /// Bytes of the current sub-block staged in the transfer buffer
    block_len: usize,
    /// Next segment sequence number to transmit, 1-based
    next_seq: u8,
}

impl BlockUpload {
    fn segments_in_block(&self) -> u8 {
        self.block_len.div_ceil(7) as u8
    }

    /// True when the staged sub-block reaches the end of the data
    fn is_final_block(&self) -> bool {
        self.streamer.position() == self.size
    }
}

#[derive(Clone, Copy)]
enum SdoState {
    Idle,
    DownloadSegmented(SegmentedDownload),
    UploadSegmented(SegmentedUpload),
    DownloadBlock(BlockDownload),
    EndDownloadBlock(BlockDownload),
    /// Initiate acknowledged, waiting for the start request
    UploadBlockStart(BlockUpload),
    /// Transmitting the staged sub-block
    UploadBlockSend(BlockUpload),
    /// Sub-block sent, waiting for the client's confirmation
    UploadBlockConfirm(BlockUpload),
    /// End frame sent, waiting for the client's final acknowledgement
    UploadBlockEnd(BlockUpload),
}

impl SdoState {
    fn update(
        &self,
        rx: &SdoReceiver,
        elapsed_us: u32,
        od: &'static [ODEntry<'static>],
        timeout_us: u32,
    ) -> SdoResult {
        match self {
            SdoState::Idle => Self::idle(od, rx),
            SdoState::DownloadSegmented(state) => {
                Self::download_segmented(state, rx, elapsed_us, timeout_us)
            }
            SdoState::UploadSegmented(state) => {
                Self::upload_segmented(state, rx, elapsed_us, timeout_us)
            }
            SdoState::DownloadBlock(state) => {
                Self::download_block(state, rx, elapsed_us, timeout_us)
            }
            SdoState::EndDownloadBlock(state) => {
                Self::end_download_block(state, rx, elapsed_us, timeout_us)
            }
            SdoState::UploadBlockStart(state) => {
                Self::upload_block_start(state, rx, elapsed_us, timeout_us)
            }
            // Transmission is pumped by SdoServer::process directly
            SdoState::UploadBlockSend(state) => {
                SdoResult::no_response(SdoState::UploadBlockSend(*state))
            }
            SdoState::UploadBlockConfirm(state) => {
                Self::upload_block_confirm(state, rx, elapsed_us, timeout_us)
            }
            SdoState::UploadBlockEnd(state) => {
                Self::upload_block_end(state, rx, elapsed_us, timeout_us)
            }
        }
    }

    /// Wait for a request, tracking the transfer timeout
    ///
    /// Returns the pending request, or the result to report this tick.
    fn expect_request(
        rx: &SdoReceiver,
        elapsed_us: u32,
        timeout_us: u32,
        state: SdoState,
        index: u16,
        sub: u8,
    ) -> Result<SdoRequest, SdoResult> {
        match rx.take_request() {
            Some(req) => Ok(req),
            None => {
                if rx.increment_timer(elapsed_us) > timeout_us {
                    Err(SdoResult::abort(index, sub, AbortCode::SdoTimeout))
                } else {
                    Err(SdoResult::no_response(state))
                }
            }
        }
    }

    fn idle(od: &'static [ODEntry<'static>], rx: &SdoReceiver) -> SdoResult {
        let req = match rx.take_request() {
            Some(req) => req,
            None => return SdoResult::no_response(SdoState::Idle),
        };

        match req {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                let mut streamer = match Streamer::open(od, index, sub) {
                    Ok(s) => s,
                    Err(code) => return SdoResult::abort(index, sub, code),
                };
                if let Err(code) = gate_access(&streamer.info, false) {
                    return SdoResult::abort(index, sub, code);
                }

                if e {
                    // Expedited download: the value is in the request
                    let dl_size = 4 - n as usize;
                    if let Err(code) = validate_download_size(dl_size, &streamer.info) {
                        return SdoResult::abort(index, sub, code);
                    }
                    if let Err(code) = streamer.write_all(&data[0..dl_size]) {
                        return SdoResult::abort(index, sub, code);
                    }
                    if let Err(code) = streamer.finish_write() {
                        return SdoResult::abort(index, sub, code);
                    }
                    SdoResult::response_with_update(
                        SdoResponse::download_acknowledge(index, sub),
                        index,
                        sub,
                        SdoState::Idle,
                    )
                } else {
                    // Segmented download; when a size is announced it is
                    // cross-checked against the entry now
                    let size_indicated = if s {
                        u32::from_le_bytes(data) as usize
                    } else {
                        0
                    };
                    if s {
                        if let Err(code) = validate_download_size(size_indicated, &streamer.info) {
                            return SdoResult::abort(index, sub, code);
                        }
                    }
                    SdoResult::response(
                        SdoResponse::download_acknowledge(index, sub),
                        SdoState::DownloadSegmented(SegmentedDownload {
                            streamer,
                            toggle: false,
                            size_indicated,
                        }),
                    )
                }
            }
            SdoRequest::InitiateUpload { index, sub } => Self::begin_upload(od, rx, index, sub),
            SdoRequest::InitiateBlockDownload {
                cc,
                s,
                index,
                sub,
                size,
            } => {
                let streamer = match Streamer::open(od, index, sub) {
                    Ok(s) => s,
                    Err(code) => return SdoResult::abort(index, sub, code),
                };
                if let Err(code) = gate_access(&streamer.info, false) {
                    return SdoResult::abort(index, sub, code);
                }
                if s {
                    if let Err(code) = validate_download_size(size as usize, &streamer.info) {
                        return SdoResult::abort(index, sub, code);
                    }
                }

                rx.begin_block_download(BLKSIZE);
                SdoResult::response(
                    SdoResponse::block_download_acknowledge(true, index, sub, BLKSIZE),
                    SdoState::DownloadBlock(BlockDownload {
                        streamer,
                        client_crc: cc,
                        crc: crc16::XMODEM::init(),
                        size_indicated: if s { size as usize } else { 0 },
                        last_data: [0; 7],
                    }),
                )
            }
            SdoRequest::InitiateBlockUpload {
                cc,
                index,
                sub,
                blksize,
                pst,
            } => {
                let streamer = match Streamer::open(od, index, sub) {
                    Ok(s) => s,
                    Err(code) => return SdoResult::abort(index, sub, code),
                };
                if let Err(code) = gate_access(&streamer.info, true) {
                    return SdoResult::abort(index, sub, code);
                }
                let size = match streamer.current_size() {
                    Ok(s) => s,
                    Err(code) => return SdoResult::abort(index, sub, code),
                };

                // Below the protocol switch threshold the transfer is
                // downgraded to a plain upload. Empty entries always
                // downgrade; a block transfer of zero segments has no
                // meaningful wire sequence.
                if size == 0 || (pst > 0 && size <= pst as usize) {
                    return Self::begin_upload(od, rx, index, sub);
                }

                if blksize == 0 || blksize > 127 {
                    return SdoResult::abort(index, sub, AbortCode::InvalidBlockSize);
                }

                SdoResult::response(
                    SdoResponse::block_upload_acknowledge(true, index, sub, Some(size as u32)),
                    SdoState::UploadBlockStart(BlockUpload {
                        streamer,
                        crc_enabled: cc,
                        crc: crc16::XMODEM::init(),
                        size,
                        blksize,
                        block_len: 0,
                        next_seq: 1,
                    }),
                )
            }
            // An abort outside of a transfer is ignored
            SdoRequest::Abort { .. } => SdoResult::no_response(SdoState::Idle),
            _ => SdoResult::abort(0, 0, AbortCode::InvalidCommandSpecifier),
        }
    }

    /// Shared initiate path for plain uploads, also used when a block
    /// upload is downgraded via the protocol switch threshold
    fn begin_upload(
        od: &'static [ODEntry<'static>],
        _rx: &SdoReceiver,
        index: u16,
        sub: u8,
    ) -> SdoResult {
        let mut streamer = match Streamer::open(od, index, sub) {
            Ok(s) => s,
            Err(code) => return SdoResult::abort(index, sub, code),
        };
        if let Err(code) = gate_access(&streamer.info, true) {
            return SdoResult::abort(index, sub, code);
        }
        let size = match streamer.current_size() {
            Ok(s) => s,
            Err(code) => return SdoResult::abort(index, sub, code),
        };

        if size <= 4 {
            // Expedited upload
            let mut buf = [0u8; 4];
            if let Err(code) = streamer.read_exact(&mut buf[..size]) {
                return SdoResult::abort(index, sub, code);
            }
            SdoResult::response(
                SdoResponse::expedited_upload(index, sub, &buf[..size]),
                SdoState::Idle,
            )
        } else {
            SdoResult::response(
                SdoResponse::upload_acknowledge(index, sub, Some(size as u32)),
                SdoState::UploadSegmented(SegmentedUpload {
                    streamer,
                    toggle: false,
                    size,
                }),
            )
        }
    }

    fn download_segmented(
        state: &SegmentedDownload,
        rx: &SdoReceiver,
        elapsed_us: u32,
        timeout_us: u32,
    ) -> SdoResult {
        let mut state = *state;
        let (index, sub) = (state.streamer.index, state.streamer.sub);
        let req = match Self::expect_request(
            rx,
            elapsed_us,
            timeout_us,
            SdoState::DownloadSegmented(state),
            index,
            sub,
        ) {
            Ok(req) => req,
            Err(result) => return result,
        };

        match req {
            SdoRequest::DownloadSegment { t, n, c, data } => {
                if t != state.toggle {
                    return SdoResult::abort(index, sub, AbortCode::ToggleNotAlternated);
                }

                let seg_len = 7 - n as usize;
                if state.size_indicated > 0
                    && state.streamer.position() + seg_len > state.size_indicated
                {
                    return SdoResult::abort(index, sub, AbortCode::DataTypeMismatchLengthHigh);
                }
                if let Err(code) = state.streamer.write_all(&data[0..seg_len]) {
                    return SdoResult::abort(index, sub, code);
                }

                if c {
                    let transferred = state.streamer.position();
                    // The final segment must land exactly on the announced
                    // size, and on the entry size for exact-size entries
                    if state.size_indicated > 0 && transferred < state.size_indicated {
                        return SdoResult::abort(index, sub, AbortCode::DataTypeMismatchLengthLow);
                    }
                    let info = state.streamer.info;
                    if !info.data_type.is_str() && info.size > 0 && transferred < info.size {
                        return SdoResult::abort(index, sub, AbortCode::DataTypeMismatchLengthLow);
                    }
                    if let Err(code) = state.streamer.finish_write() {
                        return SdoResult::abort(index, sub, code);
                    }
                    SdoResult::response_with_update(
                        SdoResponse::download_segment_acknowledge(state.toggle),
                        index,
                        sub,
                        SdoState::Idle,
                    )
                } else {
                    let toggle = state.toggle;
                    state.toggle = !state.toggle;
                    SdoResult::response(
                        SdoResponse::download_segment_acknowledge(toggle),
                        SdoState::DownloadSegmented(state),
                    )
                }
            }
            SdoRequest::Abort { .. } => SdoResult::no_response(SdoState::Idle),
            _ => SdoResult::abort(index, sub, AbortCode::InvalidCommandSpecifier),
        }
    }

    fn upload_segmented(
        state: &SegmentedUpload,
        rx: &SdoReceiver,
        elapsed_us: u32,
        timeout_us: u32,
    ) -> SdoResult {
        let mut state = *state;
        let (index, sub) = (state.streamer.index, state.streamer.sub);
        let req = match Self::expect_request(
            rx,
            elapsed_us,
            timeout_us,
            SdoState::UploadSegmented(state),
            index,
            sub,
        ) {
            Ok(req) => req,
            Err(result) => return result,
        };

        match req {
            SdoRequest::ReqUploadSegment { t } => {
                if t != state.toggle {
                    return SdoResult::abort(index, sub, AbortCode::ToggleNotAlternated);
                }

                let remaining = state.size - state.streamer.position();
                let seg_len = remaining.min(7);
                let mut buf = [0; 7];
                if let Err(code) = state.streamer.read_exact(&mut buf[..seg_len]) {
                    return SdoResult::abort(index, sub, code);
                }
                let c = state.streamer.position() == state.size;

                let toggle = state.toggle;
                state.toggle = !state.toggle;
                let new_state = if c {
                    SdoState::Idle
                } else {
                    SdoState::UploadSegmented(state)
                };
                SdoResult::response(
                    SdoResponse::upload_segment(toggle, c, &buf[..seg_len]),
                    new_state,
                )
            }
            SdoRequest::Abort { .. } => SdoResult::no_response(SdoState::Idle),
            _ => SdoResult::abort(index, sub, AbortCode::InvalidCommandSpecifier),
        }
    }

    fn download_block(
        state: &BlockDownload,
        rx: &SdoReceiver,
        elapsed_us: u32,
        timeout_us: u32,
    ) -> SdoResult {
        let mut state = *state;
        let (index, sub) = (state.streamer.index, state.streamer.sub);

        // Sub-block segments are collected by the receiver without any
        // response; the server waits for it to report completion.
        match rx.state() {
            // The receiver dropped back to normal: it saw an abort
            ReceiverState::Normal => {
                let _ = rx.take_request();
                SdoResult::no_response(SdoState::Idle)
            }
            ReceiverState::BlockReceive => {
                if rx.increment_timer(elapsed_us) > timeout_us {
                    rx.set_state(ReceiverState::Normal);
                    SdoResult::abort(index, sub, AbortCode::SdoTimeout)
                } else {
                    SdoResult::no_response(SdoState::DownloadBlock(state))
                }
            }
            ReceiverState::BlockCompleted {
                ackseq,
                last_segment,
                complete,
            } => {
                if ackseq != last_segment {
                    // Segments were lost; ask for retransmission of
                    // everything after the last good one
                    rx.restart_block_download(ackseq);
                    return SdoResult::response(
                        SdoResponse::confirm_block(ackseq, BLKSIZE),
                        SdoState::DownloadBlock(state),
                    );
                }

                // Unwrap safety: in BlockCompleted state the client is
                // waiting for our confirmation and sends no segments
                let buffer = unsafe { rx.buffer() };

                // In the final sub-block all but the last segment is
                // stored; its valid length is unknown until the end request
                // arrives
                let count = if complete {
                    let keep_from = (last_segment as usize - 1) * 7;
                    state
                        .last_data
                        .copy_from_slice(&buffer[keep_from..keep_from + 7]);
                    keep_from
                } else {
                    last_segment as usize * 7
                };

                if state.size_indicated > 0
                    && state.streamer.position() + count > state.size_indicated
                {
                    rx.set_state(ReceiverState::Normal);
                    return SdoResult::abort(index, sub, AbortCode::DataTypeMismatchLengthHigh);
                }
                state.crc = crc16::XMODEM::update(state.crc, &buffer[..count]);
                if let Err(code) = state.streamer.write_all(&buffer[..count]) {
                    rx.set_state(ReceiverState::Normal);
                    return SdoResult::abort(index, sub, code);
                }

                if complete {
                    rx.set_state(ReceiverState::Normal);
                    SdoResult::response(
                        SdoResponse::confirm_block(ackseq, BLKSIZE),
                        SdoState::EndDownloadBlock(state),
                    )
                } else {
                    rx.begin_block_download(BLKSIZE);
                    SdoResult::response(
                        SdoResponse::confirm_block(ackseq, BLKSIZE),
                        SdoState::DownloadBlock(state),
                    )
                }
            }
        }
    }

    fn end_download_block(
        state: &BlockDownload,
        rx: &SdoReceiver,
        elapsed_us: u32,
        timeout_us: u32,
    ) -> SdoResult {
        let mut state = *state;
        let (index, sub) = (state.streamer.index, state.streamer.sub);
        let req = match Self::expect_request(
            rx,
            elapsed_us,
            timeout_us,
            SdoState::EndDownloadBlock(state),
            index,
            sub,
        ) {
            Ok(req) => req,
            Err(result) => return result,
        };

        match req {
            SdoRequest::EndBlockDownload { n, crc } => {
                let valid = 7 - n as usize;
                let crc_calc =
                    crc16::XMODEM::get(crc16::XMODEM::update(state.crc, &state.last_data[..valid]));
                if state.client_crc && crc_calc != crc {
                    return SdoResult::abort(index, sub, AbortCode::CrcError);
                }

                if let Err(code) = state.streamer.write_all(&state.last_data[..valid]) {
                    return SdoResult::abort(index, sub, code);
                }
                let transferred = state.streamer.position();
                if state.size_indicated > 0 {
                    if transferred < state.size_indicated {
                        return SdoResult::abort(index, sub, AbortCode::DataTypeMismatchLengthLow);
                    }
                    if transferred > state.size_indicated {
                        return SdoResult::abort(index, sub, AbortCode::DataTypeMismatchLengthHigh);
                    }
                }
                let info = state.streamer.info;
                if !info.data_type.is_str() && info.size > 0 && transferred < info.size {
                    return SdoResult::abort(index, sub, AbortCode::DataTypeMismatchLengthLow);
                }
                if let Err(code) = state.streamer.finish_write() {
                    return SdoResult::abort(index, sub, code);
                }

                SdoResult::response_with_update(
                    SdoResponse::ConfirmBlockDownloadEnd,
                    index,
                    sub,
                    SdoState::Idle,
                )
            }
            SdoRequest::Abort { .. } => SdoResult::no_response(SdoState::Idle),
            _ => SdoResult::abort(index, sub, AbortCode::InvalidCommandSpecifier),
        }
    }

    fn upload_block_start(
        state: &BlockUpload,
        rx: &SdoReceiver,
        elapsed_us: u32,
        timeout_us: u32,
    ) -> SdoResult {
        let state = *state;
        let (index, sub) = (state.streamer.index, state.streamer.sub);
        let req = match Self::expect_request(
            rx,
            elapsed_us,
            timeout_us,
            SdoState::UploadBlockStart(state),
            index,
            sub,
        ) {
            Ok(req) => req,
            Err(result) => return result,
        };

        match req {
            SdoRequest::StartBlockUpload => {
                SdoResult::no_response(SdoState::UploadBlockSend(state))
            }
            SdoRequest::Abort { .. } => SdoResult::no_response(SdoState::Idle),
            _ => SdoResult::abort(index, sub, AbortCode::InvalidCommandSpecifier),
        }
    }

    fn upload_block_confirm(
        state: &BlockUpload,
        rx: &SdoReceiver,
        elapsed_us: u32,
        timeout_us: u32,
    ) -> SdoResult {
        let mut state = *state;
        let (index, sub) = (state.streamer.index, state.streamer.sub);
        let req = match Self::expect_request(
            rx,
            elapsed_us,
            timeout_us,
            SdoState::UploadBlockConfirm(state),
            index,
            sub,
        ) {
            Ok(req) => req,
            Err(result) => return result,
        };

        match req {
            SdoRequest::ConfirmBlock { ackseq, blksize } => {
                let segments = state.segments_in_block();
                if ackseq > segments {
                    return SdoResult::abort(index, sub, AbortCode::InvalidCommandSpecifier);
                }
                if blksize == 0 || blksize > 127 {
                    return SdoResult::abort(index, sub, AbortCode::InvalidBlockSize);
                }

                // Commit the acknowledged prefix into the running CRC, and
                // rewind the read position over anything unacknowledged
                let committed = if ackseq == segments {
                    state.block_len
                } else {
                    ackseq as usize * 7
                };
                // Unwrap safety: the client is confirming, so no segments
                // are arriving and the buffer is quiescent
                let buffer = unsafe { rx.buffer() };
                if state.crc_enabled {
                    state.crc = crc16::XMODEM::update(state.crc, &buffer[..committed]);
                }
                state.streamer.rewind(state.block_len - committed);
                state.blksize = blksize;
                state.next_seq = 1;
                state.block_len = 0;

                if state.streamer.position() == state.size {
                    // Everything is acknowledged; close out the transfer
                    let no_data = ((7 - state.size % 7) % 7) as u8;
                    let crc = if state.crc_enabled {
                        crc16::XMODEM::get(state.crc)
                    } else {
                        0
                    };
                    SdoResult::response(
                        SdoResponse::block_upload_end(no_data, crc),
                        SdoState::UploadBlockEnd(state),
                    )
                } else {
                    SdoResult::no_response(SdoState::UploadBlockSend(state))
                }
            }
            SdoRequest::Abort { .. } => SdoResult::no_response(SdoState::Idle),
            _ => SdoResult::abort(index, sub, AbortCode::InvalidCommandSpecifier),
        }
    }

    fn upload_block_end(
        state: &BlockUpload,
        rx: &SdoReceiver,
        elapsed_us: u32,
        timeout_us: u32,
    ) -> SdoResult {
        let state = *state;
        let (index, sub) = (state.streamer.index, state.streamer.sub);
        let req = match Self::expect_request(
            rx,
            elapsed_us,
            timeout_us,
            SdoState::UploadBlockEnd(state),
            index,
            sub,
        ) {
            Ok(req) => req,
            Err(result) => return result,
        };

        match req {
            SdoRequest::EndBlockUpload => SdoResult::no_response(SdoState::Idle),
            SdoRequest::Abort { .. } => SdoResult::no_response(SdoState::Idle),
            _ => SdoResult::abort(index, sub, AbortCode::InvalidCommandSpecifier),
        }
    }
}

/// Implements an SDO server
///
/// A single SDO server is owned by one client at a time. This struct holds
/// the transfer state machine; the matching [`SdoReceiver`] captures frames
/// in the receive context. A node exposing several SDO channels instantiates
/// one pair per channel.
pub struct SdoServer {
    state: SdoState,
    pending_tx: Option<PendingTx>,
    timeout_us: u32,
}

#[derive(Clone, Copy)]
struct PendingTx {
    frame: ServerFrame,
    new_state: SdoState,
    updated_object: Option<ObjectId>,
}

impl Default for SdoServer {
    fn default() -> Self {
        Self::new()
    }
}

impl SdoServer {
    /// Create a new SDO server with the default transfer timeout
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_SDO_TIMEOUT_US)
    }

    /// Create a new SDO server with the given transfer timeout
    pub fn with_timeout(timeout_us: u32) -> Self {
        Self {
            state: SdoState::Idle,
            pending_tx: None,
            timeout_us,
        }
    }

    /// Advance the server state machine
    ///
    /// Consumes any request captured by the receiver, updates the object
    /// dictionary, and emits response frames through `send`. When `send`
    /// fails the frame is retried on the next call without advancing the
    /// state. Returns the id of the updated object when a download
    /// completed.
    pub fn process(
        &mut self,
        rx: &SdoReceiver,
        elapsed_us: u32,
        od: &'static [ODEntry<'static>],
        send: &mut dyn FnMut(ServerFrame) -> Result<(), ()>,
    ) -> Option<ObjectId> {
        // A frame that previously failed to send blocks the state machine
        if let Some(pending) = self.pending_tx.take() {
            if send(pending.frame).is_err() {
                self.pending_tx = Some(pending);
                rx.increment_timer(elapsed_us);
                return None;
            }
            self.state = pending.new_state;
            return pending.updated_object;
        }

        if let SdoState::UploadBlockSend(state) = self.state {
            self.state = Self::pump_upload_block(state, rx, send);
            return None;
        }

        let result = self.state.update(rx, elapsed_us, od, self.timeout_us);
        if let Some(resp) = result.response {
            if send(ServerFrame::Response(resp)).is_err() {
                self.pending_tx = Some(PendingTx {
                    frame: ServerFrame::Response(resp),
                    new_state: result.new_state,
                    updated_object: result.updated_object,
                });
                return None;
            }
        }
        self.state = result.new_state;
        result.updated_object
    }

    /// Send an abort from the transmission pump and drop to idle
    fn pump_abort(
        state: &BlockUpload,
        send: &mut dyn FnMut(ServerFrame) -> Result<(), ()>,
        code: AbortCode,
    ) -> SdoState {
        let _ = send(ServerFrame::Response(SdoResponse::abort(
            state.streamer.index,
            state.streamer.sub,
            code,
        )));
        SdoState::Idle
    }

    /// Transmit as much of the staged sub-block as the transport accepts
    fn pump_upload_block(
        state: BlockUpload,
        rx: &SdoReceiver,
        send: &mut dyn FnMut(ServerFrame) -> Result<(), ()>,
    ) -> SdoState {
        let mut state = state;

        // Stage the next sub-block when none is loaded
        if state.block_len == 0 {
            let remaining = state.size - state.streamer.position();
            let block_len = remaining.min(state.blksize as usize * 7);
            // Unwrap safety: no block segments arrive during an upload, so
            // the receive buffer is free for staging
            let buffer = unsafe { rx.buffer() };
            let mut filled = 0;
            let mut stalled = false;
            while filled < block_len {
                match state.streamer.read(&mut buffer[filled..block_len]) {
                    Ok(chunk) => {
                        filled += chunk.len;
                        if chunk.partial || chunk.len == 0 {
                            stalled = chunk.partial;
                            break;
                        }
                    }
                    Err(code) => return Self::pump_abort(&state, send, code),
                }
            }
            if filled < block_len {
                // The staged data falls short of the negotiated sub-block:
                // a source that is not exhausted cannot keep the block
                // pace, and one that is exhausted shrank under the
                // transfer
                let code = if stalled {
                    AbortCode::InvalidBlockSize
                } else {
                    AbortCode::NoData
                };
                return Self::pump_abort(&state, send, code);
            }
            state.block_len = filled;
            state.next_seq = 1;
        }

        let segments = state.segments_in_block();
        let final_block = state.is_final_block();
        // Unwrap safety: see above
        let buffer = unsafe { rx.buffer() };
        while state.next_seq <= segments {
            let start = (state.next_seq as usize - 1) * 7;
            let seg_len = (state.block_len - start).min(7);
            let mut data = [0u8; 7];
            data[..seg_len].copy_from_slice(&buffer[start..start + seg_len]);
            let c = final_block && start + seg_len == state.block_len;
            let segment = BlockSegment {
                c,
                seqnum: state.next_seq,
                data,
            };
            if send(ServerFrame::Segment(segment)).is_err() {
                // Transport is full; resume from this segment next tick
                return SdoState::UploadBlockSend(state);
            }
            state.next_seq += 1;
        }

        SdoState::UploadBlockConfirm(state)
    }
}

#[cfg(test)]
mod tests {
    use cantata_common::objects::{
        AccessType, ByteField, Chunk, DataType, ObjectAccess, ScalarField, StringField,
    };

    use super::*;

    const BIG_SIZE: usize = 1200;
    const STR_SIZE: usize = 60;

    struct TestOd {
        device_type: ScalarField<u32>,
        value_u32: ScalarField<u32>,
        value_u16: ScalarField<u16>,
        name: StringField<STR_SIZE>,
        blob: ByteField<BIG_SIZE>,
    }

    fn test_od() -> &'static [ODEntry<'static>] {
        let objects = Box::leak(Box::new(TestOd {
            device_type: ScalarField::<u32>::new_ro(0x0001_0192),
            value_u32: ScalarField::<u32>::new(0),
            value_u16: ScalarField::<u16>::new(0),
            name: StringField::new(),
            blob: ByteField::new(DataType::OctetString, [0; BIG_SIZE]),
        }));
        Box::leak(Box::new([
            ODEntry {
                index: 0x1000,
                data: &objects.device_type,
            },
            ODEntry {
                index: 0x2000,
                data: &objects.value_u32,
            },
            ODEntry {
                index: 0x2001,
                data: &objects.value_u16,
            },
            ODEntry {
                index: 0x2002,
                data: &objects.name,
            },
            ODEntry {
                index: 0x2003,
                data: &objects.blob,
            },
        ]))
    }

    struct Harness {
        server: SdoServer,
        rx: &'static SdoReceiver,
        od: &'static [ODEntry<'static>],
    }

    impl Harness {
        fn new() -> Self {
            Self {
                server: SdoServer::new(),
                rx: Box::leak(Box::new(SdoReceiver::new())),
                od: test_od(),
            }
        }

        /// Feed a frame and run process, collecting emitted frames
        fn round_trip(&mut self, frame: Option<[u8; 8]>, elapsed: u32) -> (Vec<ServerFrame>, Option<ObjectId>) {
            if let Some(frame) = frame {
                self.rx.handle_frame(&frame);
            }
            let mut sent = Vec::new();
            let updated = self.server.process(self.rx, elapsed, self.od, &mut |f| {
                sent.push(f);
                Ok(())
            });
            (sent, updated)
        }

        fn expect_response(&mut self, frame: [u8; 8]) -> SdoResponse {
            let (sent, _) = self.round_trip(Some(frame), 0);
            assert_eq!(sent.len(), 1, "expected exactly one response");
            match sent[0] {
                ServerFrame::Response(resp) => resp,
                ServerFrame::Segment(_) => panic!("expected response, got segment"),
            }
        }
    }

    fn find<'a>(od: &'a [ODEntry<'a>], index: u16) -> &'a dyn ObjectAccess {
        cantata_common::objects::find_object(od, index).unwrap()
    }

    #[test]
    fn test_expedited_download() {
        let mut h = Harness::new();
        let resp =
            h.expect_response(SdoRequest::expedited_download(0x2000, 0, &[0xDE, 0xAD, 0xBE, 0xEF]).to_bytes());
        assert_eq!(resp, SdoResponse::download_acknowledge(0x2000, 0));
        assert_eq!(find(h.od, 0x2000).read_u32(0).unwrap(), 0xEFBEADDE);
    }

    #[test]
    fn test_expedited_upload() {
        let mut h = Harness::new();
        let resp = h.expect_response(SdoRequest::initiate_upload(0x1000, 0).to_bytes());
        assert_eq!(
            resp,
            SdoResponse::expedited_upload(0x1000, 0, &0x0001_0192u32.to_le_bytes())
        );
    }

    #[test]
    fn test_download_to_readonly_aborts() {
        let mut h = Harness::new();
        let resp = h.expect_response(SdoRequest::expedited_download(0x1000, 0, &[0; 4]).to_bytes());
        assert_eq!(resp, SdoResponse::abort(0x1000, 0, AbortCode::ReadOnly));
    }

    #[test]
    fn test_download_missing_object_aborts() {
        let mut h = Harness::new();
        let resp = h.expect_response(SdoRequest::expedited_download(0x7777, 0, &[0; 4]).to_bytes());
        assert_eq!(resp, SdoResponse::abort(0x7777, 0, AbortCode::NoSuchObject));
    }

    #[test]
    fn test_expedited_size_mismatch_aborts() {
        let mut h = Harness::new();
        // Two bytes into a u32 entry
        let resp = h.expect_response(SdoRequest::expedited_download(0x2000, 0, &[1, 2]).to_bytes());
        assert_eq!(
            resp,
            SdoResponse::abort(0x2000, 0, AbortCode::DataTypeMismatchLengthLow)
        );
        // Four bytes into a u16 entry
        let resp = h.expect_response(SdoRequest::expedited_download(0x2001, 0, &[1, 2, 3, 4]).to_bytes());
        assert_eq!(
            resp,
            SdoResponse::abort(0x2001, 0, AbortCode::DataTypeMismatchLengthHigh)
        );
    }

    fn do_segmented_download(h: &mut Harness, index: u16, data: &[u8]) {
        let resp = h.expect_response(
            SdoRequest::initiate_download(index, 0, Some(data.len() as u32)).to_bytes(),
        );
        assert_eq!(resp, SdoResponse::download_acknowledge(index, 0));

        let mut toggle = false;
        let mut sent = 0;
        while sent < data.len() {
            let len = (data.len() - sent).min(7);
            let last = sent + len == data.len();
            let resp = h.expect_response(
                SdoRequest::download_segment(toggle, last, &data[sent..sent + len]).to_bytes(),
            );
            assert_eq!(resp, SdoResponse::download_segment_acknowledge(toggle));
            toggle = !toggle;
            sent += len;
        }
    }

    #[test]
    fn test_segmented_download_string_padding() {
        let mut h = Harness::new();
        do_segmented_download(&mut h, 0x2002, b"hello world");
        let obj = find(h.od, 0x2002);
        assert_eq!(obj.current_size(0).unwrap(), 11);
        let mut buf = [0; STR_SIZE];
        let n = obj.read(0, 0, &mut buf).unwrap().len;
        assert_eq!(&buf[..n], b"hello world");
    }

    #[test]
    fn test_segmented_upload() {
        let mut h = Harness::new();
        let payload = b"0123456789";
        find(h.od, 0x2002).write(0, 0, payload).unwrap();

        let resp = h.expect_response(SdoRequest::initiate_upload(0x2002, 0).to_bytes());
        assert_eq!(
            resp,
            SdoResponse::upload_acknowledge(0x2002, 0, Some(payload.len() as u32))
        );

        // First segment: toggle 0, 7 bytes, not last
        let resp = h.expect_response(SdoRequest::upload_segment_request(false).to_bytes());
        assert_eq!(resp.to_bytes()[0], 0x00);
        assert_eq!(&resp.to_bytes()[1..8], &payload[..7]);

        // Second segment: toggle 1, 3 bytes, last -> 0x10 | ((7-3)<<1) | 1
        let resp = h.expect_response(SdoRequest::upload_segment_request(true).to_bytes());
        assert_eq!(resp.to_bytes()[0], 0x19);
        assert_eq!(&resp.to_bytes()[1..4], &payload[7..10]);
    }

    #[test]
    fn test_segment_toggle_error_aborts() {
        let mut h = Harness::new();
        let resp =
            h.expect_response(SdoRequest::initiate_download(0x2003, 0, Some(20)).to_bytes());
        assert_eq!(resp, SdoResponse::download_acknowledge(0x2003, 0));
        let resp =
            h.expect_response(SdoRequest::download_segment(false, false, &[0; 7]).to_bytes());
        assert_eq!(resp, SdoResponse::download_segment_acknowledge(false));
        // Repeat toggle 0 instead of alternating
        let resp =
            h.expect_response(SdoRequest::download_segment(false, false, &[0; 7]).to_bytes());
        assert_eq!(
            resp,
            SdoResponse::abort(0x2003, 0, AbortCode::ToggleNotAlternated)
        );
        // And the engine is reusable afterwards
        do_segmented_download(&mut h, 0x2003, &[7; 20]);
    }

    #[test]
    fn test_segmented_download_short_aborts() {
        let mut h = Harness::new();
        let resp =
            h.expect_response(SdoRequest::initiate_download(0x2003, 0, Some(10)).to_bytes());
        assert_eq!(resp, SdoResponse::download_acknowledge(0x2003, 0));
        // Announce 10 bytes but finish after 7
        let resp =
            h.expect_response(SdoRequest::download_segment(false, true, &[0; 7]).to_bytes());
        assert_eq!(
            resp,
            SdoResponse::abort(0x2003, 0, AbortCode::DataTypeMismatchLengthLow)
        );
    }

    #[test]
    fn test_segmented_download_overrun_aborts() {
        let mut h = Harness::new();
        let resp = h.expect_response(SdoRequest::initiate_download(0x2003, 0, Some(7)).to_bytes());
        assert_eq!(resp, SdoResponse::download_acknowledge(0x2003, 0));
        let resp =
            h.expect_response(SdoRequest::download_segment(false, false, &[0; 7]).to_bytes());
        assert_eq!(resp, SdoResponse::download_segment_acknowledge(false));
        let resp = h.expect_response(SdoRequest::download_segment(true, true, &[0; 7]).to_bytes());
        assert_eq!(
            resp,
            SdoResponse::abort(0x2003, 0, AbortCode::DataTypeMismatchLengthHigh)
        );
    }

    fn do_block_download(h: &mut Harness, index: u16, data: &[u8]) {
        let resp = h.expect_response(
            SdoRequest::initiate_block_download(index, 0, true, data.len() as u32).to_bytes(),
        );
        assert_eq!(
            resp,
            SdoResponse::block_download_acknowledge(true, index, 0, 127)
        );

        let mut pos = 0;
        let mut seqnum = 0;
        while pos < data.len() {
            let len = (data.len() - pos).min(7);
            let mut chunk = [0; 7];
            chunk[..len].copy_from_slice(&data[pos..pos + len]);
            pos += len;
            seqnum += 1;
            let c = pos == data.len();
            let (sent, updated) =
                h.round_trip(Some(BlockSegment { c, seqnum, data: chunk }.to_bytes()), 0);
            assert_eq!(updated, None);
            if c || seqnum == 127 {
                assert_eq!(
                    sent,
                    vec![ServerFrame::Response(SdoResponse::confirm_block(seqnum, 127))]
                );
                if seqnum == 127 {
                    seqnum = 0;
                }
            } else {
                assert!(sent.is_empty());
            }
        }

        let n = ((7 - data.len() % 7) % 7) as u8;
        let crc = crc16::State::<crc16::XMODEM>::calculate(data);
        let (sent, updated) = h.round_trip(Some(SdoRequest::end_block_download(n, crc).to_bytes()), 0);
        assert_eq!(
            sent,
            vec![ServerFrame::Response(SdoResponse::ConfirmBlockDownloadEnd)]
        );
        assert_eq!(updated, Some(ObjectId { index, sub: 0 }));
    }

    #[test]
    fn test_block_download() {
        let mut h = Harness::new();
        for size in [128usize, 1024] {
            let data: Vec<u8> = (0..size).map(|x| (x % 256) as u8).collect();
            do_block_download(&mut h, 0x2003, &data);
            let mut read_back = vec![0; size];
            find(h.od, 0x2003).read(0, 0, &mut read_back).unwrap();
            assert_eq!(data, read_back);
        }
    }

    #[test]
    fn test_block_download_missing_segment_retransmits() {
        let mut h = Harness::new();
        let data: Vec<u8> = (0..21u8).collect();
        let resp = h.expect_response(
            SdoRequest::initiate_block_download(0x2003, 0, true, 21).to_bytes(),
        );
        assert_eq!(
            resp,
            SdoResponse::block_download_acknowledge(true, 0x2003, 0, 127)
        );

        let seg = |c, seqnum, chunk: &[u8]| {
            let mut data = [0; 7];
            data[..chunk.len()].copy_from_slice(chunk);
            BlockSegment { c, seqnum, data }.to_bytes()
        };

        // Send segments 1 and 3, dropping 2
        let (sent, _) = h.round_trip(Some(seg(false, 1, &data[0..7])), 0);
        assert!(sent.is_empty());
        let (sent, _) = h.round_trip(Some(seg(true, 3, &data[14..21])), 0);
        assert_eq!(
            sent,
            vec![ServerFrame::Response(SdoResponse::confirm_block(1, 127))]
        );

        // Retransmit 2 and 3
        let (sent, _) = h.round_trip(Some(seg(false, 2, &data[7..14])), 0);
        assert!(sent.is_empty());
        let (sent, _) = h.round_trip(Some(seg(true, 3, &data[14..21])), 0);
        assert_eq!(
            sent,
            vec![ServerFrame::Response(SdoResponse::confirm_block(3, 127))]
        );

        let crc = crc16::State::<crc16::XMODEM>::calculate(&data);
        let (sent, updated) = h.round_trip(Some(SdoRequest::end_block_download(0, crc).to_bytes()), 0);
        assert_eq!(
            sent,
            vec![ServerFrame::Response(SdoResponse::ConfirmBlockDownloadEnd)]
        );
        assert_eq!(updated, Some(ObjectId { index: 0x2003, sub: 0 }));

        let mut read_back = vec![0; 21];
        find(h.od, 0x2003).read(0, 0, &mut read_back).unwrap();
        assert_eq!(data, read_back);
    }

    #[test]
    fn test_block_download_crc_mismatch_aborts() {
        let mut h = Harness::new();
        let data: Vec<u8> = (0..14u8).collect();
        h.expect_response(SdoRequest::initiate_block_download(0x2003, 0, true, 14).to_bytes());
        let mut chunk = [0; 7];
        chunk.copy_from_slice(&data[0..7]);
        h.round_trip(Some(BlockSegment { c: false, seqnum: 1, data: chunk }.to_bytes()), 0);
        chunk.copy_from_slice(&data[7..14]);
        h.round_trip(Some(BlockSegment { c: true, seqnum: 2, data: chunk }.to_bytes()), 0);

        let bad_crc = crc16::State::<crc16::XMODEM>::calculate(&data) ^ 0x1;
        let (sent, _) = h.round_trip(Some(SdoRequest::end_block_download(0, bad_crc).to_bytes()), 0);
        assert_eq!(
            sent,
            vec![ServerFrame::Response(SdoResponse::abort(
                0x2003,
                0,
                AbortCode::CrcError
            ))]
        );
    }

    #[test]
    fn test_block_download_timeout_aborts() {
        let mut h = Harness::new();
        h.expect_response(SdoRequest::initiate_block_download(0x2003, 0, true, 21).to_bytes());

        let (sent, _) = h.round_trip(None, 1000);
        assert!(sent.is_empty());
        let (sent, _) = h.round_trip(None, 2_000_000);
        assert_eq!(
            sent,
            vec![ServerFrame::Response(SdoResponse::abort(
                0x2003,
                0,
                AbortCode::SdoTimeout
            ))]
        );
    }

    fn collect_subblock(h: &mut Harness) -> (Vec<BlockSegment>, bool) {
        let (sent, _) = h.round_trip(None, 0);
        let mut segments = Vec::new();
        let mut complete = false;
        for f in sent {
            match f {
                ServerFrame::Segment(seg) => {
                    complete |= seg.c;
                    segments.push(seg);
                }
                ServerFrame::Response(resp) => panic!("unexpected response {resp:?}"),
            }
        }
        (segments, complete)
    }

    fn do_block_upload(h: &mut Harness, index: u16, blksize: u8, expected: &[u8]) {
        let resp = h.expect_response(
            SdoRequest::initiate_block_upload(index, 0, true, blksize, 0).to_bytes(),
        );
        assert_eq!(
            resp,
            SdoResponse::block_upload_acknowledge(true, index, 0, Some(expected.len() as u32))
        );

        let (sent, _) = h.round_trip(Some(SdoRequest::StartBlockUpload.to_bytes()), 0);
        assert!(sent.is_empty());

        let mut received = Vec::new();
        loop {
            let (segments, complete) = collect_subblock(h);
            assert!(!segments.is_empty());
            for (i, seg) in segments.iter().enumerate() {
                assert_eq!(seg.seqnum as usize, i + 1);
            }
            let ackseq = segments.last().unwrap().seqnum;
            for seg in &segments {
                let want = (expected.len() - received.len()).min(7);
                received.extend_from_slice(&seg.data[..want]);
            }

            let (sent, _) = h.round_trip(
                Some(SdoRequest::confirm_block(ackseq, blksize).to_bytes()),
                0,
            );
            if complete {
                assert_eq!(sent.len(), 1);
                let no_data = ((7 - expected.len() % 7) % 7) as u8;
                let crc = crc16::State::<crc16::XMODEM>::calculate(expected);
                assert_eq!(
                    sent[0],
                    ServerFrame::Response(SdoResponse::block_upload_end(no_data, crc))
                );
                break;
            } else {
                assert!(sent.is_empty());
            }
        }
        assert_eq!(received, expected);

        let (sent, _) = h.round_trip(Some(SdoRequest::EndBlockUpload.to_bytes()), 0);
        assert!(sent.is_empty());
    }

    #[test]
    fn test_block_upload() {
        let mut h = Harness::new();
        let data: Vec<u8> = (0..200usize).map(|x| (x % 251) as u8).collect();
        find(h.od, 0x2003).write(0, 0, &data).unwrap();
        let mut expected = vec![0u8; BIG_SIZE];
        expected[..data.len()].copy_from_slice(&data);
        // Small blksize forces several sub-blocks
        do_block_upload(&mut h, 0x2003, 10, &expected);
        // And a max-size request moves it in fewer
        do_block_upload(&mut h, 0x2003, 127, &expected);
    }

    #[test]
    fn test_block_upload_retransmit_rewind() {
        let mut h = Harness::new();
        let data: Vec<u8> = (0..21u8).collect();
        find(h.od, 0x2002).write(0, 0, &data).unwrap();

        h.expect_response(SdoRequest::initiate_block_upload(0x2002, 0, true, 127, 0).to_bytes());
        h.round_trip(Some(SdoRequest::StartBlockUpload.to_bytes()), 0);
        let (segments, complete) = collect_subblock(&mut h);
        assert_eq!(segments.len(), 3);
        assert!(complete);

        // Pretend segment 3 was lost; only 2 acknowledged
        let (sent, _) = h.round_trip(Some(SdoRequest::confirm_block(2, 127).to_bytes()), 0);
        assert!(sent.is_empty());

        // The tail is retransmitted, renumbered from 1
        let (segments, complete) = collect_subblock(&mut h);
        assert_eq!(segments.len(), 1);
        assert!(complete);
        assert_eq!(segments[0].seqnum, 1);
        assert_eq!(&segments[0].data[..], &data[14..21]);

        let (sent, _) = h.round_trip(Some(SdoRequest::confirm_block(1, 127).to_bytes()), 0);
        let crc = crc16::State::<crc16::XMODEM>::calculate(&data);
        assert_eq!(
            sent,
            vec![ServerFrame::Response(SdoResponse::block_upload_end(0, crc))]
        );
    }

    #[test]
    fn test_block_upload_pst_downgrade() {
        let mut h = Harness::new();
        find(h.od, 0x2000).write(0, 0, &0xAABBCCDDu32.to_le_bytes()).unwrap();
        // Threshold covers the 4-byte value, so the server answers with an
        // expedited upload instead
        let resp = h.expect_response(
            SdoRequest::initiate_block_upload(0x2000, 0, true, 127, 21).to_bytes(),
        );
        assert_eq!(
            resp,
            SdoResponse::expedited_upload(0x2000, 0, &0xAABBCCDDu32.to_le_bytes())
        );
    }

    /// A read-only domain whose backing source can only deliver a prefix of
    /// its data synchronously
    struct TrickleDomain {
        ready: usize,
        size: usize,
    }

    impl ObjectAccess for TrickleDomain {
        fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<Chunk, AbortCode> {
            if sub != 0 {
                return Err(AbortCode::NoSuchSubIndex);
            }
            if offset >= self.ready {
                return Ok(Chunk::partial(0));
            }
            let n = buf.len().min(self.ready - offset);
            buf[..n].fill(0x5A);
            if offset + n < self.size {
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
                size: self.size,
                data_type: DataType::Domain,
                access_type: AccessType::Ro,
            })
        }
    }

    #[test]
    fn test_block_upload_stalled_source_aborts_block_size() {
        let domain = Box::leak(Box::new(TrickleDomain {
            ready: 20,
            size: 100,
        }));
        let od: &'static [ODEntry] = Box::leak(Box::new([ODEntry {
            index: 0x3000,
            data: domain,
        }]));
        let mut server = SdoServer::new();
        let rx = SdoReceiver::new();

        rx.handle_frame(&SdoRequest::initiate_block_upload(0x3000, 0, true, 127, 0).to_bytes());
        let mut sent = Vec::new();
        server.process(&rx, 0, od, &mut |f| {
            sent.push(f);
            Ok(())
        });
        assert_eq!(
            sent,
            vec![ServerFrame::Response(SdoResponse::block_upload_acknowledge(
                true,
                0x3000,
                0,
                Some(100)
            ))]
        );

        // Only 20 of the 100 bytes can be staged, so the negotiated
        // sub-block cannot be honored even though the entry is not
        // exhausted
        rx.handle_frame(&SdoRequest::StartBlockUpload.to_bytes());
        let mut sent = Vec::new();
        server.process(&rx, 0, od, &mut |f| {
            sent.push(f);
            Ok(())
        });
        server.process(&rx, 0, od, &mut |f| {
            sent.push(f);
            Ok(())
        });
        assert_eq!(
            sent,
            vec![ServerFrame::Response(SdoResponse::abort(
                0x3000,
                0,
                AbortCode::InvalidBlockSize
            ))]
        );
    }

    #[test]
    fn test_block_upload_bad_blksize_aborts() {
        let mut h = Harness::new();
        let resp = h.expect_response(
            SdoRequest::initiate_block_upload(0x2003, 0, true, 0, 0).to_bytes(),
        );
        assert_eq!(
            resp,
            SdoResponse::abort(0x2003, 0, AbortCode::InvalidBlockSize)
        );
    }

    #[test]
    fn test_upload_writeonly_aborts() {
        // A write-only entry: build a dedicated OD for it
        static WO: ScalarField<u32> = ScalarField::<u32>::new(0);
        let od: &'static [ODEntry] = Box::leak(Box::new([ODEntry {
            index: 0x3000,
            data: Box::leak(Box::new(WriteOnly(&WO))) as &dyn ObjectAccess,
        }]));
        struct WriteOnly<'a>(&'a ScalarField<u32>);
        impl ObjectAccess for WriteOnly<'_> {
            fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<Chunk, AbortCode> {
                self.0.read(sub, offset, buf)
            }
            fn write(&self, sub: u8, offset: usize, data: &[u8]) -> Result<Chunk, AbortCode> {
                self.0.write(sub, offset, data)
            }
            fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
                Ok(SubInfo {
                    access_type: AccessType::Wo,
                    ..self.0.sub_info(sub)?
                })
            }
        }

        let mut server = SdoServer::new();
        let rx = SdoReceiver::new();
        rx.handle_frame(&SdoRequest::initiate_upload(0x3000, 0).to_bytes());
        let mut sent = Vec::new();
        server.process(&rx, 0, od, &mut |f| {
            sent.push(f);
            Ok(())
        });
        assert_eq!(
            sent,
            vec![ServerFrame::Response(SdoResponse::abort(
                0x3000,
                0,
                AbortCode::WriteOnly
            ))]
        );
    }

    #[test]
    fn test_abort_request_resets_state() {
        let mut h = Harness::new();
        h.expect_response(SdoRequest::initiate_download(0x2003, 0, Some(20)).to_bytes());
        let (sent, _) = h.round_trip(
            Some(SdoRequest::abort(0x2003, 0, AbortCode::GeneralError).to_bytes()),
            0,
        );
        assert!(sent.is_empty());
        // A fresh transfer on the same engine completes normally
        do_segmented_download(&mut h, 0x2003, &[3; 20]);
    }

    #[test]
    fn test_send_failure_retries_frame() {
        let mut h = Harness::new();
        h.rx
            .handle_frame(&SdoRequest::initiate_upload(0x1000, 0).to_bytes());
        // Transport refuses the frame; state must not advance
        let mut attempts = 0;
        h.server.process(h.rx, 0, h.od, &mut |_| {
            attempts += 1;
            Err(())
        });
        assert_eq!(attempts, 1);
        // Next tick the frame goes out
        let mut sent = Vec::new();
        h.server.process(h.rx, 0, h.od, &mut |f| {
            sent.push(f);
            Ok(())
        });
        assert_eq!(
            sent,
            vec![ServerFrame::Response(SdoResponse::expedited_upload(
                0x1000,
                0,
                &0x0001_0192u32.to_le_bytes()
            ))]
        );
    }
}
