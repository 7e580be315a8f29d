//! Tick-driven SDO client engine
//!
//! [`SdoClientEngine`] is the single-transfer state machine behind
//! [`SdoClient`](crate::SdoClient). It is deliberately split along the two
//! thread roles that touch it: the bus dispatcher calls [`on_frame`] to
//! capture a response (or, during block uploads, to ingest sub-block
//! segments straight into the FIFO), and a driver calls [`process`] with
//! elapsed microseconds to advance the protocol and emit request frames.
//! One mutex guards the whole transfer record; `on_frame` holds it just
//! long enough to copy 8 bytes.
//!
//! [`on_frame`]: SdoClientEngine::on_frame
//! [`process`]: SdoClientEngine::process

use std::sync::Mutex;

use cantata_common::{
    constants::{COB_ID_INVALID_FLAG, COB_ID_MASK},
    fifo::{ByteFifo, Crc16},
    messages::{CanId, CanMessage},
    sdo::{raw, AbortCode, BlockSegment, SdoRequest, SdoResponse},
};
use snafu::Snafu;

/// FIFO capacity: one full 127-segment sub-block plus a spare segment
pub const BLOCK_FIFO_SIZE: usize = 7 * 127 + 7;

/// Default transfer timeout
const DEFAULT_TIMEOUT_US: u32 = 1_000_000;
/// Default inter-sub-block timeout
const DEFAULT_BLOCK_TIMEOUT_US: u32 = 500_000;

/// Timing configuration for an SDO engine
#[derive(Clone, Copy, Debug)]
pub struct SdoEngineConfig {
    /// Whole-transfer timeout in microseconds
    pub timeout_us: u32,
    /// Additional timeout between sub-block events in microseconds
    pub timeout_block_us: u32,
}

impl Default for SdoEngineConfig {
    fn default() -> Self {
        Self {
            timeout_us: DEFAULT_TIMEOUT_US,
            timeout_block_us: DEFAULT_BLOCK_TIMEOUT_US,
        }
    }
}

/// Error returned when a transfer cannot be started
#[derive(Clone, Copy, Debug, PartialEq, Snafu)]
pub enum TransferError {
    /// A transfer is already in progress on this engine
    EngineBusy,
    /// The SDO channel is marked invalid (COB-ID bit 31 set, or never
    /// configured)
    ChannelInvalid,
}

/// Result of one `process` tick
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TransferStatus {
    /// No transfer is active
    Idle,
    /// The transfer completed successfully this tick
    Success,
    /// A request is in flight; waiting on the server
    WaitingResponse,
    /// A block download is running
    BlockDownloadInProgress,
    /// A block upload is running
    BlockUploadInProgress,
    /// The upload FIFO is full; the caller must drain it before the
    /// transfer can continue
    UploadDataFull,
    /// The configured server is this node itself; the transfer must be
    /// short-circuited through the local object dictionary
    WaitingLocalTransfer,
    /// This side aborted the transfer
    AbortedByClient {
        /// The abort reason sent to the server
        code: AbortCode,
    },
    /// The server aborted the transfer
    AbortedByServer {
        /// The abort reason received, as found on the wire
        code: u32,
    },
}

/// Client transfer states
///
/// `..Req`-suffixed states have a request frame to transmit; `..Rsp` (and
/// the `Sreq`/`Crsp` block-upload states, named for which side produces the
/// frame) are waiting on the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    DownloadInitiateReq,
    DownloadInitiateRsp,
    DownloadSegmentReq,
    DownloadSegmentRsp,
    DownloadBlkInitiateReq,
    DownloadBlkInitiateRsp,
    DownloadBlkSubblockReq,
    DownloadBlkSubblockRsp,
    DownloadBlkEndReq,
    DownloadBlkEndRsp,
    UploadInitiateReq,
    UploadInitiateRsp,
    UploadSegmentReq,
    UploadSegmentRsp,
    UploadBlkInitiateReq,
    UploadBlkInitiateRsp,
    UploadBlkStartReq,
    UploadBlkSubblockSreq,
    UploadBlkSubblockCrsp,
    UploadBlkEndSreq,
    UploadBlkEndCrsp,
}

impl State {
    fn is_block(self) -> bool {
        use State::*;
        matches!(
            self,
            DownloadBlkInitiateReq
                | DownloadBlkInitiateRsp
                | DownloadBlkSubblockReq
                | DownloadBlkSubblockRsp
                | DownloadBlkEndReq
                | DownloadBlkEndRsp
                | UploadBlkInitiateReq
                | UploadBlkInitiateRsp
                | UploadBlkStartReq
                | UploadBlkSubblockSreq
                | UploadBlkSubblockCrsp
                | UploadBlkEndSreq
                | UploadBlkEndCrsp
        )
    }

    fn is_upload(self) -> bool {
        use State::*;
        matches!(
            self,
            UploadInitiateReq
                | UploadInitiateRsp
                | UploadSegmentReq
                | UploadSegmentRsp
                | UploadBlkInitiateReq
                | UploadBlkInitiateRsp
                | UploadBlkStartReq
                | UploadBlkSubblockSreq
                | UploadBlkSubblockCrsp
                | UploadBlkEndSreq
                | UploadBlkEndCrsp
        )
    }
}

/// The shorthand for process' send callback
type SendFn<'a> = &'a mut dyn FnMut(CanMessage) -> Result<(), CanMessage>;

struct Transfer {
    state: State,
    // Channel configuration
    cob_c2s: u16,
    cob_s2c: u16,
    server_node_id: u8,
    valid: bool,
    own_node_id: Option<u8>,
    // Current target
    index: u16,
    subindex: u8,
    // Sizes
    size_indicated: usize,
    size_transferred: usize,
    finished: bool,
    /// The caller has pushed the complete payload (downloads)
    data_complete: bool,
    // Segmented state
    toggle: u8,
    // Block state
    block_size: u8,
    block_seqno: u8,
    block_no_data: u8,
    block_crc_enabled: bool,
    block_crc: Crc16,
    block_last: [u8; 7],
    // Timers
    config: SdoEngineConfig,
    timer_us: u32,
    block_timer_us: u32,
    // Captured response
    rx_new: bool,
    response: [u8; 8],
    fifo: ByteFifo<BLOCK_FIFO_SIZE>,
}

/// Outcome of a response-handling or emit step
enum Step {
    Continue,
    Done(TransferStatus),
}

impl Transfer {
    fn new(config: SdoEngineConfig) -> Self {
        Self {
            state: State::Idle,
            cob_c2s: 0,
            cob_s2c: 0,
            server_node_id: 0,
            valid: false,
            own_node_id: None,
            index: 0,
            subindex: 0,
            size_indicated: 0,
            size_transferred: 0,
            finished: false,
            data_complete: false,
            toggle: 0,
            block_size: 0,
            block_seqno: 0,
            block_no_data: 0,
            block_crc_enabled: false,
            block_crc: Crc16::new(),
            block_last: [0; 7],
            config,
            timer_us: 0,
            block_timer_us: 0,
            rx_new: false,
            response: [0; 8],
            fifo: ByteFifo::new(),
        }
    }

    fn begin(&mut self, index: u16, subindex: u8, upload: bool) -> Result<(), TransferError> {
        if self.state != State::Idle {
            return Err(TransferError::EngineBusy);
        }
        if !self.valid {
            return Err(TransferError::ChannelInvalid);
        }
        self.index = index;
        self.subindex = subindex;
        self.size_indicated = 0;
        self.size_transferred = 0;
        self.finished = false;
        self.data_complete = false;
        self.toggle = 0;
        self.block_size = 0;
        self.block_seqno = 0;
        self.block_no_data = 0;
        self.block_crc_enabled = false;
        self.block_crc = Crc16::new();
        self.timer_us = 0;
        self.block_timer_us = 0;
        self.rx_new = false;
        self.fifo.reset();
        self.state = if upload {
            State::UploadInitiateReq
        } else {
            State::DownloadInitiateReq
        };
        Ok(())
    }

    fn send_request(&mut self, req: SdoRequest, send: SendFn) -> Result<(), ()> {
        let msg = req.to_can_message(CanId::std(self.cob_c2s));
        send(msg).map_err(|_| ())
    }

    /// Send an abort frame and drop to idle
    ///
    /// Per the abort contract the transition happens whether or not the
    /// frame made it onto the bus.
    fn client_abort(&mut self, code: AbortCode, send: SendFn) -> TransferStatus {
        let _ = self.send_request(SdoRequest::abort(self.index, self.subindex, code), send);
        self.state = State::Idle;
        TransferStatus::AbortedByClient { code }
    }

    /// Block upload fast path, run from the frame intake
    fn ingest_block_segment(&mut self, data: &[u8]) {
        let seqno = data[0] & 0x7F;
        let last = (data[0] & 0x80) != 0;

        if seqno == self.block_seqno + 1 && seqno <= self.block_size {
            // The expected next segment
            self.timer_us = 0;
            self.block_timer_us = 0;
            self.block_seqno = seqno;
            if last {
                // Kept aside: the end request reveals how many of these
                // bytes are padding
                self.block_last.copy_from_slice(&data[1..8]);
                self.finished = true;
                self.state = State::UploadBlkSubblockCrsp;
            } else {
                self.fifo.alt_write(&data[1..8]);
                if seqno == self.block_size {
                    self.state = State::UploadBlkSubblockCrsp;
                }
            }
        } else if seqno <= self.block_seqno {
            // Duplicate (or a stale retransmission): ignore
        } else if self.block_seqno > 0 {
            // A gap inside a started sub-block: confirm early with the
            // last good sequence number so the server rewinds
            self.state = State::UploadBlkSubblockCrsp;
        }
        // A gap before anything arrived is ignored; the sub-block timeout
        // forces a confirmation round eventually
    }

    fn on_frame(&mut self, msg: &CanMessage) {
        // Only full SDO frames are considered
        if msg.dlc != 8 || msg.is_rtr() {
            return;
        }
        if msg.id() != CanId::std(self.cob_s2c) {
            return;
        }
        let data = msg.data();

        // In the sub-block collection states every non-abort frame is a
        // segment; frames trailing in after a forced early confirmation
        // are ingested too so stale segments cannot masquerade as
        // responses
        if matches!(
            self.state,
            State::UploadBlkSubblockSreq | State::UploadBlkSubblockCrsp
        ) && !raw::is_abort(data)
        {
            self.ingest_block_segment(data);
            return;
        }

        // Back-pressure: an unconsumed response is only ever displaced by
        // an abort
        if self.rx_new && !raw::is_abort(data) {
            return;
        }
        self.response.copy_from_slice(data);
        self.rx_new = true;
    }

    fn process(
        &mut self,
        elapsed_us: u32,
        abort: bool,
        next_wake_us: Option<&mut u32>,
        send: SendFn,
    ) -> TransferStatus {
        if self.state == State::Idle {
            return TransferStatus::Idle;
        }
        if self.own_node_id == Some(self.server_node_id) {
            return TransferStatus::WaitingLocalTransfer;
        }
        if abort {
            return self.client_abort(AbortCode::DeviceIncompatibility, send);
        }

        let mut activity = false;

        if self.rx_new {
            self.rx_new = false;
            activity = true;
            match self.handle_response(send) {
                Step::Done(status) => return status,
                Step::Continue => {}
            }
        }

        match self.emit(send, &mut activity) {
            Step::Done(status) => return status,
            Step::Continue => {}
        }

        if activity {
            self.timer_us = 0;
            self.block_timer_us = 0;
        } else {
            self.timer_us = self.timer_us.saturating_add(elapsed_us);
            if self.timer_us >= self.config.timeout_us {
                return self.client_abort(AbortCode::SdoTimeout, send);
            }
            if self.state.is_block() {
                self.block_timer_us = self.block_timer_us.saturating_add(elapsed_us);
                if self.block_timer_us >= self.config.timeout_block_us {
                    self.block_timer_us = 0;
                    if self.state == State::UploadBlkSubblockSreq {
                        // Stalled mid-sub-block: force a confirmation round
                        self.state = State::UploadBlkSubblockCrsp;
                        match self.emit(send, &mut activity) {
                            Step::Done(status) => return status,
                            Step::Continue => {}
                        }
                    }
                }
            }
        }

        if let Some(next_wake_us) = next_wake_us {
            let until_timeout = self.config.timeout_us - self.timer_us.min(self.config.timeout_us);
            *next_wake_us = (*next_wake_us).min(until_timeout);
        }

        match self.state {
            State::Idle => TransferStatus::Idle,
            State::UploadSegmentReq if self.fifo.free() < 7 => TransferStatus::UploadDataFull,
            State::UploadBlkSubblockCrsp if self.fifo.free() < 7 => TransferStatus::UploadDataFull,
            s if s.is_block() && s.is_upload() => TransferStatus::BlockUploadInProgress,
            s if s.is_block() => TransferStatus::BlockDownloadInProgress,
            _ => TransferStatus::WaitingResponse,
        }
    }

    /// Consume the captured response and advance the state machine
    fn handle_response(&mut self, send: SendFn) -> Step {
        let resp = match SdoResponse::try_from(&self.response[..]) {
            Ok(resp) => resp,
            Err(_) => {
                return Step::Done(self.client_abort(AbortCode::InvalidCommandSpecifier, send))
            }
        };

        if let SdoResponse::Abort { abort_code, .. } = resp {
            self.state = State::Idle;
            return Step::Done(TransferStatus::AbortedByServer { code: abort_code });
        }

        match self.state {
            State::DownloadInitiateRsp => match resp {
                SdoResponse::ConfirmDownload { index, sub } => {
                    if index != self.index || sub != self.subindex {
                        return Step::Done(
                            self.client_abort(AbortCode::IncompatibleParameter, send),
                        );
                    }
                    if self.finished {
                        self.state = State::Idle;
                        Step::Done(TransferStatus::Success)
                    } else {
                        self.toggle = 0;
                        self.state = State::DownloadSegmentReq;
                        Step::Continue
                    }
                }
                _ => Step::Done(self.client_abort(AbortCode::InvalidCommandSpecifier, send)),
            },
            State::DownloadSegmentRsp => match resp {
                SdoResponse::ConfirmDownloadSegment { t } => {
                    if t != (self.toggle != 0) {
                        return Step::Done(self.client_abort(AbortCode::ToggleNotAlternated, send));
                    }
                    self.toggle ^= 0x10;
                    if self.finished {
                        self.state = State::Idle;
                        Step::Done(TransferStatus::Success)
                    } else {
                        self.state = State::DownloadSegmentReq;
                        Step::Continue
                    }
                }
                _ => Step::Done(self.client_abort(AbortCode::InvalidCommandSpecifier, send)),
            },
            State::DownloadBlkInitiateRsp => match resp {
                SdoResponse::ConfirmBlockDownload {
                    sc,
                    index,
                    sub,
                    blksize,
                } => {
                    if index != self.index || sub != self.subindex {
                        return Step::Done(
                            self.client_abort(AbortCode::IncompatibleParameter, send),
                        );
                    }
                    self.block_crc_enabled &= sc;
                    self.block_size = blksize.clamp(1, 127);
                    self.block_crc = Crc16::new();
                    self.block_seqno = 0;
                    self.fifo.alt_begin(0);
                    self.state = State::DownloadBlkSubblockReq;
                    Step::Continue
                }
                _ => Step::Done(self.client_abort(AbortCode::InvalidCommandSpecifier, send)),
            },
            // A server whose buffer runs short may confirm before the
            // whole sub-block was transmitted, so the confirmation is also
            // accepted in the transmit state
            State::DownloadBlkSubblockReq | State::DownloadBlkSubblockRsp => match resp {
                SdoResponse::ConfirmBlock { ackseq, blksize } => {
                    if ackseq > self.block_seqno {
                        return Step::Done(
                            self.client_abort(AbortCode::InvalidCommandSpecifier, send),
                        );
                    }
                    if ackseq < self.block_seqno {
                        // Unacknowledged tail: replay it in the next
                        // sub-block
                        self.fifo.alt_begin(ackseq as usize * 7);
                        self.finished = false;
                    }
                    let crc = self.block_crc_enabled.then_some(&mut self.block_crc);
                    let committed = self.fifo.alt_finish(crc);
                    self.size_transferred += committed;

                    if self.finished {
                        self.state = State::DownloadBlkEndReq;
                    } else {
                        self.block_size = blksize.clamp(1, 127);
                        self.block_seqno = 0;
                        self.fifo.alt_begin(0);
                        self.state = State::DownloadBlkSubblockReq;
                    }
                    Step::Continue
                }
                _ => Step::Done(self.client_abort(AbortCode::InvalidCommandSpecifier, send)),
            },
            State::DownloadBlkEndRsp => match resp {
                SdoResponse::ConfirmBlockDownloadEnd => {
                    self.state = State::Idle;
                    Step::Done(TransferStatus::Success)
                }
                _ => Step::Done(self.client_abort(AbortCode::InvalidCommandSpecifier, send)),
            },
            State::UploadInitiateRsp => match resp {
                SdoResponse::ConfirmUpload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data,
                } => self.handle_upload_initiate(n, e, s, index, sub, data, send),
                _ => Step::Done(self.client_abort(AbortCode::InvalidCommandSpecifier, send)),
            },
            State::UploadSegmentRsp => match resp {
                SdoResponse::UploadSegment { t, n, c, data } => {
                    if t != (self.toggle != 0) {
                        return Step::Done(self.client_abort(AbortCode::ToggleNotAlternated, send));
                    }
                    let len = 7 - n as usize;
                    if self.size_indicated > 0 {
                        if self.size_transferred + len > self.size_indicated {
                            return Step::Done(
                                self.client_abort(AbortCode::DataTypeMismatchLengthHigh, send),
                            );
                        }
                        if c && self.size_transferred + len < self.size_indicated {
                            return Step::Done(
                                self.client_abort(AbortCode::DataTypeMismatchLengthLow, send),
                            );
                        }
                    }
                    if self.fifo.write(&data[..len], None) < len {
                        return Step::Done(self.client_abort(AbortCode::OutOfMemory, send));
                    }
                    self.size_transferred += len;
                    self.toggle ^= 0x10;
                    if c {
                        self.state = State::Idle;
                        Step::Done(TransferStatus::Success)
                    } else {
                        self.state = State::UploadSegmentReq;
                        Step::Continue
                    }
                }
                _ => Step::Done(self.client_abort(AbortCode::InvalidCommandSpecifier, send)),
            },
            State::UploadBlkInitiateRsp => match resp {
                SdoResponse::ConfirmBlockUpload {
                    sc,
                    s,
                    index,
                    sub,
                    size,
                } => {
                    if index != self.index || sub != self.subindex {
                        return Step::Done(
                            self.client_abort(AbortCode::IncompatibleParameter, send),
                        );
                    }
                    self.block_crc_enabled &= sc;
                    self.size_indicated = if s { size as usize } else { 0 };
                    self.block_crc = Crc16::new();
                    self.block_seqno = 0;
                    self.finished = false;
                    self.fifo.alt_begin(0);
                    self.state = State::UploadBlkStartReq;
                    Step::Continue
                }
                // The server may downgrade to a plain upload below the
                // protocol switch threshold
                SdoResponse::ConfirmUpload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data,
                } => self.handle_upload_initiate(n, e, s, index, sub, data, send),
                _ => Step::Done(self.client_abort(AbortCode::InvalidCommandSpecifier, send)),
            },
            State::UploadBlkEndSreq => match resp {
                SdoResponse::BlockUploadEnd { n, crc } => {
                    self.block_no_data = n;
                    let valid = 7 - n as usize;
                    let last = self.block_last;
                    if self.fifo.write(&last[..valid], Some(&mut self.block_crc)) < valid {
                        return Step::Done(self.client_abort(AbortCode::OutOfMemory, send));
                    }
                    self.size_transferred += valid;
                    if self.size_indicated > 0 {
                        if self.size_transferred > self.size_indicated {
                            return Step::Done(
                                self.client_abort(AbortCode::DataTypeMismatchLengthHigh, send),
                            );
                        }
                        if self.size_transferred < self.size_indicated {
                            return Step::Done(
                                self.client_abort(AbortCode::DataTypeMismatchLengthLow, send),
                            );
                        }
                    }
                    if self.block_crc_enabled && self.block_crc.get() != crc {
                        return Step::Done(self.client_abort(AbortCode::CrcError, send));
                    }
                    self.state = State::UploadBlkEndCrsp;
                    Step::Continue
                }
                _ => Step::Done(self.client_abort(AbortCode::InvalidCommandSpecifier, send)),
            },
            // States which expect no response frame
            _ => Step::Done(self.client_abort(AbortCode::InvalidCommandSpecifier, send)),
        }
    }

    /// Shared handling of the upload initiate response, both for plain
    /// uploads and for a downgraded block upload
    #[allow(clippy::too_many_arguments)]
    fn handle_upload_initiate(
        &mut self,
        n: u8,
        e: bool,
        s: bool,
        index: u16,
        sub: u8,
        data: [u8; 4],
        send: SendFn,
    ) -> Step {
        if index != self.index || sub != self.subindex {
            return Step::Done(self.client_abort(AbortCode::IncompatibleParameter, send));
        }
        if e {
            let len = if s { 4 - n as usize } else { 0 };
            self.fifo.write(&data[..len], None);
            self.size_transferred = len;
            self.state = State::Idle;
            Step::Done(TransferStatus::Success)
        } else {
            self.size_indicated = if s {
                u32::from_le_bytes(data) as usize
            } else {
                0
            };
            self.toggle = 0;
            self.state = State::UploadSegmentReq;
            Step::Continue
        }
    }

    /// Transmit whatever the current state owes the server
    fn emit(&mut self, send: SendFn, activity: &mut bool) -> Step {
        match self.state {
            State::DownloadInitiateReq => {
                if self.size_indicated > 0 && self.size_indicated <= 4 {
                    // Expedited: the whole value rides in the initiate
                    if self.fifo.occupied() < self.size_indicated && !self.data_complete {
                        // The caller is still pushing the value
                        return Step::Continue;
                    }
                    if self.fifo.occupied() != self.size_indicated {
                        return Step::Done(self.client_abort(AbortCode::DataTypeMismatch, send));
                    }
                    let mut data = [0u8; 4];
                    let n = self.fifo.read(&mut data);
                    let req = SdoRequest::expedited_download(
                        self.index,
                        self.subindex,
                        &data[..n],
                    );
                    if self.send_request(req, send).is_err() {
                        // Put the value back for the retry
                        self.fifo.reset();
                        self.fifo.write(&data[..n], None);
                        return Step::Continue;
                    }
                    self.finished = true;
                    self.size_transferred = n;
                    *activity = true;
                    self.state = State::DownloadInitiateRsp;
                } else {
                    let size = (self.size_indicated > 0).then_some(self.size_indicated as u32);
                    let req = SdoRequest::initiate_download(self.index, self.subindex, size);
                    if self.send_request(req, send).is_err() {
                        return Step::Continue;
                    }
                    *activity = true;
                    self.state = State::DownloadInitiateRsp;
                }
                Step::Continue
            }
            State::DownloadSegmentReq => {
                let available = self.fifo.occupied();
                if available == 0 && !self.data_complete {
                    return Step::Continue;
                }
                let mut data = [0u8; 7];
                let n = self.fifo.read(&mut data[..available.min(7)]);
                let last = self.data_complete && self.fifo.occupied() == 0;
                if self.size_indicated > 0 {
                    if self.size_transferred + n > self.size_indicated {
                        return Step::Done(
                            self.client_abort(AbortCode::DataTypeMismatchLengthHigh, send),
                        );
                    }
                    if last && self.size_transferred + n < self.size_indicated {
                        return Step::Done(
                            self.client_abort(AbortCode::DataTypeMismatchLengthLow, send),
                        );
                    }
                }
                let req = SdoRequest::DownloadSegment {
                    t: self.toggle != 0,
                    n: (7 - n) as u8,
                    c: last,
                    data,
                };
                if self.send_request(req, send).is_err() {
                    // Stage the bytes again for the retry
                    let mut staged = [0u8; 7];
                    staged[..n].copy_from_slice(&data[..n]);
                    let mut rest = [0u8; BLOCK_FIFO_SIZE];
                    let rest_n = self.fifo.read(&mut rest);
                    self.fifo.reset();
                    self.fifo.write(&staged[..n], None);
                    self.fifo.write(&rest[..rest_n], None);
                    return Step::Continue;
                }
                self.size_transferred += n;
                self.finished = last;
                *activity = true;
                self.state = State::DownloadSegmentRsp;
                Step::Continue
            }
            State::DownloadBlkInitiateReq => {
                let req = SdoRequest::InitiateBlockDownload {
                    cc: true,
                    s: self.size_indicated > 0,
                    index: self.index,
                    sub: self.subindex,
                    size: self.size_indicated as u32,
                };
                if self.send_request(req, send).is_err() {
                    return Step::Continue;
                }
                self.block_crc_enabled = true;
                *activity = true;
                self.state = State::DownloadBlkInitiateRsp;
                Step::Continue
            }
            State::DownloadBlkSubblockReq => self.emit_download_subblock(send, activity),
            State::DownloadBlkEndReq => {
                let crc = if self.block_crc_enabled {
                    self.block_crc.get()
                } else {
                    0
                };
                let req = SdoRequest::end_block_download(self.block_no_data, crc);
                if self.send_request(req, send).is_err() {
                    return Step::Continue;
                }
                *activity = true;
                self.state = State::DownloadBlkEndRsp;
                Step::Continue
            }
            State::UploadInitiateReq => {
                let req = SdoRequest::initiate_upload(self.index, self.subindex);
                if self.send_request(req, send).is_err() {
                    return Step::Continue;
                }
                *activity = true;
                self.state = State::UploadInitiateRsp;
                Step::Continue
            }
            State::UploadSegmentReq => {
                if self.fifo.free() < 7 {
                    // Caller must drain before the next segment is invited
                    return Step::Continue;
                }
                let req = SdoRequest::upload_segment_request(self.toggle != 0);
                if self.send_request(req, send).is_err() {
                    return Step::Continue;
                }
                *activity = true;
                self.state = State::UploadSegmentRsp;
                Step::Continue
            }
            State::UploadBlkInitiateReq => {
                let blksize = (self.fifo.free() / 7).min(127) as u8;
                let req = SdoRequest::initiate_block_upload(
                    self.index,
                    self.subindex,
                    true,
                    blksize,
                    0,
                );
                if self.send_request(req, send).is_err() {
                    return Step::Continue;
                }
                self.block_crc_enabled = true;
                self.block_size = blksize;
                *activity = true;
                self.state = State::UploadBlkInitiateRsp;
                Step::Continue
            }
            State::UploadBlkStartReq => {
                if self.send_request(SdoRequest::StartBlockUpload, send).is_err() {
                    return Step::Continue;
                }
                *activity = true;
                self.state = State::UploadBlkSubblockSreq;
                Step::Continue
            }
            State::UploadBlkSubblockCrsp => {
                let blksize = (self.fifo.free() / 7).min(127) as u8;
                if blksize == 0 {
                    // Nothing can be accepted until the caller drains
                    return Step::Continue;
                }
                let ackseq = self.block_seqno;
                let req = SdoRequest::confirm_block(ackseq, blksize);
                if self.send_request(req, send).is_err() {
                    return Step::Continue;
                }
                // Publish the accepted segments; the held-back final
                // segment is appended once the end request sizes it
                let crc = self.block_crc_enabled.then_some(&mut self.block_crc);
                self.fifo.alt_finish(crc);
                let published = 7 * (self.block_seqno as usize - self.finished as usize);
                self.size_transferred += published;
                *activity = true;
                if self.finished {
                    self.state = State::UploadBlkEndSreq;
                } else {
                    self.block_size = blksize;
                    self.block_seqno = 0;
                    self.fifo.alt_begin(0);
                    self.state = State::UploadBlkSubblockSreq;
                }
                Step::Continue
            }
            State::UploadBlkEndCrsp => {
                if self.send_request(SdoRequest::EndBlockUpload, send).is_err() {
                    return Step::Continue;
                }
                self.state = State::Idle;
                Step::Done(TransferStatus::Success)
            }
            _ => Step::Continue,
        }
    }

    /// Send as many sub-block segments as possible
    fn emit_download_subblock(&mut self, send: SendFn, activity: &mut bool) -> Step {
        while self.block_seqno < self.block_size {
            let mut data = [0u8; 7];
            let before = self.fifo.alt_position();
            let n = self.fifo.alt_read(&mut data);
            if n == 0 && !self.data_complete {
                // Waiting for the caller to push more payload
                return Step::Continue;
            }
            let remaining_after = self.fifo.occupied() - self.fifo.alt_position();
            let last = self.data_complete && remaining_after == 0;
            if self.size_indicated > 0 {
                let sent_after = self.size_transferred + self.fifo.alt_position();
                if sent_after > self.size_indicated {
                    return Step::Done(
                        self.client_abort(AbortCode::DataTypeMismatchLengthHigh, send),
                    );
                }
                if last && sent_after < self.size_indicated {
                    return Step::Done(
                        self.client_abort(AbortCode::DataTypeMismatchLengthLow, send),
                    );
                }
            }

            let seqno = self.block_seqno + 1;
            let segment = BlockSegment {
                c: last,
                seqnum: seqno,
                data,
            };
            if send(segment.to_can_message(CanId::std(self.cob_c2s))).is_err() {
                // Rewind the speculative cursor; resume here next tick
                self.fifo.alt_begin(before);
                return Step::Continue;
            }
            *activity = true;
            self.block_seqno = seqno;
            if last {
                self.block_no_data = (7 - n) as u8;
                self.finished = true;
                self.state = State::DownloadBlkSubblockRsp;
                return Step::Continue;
            }
        }
        self.state = State::DownloadBlkSubblockRsp;
        Step::Continue
    }
}

/// A single-transfer SDO client state machine
///
/// See the [module docs](self) for the threading model. Use
/// [`SdoClient`](crate::SdoClient) for a ready-made async driver around
/// this engine.
pub struct SdoClientEngine {
    inner: Mutex<Transfer>,
}

impl std::fmt::Debug for SdoClientEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdoClientEngine").finish_non_exhaustive()
    }
}

impl SdoClientEngine {
    /// Create an engine with default timeouts
    pub fn new() -> Self {
        Self::with_config(SdoEngineConfig::default())
    }

    /// Create an engine with explicit timeouts
    pub fn with_config(config: SdoEngineConfig) -> Self {
        Self {
            inner: Mutex::new(Transfer::new(config)),
        }
    }

    /// Configure the SDO channel to a server
    ///
    /// `cob_c2s`/`cob_s2c` are the raw 32-bit COB-ID values; bit 31 set on
    /// either marks the channel invalid, as does a zero identifier.
    /// Reconfiguring with the currently active values is a no-op. Returns
    /// the 11-bit response identifier the caller should subscribe to, or
    /// None when the channel is invalid.
    pub fn setup_server(&self, cob_c2s: u32, cob_s2c: u32, node_id: u8) -> Option<u16> {
        let mut t = self.inner.lock().unwrap();
        let c2s = (cob_c2s & COB_ID_MASK) as u16;
        let s2c = (cob_s2c & COB_ID_MASK) as u16;
        if t.valid && t.cob_c2s == c2s && t.cob_s2c == s2c && t.server_node_id == node_id {
            return Some(s2c);
        }
        let invalid = (cob_c2s | cob_s2c) & COB_ID_INVALID_FLAG != 0 || c2s == 0 || s2c == 0;
        t.cob_c2s = c2s;
        t.cob_s2c = s2c;
        t.server_node_id = node_id;
        t.valid = !invalid;
        t.valid.then_some(s2c)
    }

    /// Declare this process' own node id, enabling local-transfer
    /// detection
    pub fn set_own_node_id(&self, node_id: u8) {
        self.inner.lock().unwrap().own_node_id = Some(node_id);
    }

    /// Start a download (write) of `size_indicated` bytes to the server
    ///
    /// Pass 0 when the total size is unknown; the transfer then runs
    /// segmented and ends when [`push_finished`](Self::push_finished) has
    /// been called and the FIFO drains. Payload is supplied with
    /// [`push_data`](Self::push_data).
    pub fn begin_download(
        &self,
        index: u16,
        subindex: u8,
        size_indicated: usize,
        block: bool,
    ) -> Result<(), TransferError> {
        let mut t = self.inner.lock().unwrap();
        t.begin(index, subindex, false)?;
        t.size_indicated = size_indicated;
        if block && size_indicated > 4 {
            t.state = State::DownloadBlkInitiateReq;
        }
        Ok(())
    }

    /// Start an upload (read) from the server
    ///
    /// Received bytes are collected with [`pull_data`](Self::pull_data).
    pub fn begin_upload(
        &self,
        index: u16,
        subindex: u8,
        block: bool,
    ) -> Result<(), TransferError> {
        let mut t = self.inner.lock().unwrap();
        t.begin(index, subindex, true)?;
        if block {
            t.state = State::UploadBlkInitiateReq;
        }
        Ok(())
    }

    /// Push download payload into the engine, returning the accepted count
    pub fn push_data(&self, data: &[u8]) -> usize {
        self.inner.lock().unwrap().fifo.write(data, None)
    }

    /// Mark the download payload as complete
    pub fn push_finished(&self) {
        self.inner.lock().unwrap().data_complete = true;
    }

    /// Drain uploaded bytes out of the engine, returning the count read
    pub fn pull_data(&self, buf: &mut [u8]) -> usize {
        self.inner.lock().unwrap().fifo.read(buf)
    }

    /// Total bytes moved by the current (or last) transfer
    pub fn bytes_transferred(&self) -> usize {
        self.inner.lock().unwrap().size_transferred
    }

    /// Frame intake, called from the bus dispatcher
    ///
    /// Frames with a DLC other than 8 are ignored. During block upload
    /// sub-block collection, segments are decoded straight into the FIFO;
    /// otherwise the payload is stashed for the next `process` call. This
    /// never sends on the bus.
    pub fn on_frame(&self, msg: &CanMessage) {
        self.inner.lock().unwrap().on_frame(msg);
    }

    /// Advance the transfer
    ///
    /// # Arguments
    /// - `elapsed_us`: microseconds since the previous call
    /// - `abort`: when set, abort the running transfer (a single abort
    ///   frame is emitted and the engine returns to idle)
    /// - `next_wake_us`: optional scheduling hint, shrunk to the time left
    ///   until the transfer timeout when that is sooner
    /// - `send`: transmit callback; a failed send leaves the engine in
    ///   place to retry on the next tick
    pub fn process(
        &self,
        elapsed_us: u32,
        abort: bool,
        next_wake_us: Option<&mut u32>,
        send: &mut dyn FnMut(CanMessage) -> Result<(), CanMessage>,
    ) -> TransferStatus {
        self.inner
            .lock()
            .unwrap()
            .process(elapsed_us, abort, next_wake_us, send)
    }
}

impl Default for SdoClientEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> SdoClientEngine {
        let engine = SdoClientEngine::new();
        assert_eq!(engine.setup_server(0x625, 0x5A5, 0x25), Some(0x5A5));
        engine
    }

    fn tick(engine: &SdoClientEngine, elapsed: u32) -> (Vec<CanMessage>, TransferStatus) {
        let mut sent = Vec::new();
        let status = engine.process(elapsed, false, None, &mut |msg| {
            sent.push(msg);
            Ok(())
        });
        (sent, status)
    }

    fn respond(engine: &SdoClientEngine, resp: SdoResponse) {
        engine.on_frame(&resp.to_can_message(CanId::std(0x5A5)));
    }

    #[test]
    fn test_expedited_download_frame_bytes() {
        let engine = engine();
        engine.begin_download(0x2001, 0, 4, false).unwrap();
        engine.push_data(&[0xDE, 0xAD, 0xBE, 0xEF]);
        engine.push_finished();

        let (sent, status) = tick(&engine, 0);
        assert_eq!(status, TransferStatus::WaitingResponse);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id(), CanId::std(0x625));
        assert_eq!(
            sent[0].data(),
            &[0x23, 0x01, 0x20, 0x00, 0xDE, 0xAD, 0xBE, 0xEF]
        );

        respond(&engine, SdoResponse::download_acknowledge(0x2001, 0));
        let (sent, status) = tick(&engine, 0);
        assert!(sent.is_empty());
        assert_eq!(status, TransferStatus::Success);
    }

    #[test]
    fn test_segmented_upload_ten_bytes() {
        let engine = engine();
        engine.begin_upload(0x2002, 1, false).unwrap();

        let (sent, _) = tick(&engine, 0);
        assert_eq!(sent[0].data()[0], 0x40);

        respond(&engine, SdoResponse::upload_acknowledge(0x2002, 1, Some(10)));
        let (sent, _) = tick(&engine, 0);
        assert_eq!(sent[0].data()[0], 0x60);

        respond(
            &engine,
            SdoResponse::upload_segment(false, false, &[0, 1, 2, 3, 4, 5, 6]),
        );
        let (sent, _) = tick(&engine, 0);
        // Second request carries the flipped toggle
        assert_eq!(sent[0].data()[0], 0x70);

        respond(&engine, SdoResponse::upload_segment(true, true, &[7, 8, 9]));
        let (sent, status) = tick(&engine, 0);
        assert!(sent.is_empty());
        assert_eq!(status, TransferStatus::Success);

        let mut buf = [0u8; 16];
        let n = engine.pull_data(&mut buf);
        assert_eq!(&buf[..n], &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_upload_toggle_error_aborts() {
        let engine = engine();
        engine.begin_upload(0x2002, 1, false).unwrap();
        tick(&engine, 0);
        respond(&engine, SdoResponse::upload_acknowledge(0x2002, 1, Some(10)));
        tick(&engine, 0);

        // Server answers with the wrong toggle bit
        respond(
            &engine,
            SdoResponse::upload_segment(true, false, &[0, 1, 2, 3, 4, 5, 6]),
        );
        let (sent, status) = tick(&engine, 0);
        assert_eq!(
            status,
            TransferStatus::AbortedByClient {
                code: AbortCode::ToggleNotAlternated
            }
        );
        assert_eq!(sent.len(), 1);
        assert!(raw::is_abort(sent[0].data()));
        assert_eq!(
            raw::abort_code(sent[0].data()),
            AbortCode::ToggleNotAlternated as u32
        );
    }

    #[test]
    fn test_caller_abort_sends_device_incompat() {
        let engine = engine();
        engine.begin_upload(0x2001, 2, false).unwrap();
        tick(&engine, 0);
        respond(&engine, SdoResponse::upload_acknowledge(0x2001, 2, Some(20)));
        tick(&engine, 0);

        let mut sent = Vec::new();
        let status = engine.process(0, true, None, &mut |msg| {
            sent.push(msg);
            Ok(())
        });
        assert_eq!(
            status,
            TransferStatus::AbortedByClient {
                code: AbortCode::DeviceIncompatibility
            }
        );
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].data(),
            &[0x80, 0x01, 0x20, 0x02, 0x00, 0x00, 0x04, 0x08]
        );

        // The engine is reusable immediately
        assert!(engine.begin_upload(0x2001, 2, false).is_ok());
    }

    #[test]
    fn test_timeout_aborts() {
        let engine = engine();
        engine.begin_upload(0x2001, 0, false).unwrap();
        tick(&engine, 0);

        let (sent, status) = tick(&engine, 400_000);
        assert!(sent.is_empty());
        assert_eq!(status, TransferStatus::WaitingResponse);

        let (sent, status) = tick(&engine, 700_000);
        assert_eq!(
            status,
            TransferStatus::AbortedByClient {
                code: AbortCode::SdoTimeout
            }
        );
        assert_eq!(raw::abort_code(sent[0].data()), AbortCode::SdoTimeout as u32);
    }

    #[test]
    fn test_server_abort_surfaces() {
        let engine = engine();
        engine.begin_upload(0x2001, 0, false).unwrap();
        tick(&engine, 0);
        respond(
            &engine,
            SdoResponse::abort(0x2001, 0, AbortCode::NoSuchObject),
        );
        let (sent, status) = tick(&engine, 0);
        assert!(sent.is_empty());
        assert_eq!(
            status,
            TransferStatus::AbortedByServer {
                code: AbortCode::NoSuchObject as u32
            }
        );
    }

    #[test]
    fn test_block_download_sequence() {
        let engine = engine();
        let payload: Vec<u8> = (0..20u8).collect();
        engine.begin_download(0x2003, 0, 20, true).unwrap();
        engine.push_data(&payload);
        engine.push_finished();

        // Initiate: 0xC6 = block download with crc + size
        let (sent, _) = tick(&engine, 0);
        assert_eq!(sent[0].data()[0], 0xC6);
        assert_eq!(&sent[0].data()[4..8], &20u32.to_le_bytes());

        respond(
            &engine,
            SdoResponse::block_download_acknowledge(true, 0x2003, 0, 127),
        );
        let (sent, status) = tick(&engine, 0);
        assert_eq!(status, TransferStatus::BlockDownloadInProgress);
        // 20 bytes -> 3 segments, last flagged
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].data()[0], 1);
        assert_eq!(sent[1].data()[0], 2);
        assert_eq!(sent[2].data()[0], 0x83);
        assert_eq!(&sent[2].data()[1..7], &payload[14..20]);

        respond(&engine, SdoResponse::confirm_block(3, 127));
        let (sent, _) = tick(&engine, 0);
        // End request: 0xC1 | (no_data << 2); 21 - 20 = 1 pad byte
        assert_eq!(sent[0].data()[0], 0xC1 | (1 << 2));
        let crc = crc16::State::<crc16::XMODEM>::calculate(&payload);
        assert_eq!(&sent[0].data()[1..3], &crc.to_le_bytes());

        respond(&engine, SdoResponse::ConfirmBlockDownloadEnd);
        let (_, status) = tick(&engine, 0);
        assert_eq!(status, TransferStatus::Success);
    }

    #[test]
    fn test_block_download_retransmit_tail() {
        let engine = engine();
        let payload: Vec<u8> = (0..21u8).collect();
        engine.begin_download(0x2003, 0, 21, true).unwrap();
        engine.push_data(&payload);
        engine.push_finished();
        tick(&engine, 0);
        respond(
            &engine,
            SdoResponse::block_download_acknowledge(true, 0x2003, 0, 127),
        );
        let (sent, _) = tick(&engine, 0);
        assert_eq!(sent.len(), 3);

        // Server only saw the first segment
        respond(&engine, SdoResponse::confirm_block(1, 127));
        let (sent, _) = tick(&engine, 0);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].data()[0], 1);
        assert_eq!(&sent[0].data()[1..8], &payload[7..14]);
        assert_eq!(sent[1].data()[0], 0x82);
        assert_eq!(&sent[1].data()[1..8], &payload[14..21]);

        respond(&engine, SdoResponse::confirm_block(2, 127));
        let (sent, _) = tick(&engine, 0);
        let crc = crc16::State::<crc16::XMODEM>::calculate(&payload);
        assert_eq!(sent[0].data()[0], 0xC1);
        assert_eq!(&sent[0].data()[1..3], &crc.to_le_bytes());
    }

    #[test]
    fn test_block_upload_sequence() {
        let engine = engine();
        engine.begin_upload(0x2003, 0, true).unwrap();

        let (sent, _) = tick(&engine, 0);
        // 0xA4: block upload initiate with crc support
        assert_eq!(sent[0].data()[0], 0xA4);
        let offered = sent[0].data()[4];
        assert_eq!(offered, 127);

        respond(
            &engine,
            SdoResponse::block_upload_acknowledge(true, 0x2003, 0, Some(16)),
        );
        let (sent, _) = tick(&engine, 0);
        // Start upload
        assert_eq!(sent[0].data()[0], 0xA3);

        // Server streams 3 segments; 16 bytes, 5 pad in the last
        let payload: Vec<u8> = (100..116u8).collect();
        for (i, chunk) in payload.chunks(7).enumerate() {
            let mut data = [0u8; 7];
            data[..chunk.len()].copy_from_slice(chunk);
            let seg = BlockSegment {
                c: i == 2,
                seqnum: (i + 1) as u8,
                data,
            };
            engine.on_frame(&seg.to_can_message(CanId::std(0x5A5)));
        }

        let (sent, status) = tick(&engine, 0);
        assert_eq!(status, TransferStatus::BlockUploadInProgress);
        // Confirm: ackseq 3
        assert_eq!(sent[0].data()[0], 0xA2);
        assert_eq!(sent[0].data()[1], 3);

        let crc = crc16::State::<crc16::XMODEM>::calculate(&payload);
        respond(&engine, SdoResponse::block_upload_end(5, crc));
        let (sent, status) = tick(&engine, 0);
        // End acknowledged with 0xA1 and the transfer completes
        assert_eq!(sent[0].data()[0], 0xA1);
        assert_eq!(status, TransferStatus::Success);

        let mut buf = [0u8; 32];
        let n = engine.pull_data(&mut buf);
        assert_eq!(&buf[..n], &payload[..]);
    }

    #[test]
    fn test_block_upload_gap_forces_early_confirm() {
        let engine = engine();
        engine.begin_upload(0x2003, 0, true).unwrap();
        tick(&engine, 0);
        respond(
            &engine,
            SdoResponse::block_upload_acknowledge(true, 0x2003, 0, Some(100)),
        );
        tick(&engine, 0);

        let seg = |c, seqnum| {
            BlockSegment {
                c,
                seqnum,
                data: [seqnum; 7],
            }
            .to_can_message(CanId::std(0x5A5))
        };
        engine.on_frame(&seg(false, 1));
        engine.on_frame(&seg(false, 2));
        // Segment 3 lost; 4 arrives
        engine.on_frame(&seg(false, 4));

        let (sent, _) = tick(&engine, 0);
        assert_eq!(sent[0].data()[0], 0xA2);
        assert_eq!(sent[0].data()[1], 2);
    }

    #[test]
    fn test_invalid_channel_rejected() {
        let engine = SdoClientEngine::new();
        assert_eq!(
            engine.setup_server(0x625 | COB_ID_INVALID_FLAG, 0x5A5, 0x25),
            None
        );
        assert_eq!(
            engine.begin_upload(0x2000, 0, false),
            Err(TransferError::ChannelInvalid)
        );
    }

    #[test]
    fn test_busy_engine_rejected() {
        let engine = engine();
        engine.begin_upload(0x2000, 0, false).unwrap();
        assert_eq!(
            engine.begin_upload(0x2000, 0, false),
            Err(TransferError::EngineBusy)
        );
    }

    #[test]
    fn test_local_transfer_short_circuit() {
        let engine = engine();
        engine.set_own_node_id(0x25);
        engine.begin_upload(0x2000, 0, false).unwrap();
        let (sent, status) = tick(&engine, 0);
        assert!(sent.is_empty());
        assert_eq!(status, TransferStatus::WaitingLocalTransfer);
    }

    #[test]
    fn test_backpressure_drops_second_frame() {
        let engine = engine();
        engine.begin_upload(0x2002, 1, false).unwrap();
        tick(&engine, 0);
        respond(&engine, SdoResponse::upload_acknowledge(0x2002, 1, Some(10)));
        // A second non-abort frame before process must be dropped
        respond(&engine, SdoResponse::upload_segment(false, false, &[9; 7]));
        let (sent, _) = tick(&engine, 0);
        // The ack was consumed, so a segment request goes out
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data()[0], 0x60);
    }
}
