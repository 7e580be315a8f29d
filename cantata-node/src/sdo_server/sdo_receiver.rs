//! Receive-context half of the SDO server

use core::cell::UnsafeCell;

use cantata_common::{
    sdo::{raw, BlockSegment, SdoRequest},
    AtomicCell,
};

/// Buffer large enough for the maximum sub-block of 127 segments
pub const SDO_BUFFER_SIZE: usize = 7 * 127;

/// Minimum headroom below which the receiver forces a confirmation round so
/// the server can drain the buffer
const FLUSH_HEADROOM: usize = 7 + 2;

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum ReceiverState {
    /// Requests are decoded and mailed to the server
    Normal,
    /// Block download in progress; segments go straight into the buffer
    BlockReceive,
    /// A sub-block finished (all segments seen, last-segment flag, or the
    /// buffer ran out of headroom); the server must confirm
    BlockCompleted {
        /// Last in-sequence segment number received
        ackseq: u8,
        /// Highest segment number received
        last_segment: u8,
        /// The last-segment-of-transfer flag was seen
        complete: bool,
    },
}

/// Shared state between the receive context and the SDO server
///
/// During block downloads segment data is written directly into the buffer
/// here, because no response is owed until the whole sub-block has arrived
/// and segments may come in faster than `process` runs. A timer is reset on
/// every accepted frame; `process` advances it to detect timeouts.
pub struct SdoReceiver {
    request: AtomicCell<Option<SdoRequest>>,
    state: AtomicCell<ReceiverState>,
    buffer: UnsafeCell<[u8; SDO_BUFFER_SIZE]>,
    timer: AtomicCell<u32>,
    last_seqnum: AtomicCell<u8>,
    blksize: AtomicCell<u8>,
}

// Buffer access is confined to critical sections
unsafe impl Sync for SdoReceiver {}

impl Default for SdoReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl SdoReceiver {
    pub const fn new() -> Self {
        Self {
            request: AtomicCell::new(None),
            state: AtomicCell::new(ReceiverState::Normal),
            buffer: UnsafeCell::new([0; SDO_BUFFER_SIZE]),
            timer: AtomicCell::new(0),
            last_seqnum: AtomicCell::new(0),
            blksize: AtomicCell::new(0),
        }
    }

    /// Handle a frame received on the server's request COB-ID
    ///
    /// Returns true when the server has something to do and the application
    /// should schedule a call to `process`.
    pub fn handle_frame(&self, msg_data: &[u8]) -> bool {
        // SDO frames are always 8 bytes
        if msg_data.len() != 8 {
            return false;
        }
        match self.state() {
            ReceiverState::Normal => match SdoRequest::try_from(msg_data) {
                Ok(req) => {
                    self.request.store(Some(req));
                    self.timer.store(0);
                    true
                }
                Err(_) => false,
            },
            ReceiverState::BlockReceive => {
                // While collecting a sub-block every frame is a segment,
                // except aborts. An abort is distinguishable because its
                // first byte (0x80) would decode as the forbidden seqnum 0.
                if raw::is_abort(msg_data) {
                    if let Ok(req) = SdoRequest::try_from(msg_data) {
                        self.request.store(Some(req));
                        self.set_state(ReceiverState::Normal);
                        return true;
                    }
                }

                // Unwrap safety: length was checked above
                let segment = BlockSegment::try_from(msg_data).unwrap();
                if segment.seqnum == 0 {
                    return false;
                }

                let mut process_required = false;
                critical_section::with(|_| {
                    self.timer.store(0);
                    // seqnum is a 7-bit field, so pos tops out at 126 * 7
                    let pos = (segment.seqnum - 1) as usize * 7;
                    let buffer = unsafe { &mut *self.buffer.get() };
                    if pos + 7 <= buffer.len() {
                        buffer[pos..pos + 7].copy_from_slice(&segment.data);
                    }

                    if segment.seqnum == self.last_seqnum.load() + 1 {
                        self.last_seqnum.store(segment.seqnum);
                    }

                    // A sub-block completes on its final segment, on the
                    // last segment of the whole transfer, or when the buffer
                    // has no room for another segment. When the last-segment
                    // flag and the headroom limit coincide, last wins.
                    let headroom = buffer.len() - segment.seqnum as usize * 7;
                    if segment.c
                        || segment.seqnum == self.blksize.load()
                        || headroom < FLUSH_HEADROOM
                    {
                        self.state.store(ReceiverState::BlockCompleted {
                            ackseq: self.last_seqnum.load(),
                            last_segment: segment.seqnum,
                            complete: segment.c,
                        });
                        process_required = true;
                    }
                });
                process_required
            }
            // Sub-block already complete; the server has catching up to do
            ReceiverState::BlockCompleted { .. } => true,
        }
    }

    pub(crate) fn set_state(&self, state: ReceiverState) {
        self.state.store(state);
    }

    pub(crate) fn state(&self) -> ReceiverState {
        self.state.load()
    }

    pub(crate) fn take_request(&self) -> Option<SdoRequest> {
        self.request.take()
    }

    /// Borrow the transfer buffer
    ///
    /// Safety: only sound while no block segments can arrive, i.e. outside
    /// of `BlockReceive` state or while the protocol guarantees the client
    /// is waiting on us.
    pub(crate) unsafe fn buffer(&self) -> &mut [u8] {
        &mut *self.buffer.get()
    }

    pub(crate) fn begin_block_download(&self, blksize: u8) {
        critical_section::with(|_| {
            self.last_seqnum.store(0);
            self.timer.store(0);
            self.blksize.store(blksize);
            self.set_state(ReceiverState::BlockReceive);
        });
    }

    pub(crate) fn restart_block_download(&self, ackseq: u8) {
        critical_section::with(|_| {
            self.last_seqnum.store(ackseq);
            self.timer.store(0);
            self.set_state(ReceiverState::BlockReceive);
        });
    }

    pub(crate) fn increment_timer(&self, elapsed_us: u32) -> u32 {
        critical_section::with(|_| {
            let timer = self.timer.load().saturating_add(elapsed_us);
            self.timer.store(timer);
            timer
        })
    }
}
