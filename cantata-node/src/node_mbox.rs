//! Inbound frame dispatch for the node
//!
//! A `NodeMbox` is the node's subscription surface on the bus: the receive
//! context (a CAN IRQ, or the bus dispatch thread) hands every frame to
//! [`NodeMbox::store_message`], which routes it to the matching consumer.
//! Nothing here sends frames; outbound traffic is produced by
//! [`Node::process`](crate::Node::process).

use cantata_common::{
    messages::{CanId, CanMessage},
    AtomicCell,
};

use crate::sdo_server::SdoReceiver;

/// Frame intake shared between the receive context and the [`Node`](crate::Node)
pub struct NodeMbox {
    sdo_cob_id: AtomicCell<Option<CanId>>,
    sdo_receiver: SdoReceiver,
    notify_cb: AtomicCell<Option<&'static (dyn Fn() + Sync)>>,
}

impl Default for NodeMbox {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeMbox {
    /// Create a new mailbox
    pub const fn new() -> Self {
        Self {
            sdo_cob_id: AtomicCell::new(None),
            sdo_receiver: SdoReceiver::new(),
            notify_cb: AtomicCell::new(None),
        }
    }

    /// Set a callback to run when a received frame requires processing
    ///
    /// Applications use this to schedule an immediate `process` call (e.g.
    /// wake a task) instead of waiting for the next tick.
    pub fn set_process_notify_callback(&self, callback: &'static (dyn Fn() + Sync)) {
        self.notify_cb.store(Some(callback));
    }

    fn notify(&self) {
        if let Some(cb) = self.notify_cb.load() {
            cb();
        }
    }

    pub(crate) fn set_sdo_cob_id(&self, cob_id: Option<CanId>) {
        self.sdo_cob_id.store(cob_id);
    }

    pub(crate) fn sdo_receiver(&self) -> &SdoReceiver {
        &self.sdo_receiver
    }

    /// Store a received CAN message
    ///
    /// Returns the message back when no consumer claimed it, so callers can
    /// chain other dispatchers behind this one.
    pub fn store_message(&self, msg: CanMessage) -> Result<(), CanMessage> {
        if let Some(cob_id) = self.sdo_cob_id.load() {
            if msg.id() == cob_id {
                if self.sdo_receiver.handle_frame(msg.data()) {
                    self.notify();
                }
                return Ok(());
            }
        }
        Err(msg)
    }
}
