//! The core Node object

use cantata_common::{
    constants::{cob, object_ids},
    messages::{CanId, CanMessage, Heartbeat, NmtState},
    objects::{find_object, ODEntry},
    NodeId,
};

use crate::node_mbox::NodeMbox;
use crate::sdo_server::SdoServer;

use defmt_or_log::debug;

/// A CANopen node: SDO server plus heartbeat production over a static
/// object dictionary
///
/// # Operation
///
/// The node is driven by calling [`Node::process`] periodically with the
/// microseconds elapsed since the previous call. Received frames are
/// delivered asynchronously through the [`NodeMbox`]; `process` consumes
/// them, advances the SDO state machine, and emits outbound frames through
/// the send callback. Registering a notify callback on the mailbox lets an
/// application call `process` immediately when a frame arrives rather than
/// waiting for the next tick.
///
/// NMT command handling is intentionally not part of this object; the
/// application (or an external NMT component) moves the node between states
/// with [`Node::set_nmt_state`].
pub struct Node {
    node_id: NodeId,
    nmt_state: NmtState,
    sdo_server: SdoServer,
    od: &'static [ODEntry<'static>],
    mbox: &'static NodeMbox,
    heartbeat_period_ms: u16,
    heartbeat_timer_us: u32,
}

impl Node {
    /// Create a new node
    ///
    /// The default SDO channel (`0x600 + node_id` / `0x580 + node_id`) is
    /// subscribed on the mailbox, and the heartbeat producer period is read
    /// from object 0x1017 when present.
    pub fn new(node_id: NodeId, mbox: &'static NodeMbox, od: &'static [ODEntry<'static>]) -> Self {
        mbox.set_sdo_cob_id(Some(CanId::std(cob::SDO_RX_BASE + node_id.raw() as u16)));
        let heartbeat_period_ms = find_object(od, object_ids::HEARTBEAT_PRODUCER_TIME)
            .and_then(|obj| obj.read_u16(0).ok())
            .unwrap_or(0);

        Self {
            node_id,
            nmt_state: NmtState::Bootup,
            sdo_server: SdoServer::new(),
            od,
            mbox,
            heartbeat_period_ms,
            heartbeat_timer_us: 0,
        }
    }

    /// Run periodic processing
    ///
    /// # Arguments
    /// - `elapsed_us`: microseconds elapsed since the previous call
    /// - `send`: callback for transmitting CAN messages; a failed send is
    ///   retried on a later call
    ///
    /// # Returns
    ///
    /// True when the object dictionary was updated, i.e. an SDO download
    /// completed.
    pub fn process(
        &mut self,
        elapsed_us: u32,
        send: &mut dyn FnMut(CanMessage) -> Result<(), CanMessage>,
    ) -> bool {
        if self.nmt_state == NmtState::Bootup {
            // Announce boot-up, then wait in pre-operational for the
            // application to start the node
            let msg = Heartbeat {
                node: self.node_id.raw(),
                state: NmtState::Bootup,
            }
            .to_can_message();
            if send(msg).is_ok() {
                debug!("Node {}: boot-up sent", self.node_id.raw());
                self.nmt_state = NmtState::PreOperational;
            }
        }

        let tx_cob = CanId::std(cob::SDO_TX_BASE + self.node_id.raw() as u16);
        let updated = self
            .sdo_server
            .process(
                self.mbox.sdo_receiver(),
                elapsed_us,
                self.od,
                &mut |frame| send(frame.to_can_message(tx_cob)).map_err(|_| ()),
            )
            .is_some();

        if self.heartbeat_period_ms != 0 {
            let period_us = self.heartbeat_period_ms as u32 * 1000;
            self.heartbeat_timer_us = self.heartbeat_timer_us.saturating_add(elapsed_us);
            if self.heartbeat_timer_us >= period_us {
                let msg = Heartbeat {
                    node: self.node_id.raw(),
                    state: self.nmt_state,
                }
                .to_can_message();
                if send(msg).is_ok() {
                    self.heartbeat_timer_us = 0;
                }
            }
        }

        updated
    }

    /// Get the node's id
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Get the current NMT state
    pub fn nmt_state(&self) -> NmtState {
        self.nmt_state
    }

    /// Move the node to a new NMT state
    pub fn set_nmt_state(&mut self, state: NmtState) {
        if state != self.nmt_state {
            debug!(
                "Node {}: NMT state {:?} -> {:?}",
                self.node_id.raw(),
                self.nmt_state,
                state
            );
            self.nmt_state = state;
        }
    }

    /// Override the SDO transfer timeout
    pub fn set_sdo_timeout(&mut self, timeout_us: u32) {
        self.sdo_server = SdoServer::with_timeout(timeout_us);
    }
}

#[cfg(test)]
mod tests {
    use cantata_common::objects::ScalarField;
    use cantata_common::sdo::{SdoRequest, SdoResponse};

    use super::*;

    fn test_od() -> &'static [ODEntry<'static>] {
        let period = Box::leak(Box::new(ScalarField::<u16>::new(100)));
        let value = Box::leak(Box::new(ScalarField::<u32>::new(0x11223344)));
        Box::leak(Box::new([
            ODEntry {
                index: 0x1017,
                data: period,
            },
            ODEntry {
                index: 0x2000,
                data: value,
            },
        ]))
    }

    #[test]
    fn test_bootup_then_heartbeat() {
        let mbox = Box::leak(Box::new(NodeMbox::new()));
        let mut node = Node::new(NodeId::new(5).unwrap(), mbox, test_od());

        let mut sent = Vec::new();
        node.process(0, &mut |msg| {
            sent.push(msg);
            Ok(())
        });
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id(), CanId::std(0x705));
        assert_eq!(sent[0].data(), &[0]);
        assert_eq!(node.nmt_state(), NmtState::PreOperational);

        // 100 ms period: nothing at 50 ms, heartbeat at 100 ms
        sent.clear();
        node.process(50_000, &mut |msg| {
            sent.push(msg);
            Ok(())
        });
        assert!(sent.is_empty());
        node.process(50_000, &mut |msg| {
            sent.push(msg);
            Ok(())
        });
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data(), &[NmtState::PreOperational as u8]);
    }

    #[test]
    fn test_sdo_request_routed_and_answered() {
        let mbox = Box::leak(Box::new(NodeMbox::new()));
        let mut node = Node::new(NodeId::new(5).unwrap(), mbox, test_od());
        node.process(0, &mut |_| Ok(()));

        let req = SdoRequest::initiate_upload(0x2000, 0).to_can_message(CanId::std(0x605));
        mbox.store_message(req).unwrap();

        let mut sent = Vec::new();
        node.process(0, &mut |msg| {
            sent.push(msg);
            Ok(())
        });
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id(), CanId::std(0x585));
        let resp = SdoResponse::try_from(sent[0]).unwrap();
        assert_eq!(
            resp,
            SdoResponse::expedited_upload(0x2000, 0, &0x11223344u32.to_le_bytes())
        );
    }

    #[test]
    fn test_unclaimed_frames_returned() {
        let mbox = Box::leak(Box::new(NodeMbox::new()));
        let _node = Node::new(NodeId::new(5).unwrap(), mbox, test_od());
        let msg = CanMessage::new(CanId::std(0x185), &[0; 8]);
        assert!(mbox.store_message(msg).is_err());
    }
}
