//! Bus manager
//!
//! Ties the master-side pieces together over one [`FrameMux`]: a per-node
//! SDO client checkout (each node's SDO server only talks to one client at
//! a time), and the heartbeat consumer with its process driver.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use cantata_common::{
    constants::cob,
    messages::{CanId, CanMessage},
    traits::{AsyncCanReceiver, AsyncCanSender},
};
use tokio::sync::mpsc;

use crate::driver::{Process, ProcessDriver};
use crate::heartbeat::{
    EmergencySink, HeartbeatConfigError, HeartbeatConsumer, MonitoredNode,
};
use crate::sdo_client::SdoClient;

use super::mux::{FrameMux, SubscriptionToken};

/// Sender half handed to SDO clients: transmission goes through the mux so
/// it is serialized with every other sender
pub struct MuxSender<S> {
    mux: FrameMux<S>,
}

impl<S> std::fmt::Debug for MuxSender<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxSender").finish_non_exhaustive()
    }
}

impl<S: AsyncCanSender + Sync> AsyncCanSender for MuxSender<S> {
    async fn send(&mut self, msg: CanMessage) -> Result<(), CanMessage> {
        self.mux.send(msg).await
    }
}

/// Receiver half handed to SDO clients: a mux subscription feeding a
/// channel, removed again on drop
pub struct MuxReceiver {
    rx: mpsc::UnboundedReceiver<CanMessage>,
    unsubscribe: Box<dyn FnMut() + Send>,
}

impl std::fmt::Debug for MuxReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxReceiver").finish_non_exhaustive()
    }
}

impl Drop for MuxReceiver {
    fn drop(&mut self) {
        (self.unsubscribe)();
    }
}

/// Error returned when the mux subscription channel closed
#[derive(Debug, Clone, Copy)]
pub struct ChannelClosed;

impl AsyncCanReceiver for MuxReceiver {
    type Error = ChannelClosed;

    fn try_recv(&mut self) -> Option<CanMessage> {
        self.rx.try_recv().ok()
    }

    async fn recv(&mut self) -> Result<CanMessage, ChannelClosed> {
        self.rx.recv().await.ok_or(ChannelClosed)
    }
}

/// Exclusive access to one node's SDO client
///
/// Holds the per-node lock for as long as the client is in use.
#[derive(Debug)]
pub struct SdoClientGuard<'a, S> {
    _guard: MutexGuard<'a, ()>,
    client: SdoClient<MuxSender<S>, MuxReceiver>,
}

impl<S> Deref for SdoClientGuard<'_, S> {
    type Target = SdoClient<MuxSender<S>, MuxReceiver>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl<S> DerefMut for SdoClientGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.client
    }
}

struct HeartbeatTick(Arc<HeartbeatConsumer>);

impl Process for HeartbeatTick {
    fn process(&self, elapsed_us: u32, next_wake_us: &mut u32) {
        // The master consumes heartbeats whenever it runs
        self.0.process(true, elapsed_us, Some(next_wake_us));
    }
}

/// Manage a CANopen bus as the master
pub struct BusManager<S> {
    mux: FrameMux<S>,
    sdo_locks: HashMap<u8, Mutex<()>>,
    heartbeat: Option<Arc<HeartbeatConsumer>>,
    heartbeat_subs: Vec<SubscriptionToken>,
    _driver: Option<ProcessDriver>,
}

impl<S> std::fmt::Debug for BusManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusManager").finish_non_exhaustive()
    }
}

impl<S: AsyncCanSender + Sync + 'static> BusManager<S> {
    /// Create a manager over an already-built multiplexer
    pub fn new(mux: FrameMux<S>) -> Self {
        let mut sdo_locks = HashMap::new();
        for id in 1..=127u8 {
            sdo_locks.insert(id, Mutex::new(()));
        }
        Self {
            mux,
            sdo_locks,
            heartbeat: None,
            heartbeat_subs: Vec::new(),
            _driver: None,
        }
    }

    /// Create a manager from a transport pair, spawning the dispatch task
    pub fn with_transport<R: AsyncCanReceiver + 'static>(sender: S, receiver: R) -> Self {
        Self::new(FrameMux::with_receiver(sender, receiver))
    }

    /// The underlying multiplexer, for wiring additional subscribers
    pub fn mux(&self) -> &FrameMux<S> {
        &self.mux
    }

    /// Check out the SDO client for a node
    ///
    /// Blocks while another caller holds the same node's client, since a
    /// server handles only one transfer at a time.
    ///
    /// # Panics
    ///
    /// Panics when `node_id` is outside 1..=127.
    pub fn sdo_client(&self, node_id: u8) -> SdoClientGuard<'_, S> {
        let lock = self
            .sdo_locks
            .get(&node_id)
            .unwrap_or_else(|| panic!("node id {node_id} out of range"));
        let guard = lock.lock().unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let resp_id = CanId::std(cob::SDO_TX_BASE + node_id as u16);
        let token = self.mux.subscribe(resp_id, 0x7FF, move |msg| {
            tx.send(*msg).ok();
        });
        let mux = self.mux.clone();
        let receiver = MuxReceiver {
            rx,
            unsubscribe: Box::new(move || mux.unsubscribe(token)),
        };
        let sender = MuxSender {
            mux: self.mux.clone(),
        };
        SdoClientGuard {
            _guard: guard,
            client: SdoClient::new_std(node_id, sender, receiver),
        }
    }

    /// Start consuming heartbeats for the given monitor table
    ///
    /// Subscribes each monitored node's heartbeat identifier and spawns a
    /// process driver ticking the consumer.
    pub fn start_heartbeat_consumer(
        &mut self,
        monitors: &[MonitoredNode],
        sink: Box<dyn EmergencySink>,
    ) -> Result<Arc<HeartbeatConsumer>, HeartbeatConfigError> {
        let consumer = Arc::new(HeartbeatConsumer::new(monitors, sink)?);

        for cob_id in consumer.cob_ids() {
            let consumer = consumer.clone();
            let token = self
                .mux
                .subscribe(CanId::std(cob_id), 0x7FF, move |msg| consumer.on_frame(msg));
            self.heartbeat_subs.push(token);
        }

        let driver = ProcessDriver::spawn(
            vec![Arc::new(HeartbeatTick(consumer.clone()))],
            Duration::from_millis(10),
        );
        self.heartbeat = Some(consumer.clone());
        self._driver = Some(driver);
        Ok(consumer)
    }

    /// The running heartbeat consumer, when started
    pub fn heartbeat_consumer(&self) -> Option<&Arc<HeartbeatConsumer>> {
        self.heartbeat.as_ref()
    }

    /// Stop consuming heartbeats
    pub fn stop_heartbeat_consumer(&mut self) {
        for token in self.heartbeat_subs.drain(..) {
            self.mux.unsubscribe(token);
        }
        self.heartbeat = None;
        self._driver = None;
    }
}
