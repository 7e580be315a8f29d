//! A simulated CAN bus
//!
//! Delivers every sent frame to all registered node mailboxes and to every
//! channel receiver. A mutation hook can be installed to corrupt frames in
//! flight, which the CRC tests use.

use std::fmt::Display;
use std::sync::{Arc, Mutex};

use cantata_common::messages::CanMessage;
use cantata_common::traits::{AsyncCanReceiver, AsyncCanSender};
use cantata_node::{Node, NodeMbox};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

type CorruptHook = Box<dyn FnMut(&mut CanMessage) + Send>;

#[derive(Default)]
struct Shared {
    mboxes: Vec<&'static NodeMbox>,
    channels: Vec<UnboundedSender<CanMessage>>,
    corrupt: Option<CorruptHook>,
}

impl Shared {
    fn deliver(&mut self, mut msg: CanMessage, skip_mbox: Option<usize>) {
        if let Some(corrupt) = &mut self.corrupt {
            corrupt(&mut msg);
        }
        for (i, mbox) in self.mboxes.iter().enumerate() {
            if skip_mbox == Some(i) {
                continue;
            }
            // A refused message just means no consumer on that node wanted
            // it
            mbox.store_message(msg).ok();
        }
        self.channels.retain(|ch| ch.send(msg).is_ok());
    }
}

/// The bus itself; create senders and receivers from it
pub struct SimBus {
    shared: Arc<Mutex<Shared>>,
}

impl SimBus {
    pub fn new(mboxes: Vec<&'static NodeMbox>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                mboxes,
                channels: Vec::new(),
                corrupt: None,
            })),
        }
    }

    /// Install a hook mutating every frame in flight
    pub fn set_corruption(&self, hook: CorruptHook) {
        self.shared.lock().unwrap().corrupt = Some(hook);
    }

    /// Remove the corruption hook
    pub fn clear_corruption(&self) {
        self.shared.lock().unwrap().corrupt = None;
    }

    pub fn new_receiver(&mut self) -> SimBusReceiver {
        let (tx, rx) = unbounded_channel();
        self.shared.lock().unwrap().channels.push(tx);
        SimBusReceiver { rx }
    }

    pub fn new_sender(&mut self) -> SimBusSender {
        SimBusSender {
            shared: self.shared.clone(),
        }
    }

    /// Tick every node once, delivering whatever they transmit
    pub fn process(&mut self, nodes: &mut [&mut Node], elapsed_us: u32) {
        let mut to_deliver = Vec::new();
        for (i, node) in nodes.iter_mut().enumerate() {
            node.process(elapsed_us, &mut |msg| {
                to_deliver.push((i, msg));
                Ok(())
            });
        }
        let mut shared = self.shared.lock().unwrap();
        for (sender_idx, msg) in to_deliver {
            shared.deliver(msg, Some(sender_idx));
        }
    }
}

#[derive(Clone)]
pub struct SimBusSender {
    shared: Arc<Mutex<Shared>>,
}

impl AsyncCanSender for SimBusSender {
    async fn send(&mut self, msg: CanMessage) -> Result<(), CanMessage> {
        self.shared.lock().unwrap().deliver(msg, None);
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SimBusReceiverError;

impl Display for SimBusReceiverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SimBusReceiverError")
    }
}

impl std::error::Error for SimBusReceiverError {}

pub struct SimBusReceiver {
    rx: UnboundedReceiver<CanMessage>,
}

impl AsyncCanReceiver for SimBusReceiver {
    type Error = SimBusReceiverError;

    fn try_recv(&mut self) -> Option<CanMessage> {
        self.rx.try_recv().ok()
    }

    async fn recv(&mut self) -> Result<CanMessage, SimBusReceiverError> {
        self.rx.recv().await.ok_or(SimBusReceiverError)
    }
}
