//! Frame multiplexer
//!
//! One process talks to the bus through a single socket, but many
//! components want to see frames: SDO engines, the heartbeat consumer, and
//! whatever else the application wires up. The [`FrameMux`] owns the
//! transmit half behind a lock and fans incoming frames out to subscribers
//! matched by an acceptance filter, the same `(id & mask) == filter`
//! convention CAN controllers use.
//!
//! Handlers run on the dispatch task and must not send on the bus (that
//! is what `process` is for); they should only capture the frame and
//! return.

use std::sync::{Arc, Mutex};

use cantata_common::{
    messages::{CanId, CanMessage},
    traits::{AsyncCanReceiver, AsyncCanSender},
};
use tokio::task::JoinHandle;

/// Identifies a subscription for later removal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriptionToken(u64);

type Handler = Box<dyn Fn(&CanMessage) + Send + Sync>;

struct Subscription {
    token: u64,
    filter: CanId,
    mask: u32,
    handler: Handler,
}

#[derive(Default)]
struct MuxInner {
    subscriptions: Vec<Subscription>,
    next_token: u64,
}

/// Dispatches received frames to subscribers and serializes transmission
pub struct FrameMux<S> {
    inner: Arc<Mutex<MuxInner>>,
    sender: Arc<tokio::sync::Mutex<S>>,
    _pump: Option<Arc<JoinHandle<()>>>,
}

impl<S> Clone for FrameMux<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            sender: self.sender.clone(),
            _pump: self._pump.clone(),
        }
    }
}

impl<S> std::fmt::Debug for FrameMux<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameMux").finish_non_exhaustive()
    }
}

impl<S: AsyncCanSender> FrameMux<S> {
    /// Create a multiplexer over a transmit half only
    ///
    /// Frames must then be delivered by calling
    /// [`dispatch`](Self::dispatch), e.g. from a test bus.
    pub fn new(sender: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MuxInner::default())),
            sender: Arc::new(tokio::sync::Mutex::new(sender)),
            _pump: None,
        }
    }

    /// Create a multiplexer and spawn a dispatch task draining `receiver`
    pub fn with_receiver<R>(sender: S, mut receiver: R) -> Self
    where
        R: AsyncCanReceiver + 'static,
    {
        let mut mux = Self::new(sender);
        let inner = mux.inner.clone();
        let pump = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(msg) => dispatch_to(&inner, &msg),
                    Err(e) => {
                        log::error!("Bus receive failed: {e:?}");
                    }
                }
            }
        });
        mux._pump = Some(Arc::new(pump));
        mux
    }

    /// Install a filter: `handler` runs for every received frame whose
    /// identifier satisfies `(id & mask) == filter`
    ///
    /// Several subscriptions may match one frame; each matching handler
    /// runs, in subscription order.
    pub fn subscribe(
        &self,
        filter: CanId,
        mask: u32,
        handler: impl Fn(&CanMessage) + Send + Sync + 'static,
    ) -> SubscriptionToken {
        let mut inner = self.inner.lock().unwrap();
        inner.next_token += 1;
        let token = inner.next_token;
        inner.subscriptions.push(Subscription {
            token,
            filter,
            mask,
            handler: Box::new(handler),
        });
        SubscriptionToken(token)
    }

    /// Remove a previously installed filter
    pub fn unsubscribe(&self, token: SubscriptionToken) {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .retain(|s| s.token != token.0);
    }

    /// Deliver a received frame to all matching subscribers
    pub fn dispatch(&self, msg: &CanMessage) {
        dispatch_to(&self.inner, msg);
    }

    /// Transmit a frame, serialized against other senders
    pub async fn send(&self, msg: CanMessage) -> Result<(), CanMessage> {
        self.sender.lock().await.send(msg).await
    }
}

fn dispatch_to(inner: &Mutex<MuxInner>, msg: &CanMessage) {
    // Handlers only stash the frame, so running them under the lock keeps
    // subscribe/unsubscribe simple without stalling the dispatch task
    let inner = inner.lock().unwrap();
    for sub in &inner.subscriptions {
        if msg.id().matches(sub.filter, sub.mask) {
            (sub.handler)(msg);
        }
    }
}
