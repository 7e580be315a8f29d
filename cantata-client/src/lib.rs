//! The master side of the cantata CANopen stack
//!
//! The crate provides:
//!
//! - A tick-driven [SDO engine](SdoClientEngine): the single-transfer state
//!   machine for expedited, segmented, and block transfers. Frames are fed
//!   in through `on_frame`, and `process` is called with elapsed time to
//!   advance the protocol and emit requests.
//! - An async [SDO client](SdoClient) wrapping the engine with a convenient
//!   read/write API and typed accessors.
//! - A [heartbeat consumer](HeartbeatConsumer) watching remote nodes'
//!   heartbeats and raising emergencies into an application sink.
//! - A [frame multiplexer](FrameMux) dispatching received frames to
//!   subscribers by identifier filter, and a [BusManager] tying the pieces
//!   together behind a per-node client checkout.
//!
//! Engines never read a clock; all timing is injected as elapsed
//! microseconds, which keeps every state machine deterministic under test.
#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations
)]

mod bus;
pub mod driver;
pub mod heartbeat;
mod sdo_client;
mod sdo_engine;

pub use cantata_common as common;

pub use bus::{
    BusManager, ChannelClosed, FrameMux, MuxReceiver, MuxSender, SdoClientGuard,
    SubscriptionToken,
};
pub use driver::{Process, ProcessDriver};
pub use heartbeat::{
    EmergencySink, HbState, HeartbeatConfigError, HeartbeatConsumer, HeartbeatEvent,
    MonitoredNode,
};
pub use sdo_client::{RawAbortCode, SdoClient, SdoClientError};
pub use sdo_engine::{
    SdoClientEngine, SdoEngineConfig, TransferError, TransferStatus, BLOCK_FIFO_SIZE,
};
