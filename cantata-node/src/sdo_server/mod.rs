//! SDO server
//!
//! Split into the [`SdoReceiver`], which runs in the receive context and
//! captures requests (including the block-segment fast path), and the
//! [`SdoServer`] state machine, which is driven from `process`.

mod sdo_receiver;
#[allow(clippy::module_inception)]
mod sdo_server;

pub use sdo_receiver::{SdoReceiver, SDO_BUFFER_SIZE};
pub(crate) use sdo_receiver::ReceiverState;
pub use sdo_server::{SdoServer, ServerFrame};
