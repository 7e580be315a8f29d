//! Bus plumbing: frame multiplexer and bus manager

mod manager;
mod mux;

pub use manager::{BusManager, ChannelClosed, MuxReceiver, MuxSender, SdoClientGuard};
pub use mux::{FrameMux, SubscriptionToken};
