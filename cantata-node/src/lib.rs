#![cfg_attr(not(feature = "std"), no_std)]
//! The node side of the cantata CANopen stack
//!
//! Provides the [`Node`] object, which answers SDO requests against a local
//! object dictionary and produces heartbeats. Incoming frames are handed to
//! the static [`NodeMbox`] from the receive context; the application calls
//! [`Node::process`] periodically with the elapsed time to drive the state
//! machines and emit outbound frames.

pub mod node;
pub mod node_mbox;
pub mod sdo_server;

pub use node::Node;
pub use node_mbox::NodeMbox;
pub use sdo_server::SDO_BUFFER_SIZE;

// Re-export so applications need only depend on this crate
pub use cantata_common as common;
