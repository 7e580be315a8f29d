#![cfg_attr(not(feature = "std"), no_std)]
//! Shared types for the cantata CANopen stack
//!
//! This crate holds everything that both sides of an SDO transfer need to
//! agree on: CAN message types, the SDO request/response codecs and abort
//! codes, the byte FIFO used by block transfers, and the object dictionary
//! access traits consumed by the SDO server.

mod atomic_cell;
pub use atomic_cell::AtomicCell;

pub mod constants;
pub mod fifo;
pub mod messages;
pub mod node_id;
pub mod objects;
pub mod sdo;
pub mod traits;

#[cfg(feature = "socketcan")]
mod socketcan;
#[cfg(feature = "socketcan")]
pub use socketcan::{open_socketcan, SocketCanReceiver, SocketCanSender};

pub use messages::{CanError, CanId, CanMessage};
pub use node_id::NodeId;
