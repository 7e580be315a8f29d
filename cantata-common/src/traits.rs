//! Transport traits
//!
//! The stack never talks to a socket or CAN controller directly; it goes
//! through these traits so that tests can substitute an in-memory bus.

use core::time::Duration;

use crate::messages::CanMessage;

/// A synchronous CAN sender
pub trait CanSender {
    /// Send a message to the bus
    ///
    /// On failure the message is handed back so the caller can retry it.
    fn send(&mut self, msg: CanMessage) -> Result<(), CanMessage>;
}

/// A synchronous CAN receiver
pub trait CanReceiver {
    /// The error type returned by recv
    type Error;

    /// Return a pending message immediately, or None
    fn try_recv(&mut self) -> Option<CanMessage>;

    /// A blocking receive with timeout
    fn recv(&mut self, timeout: Duration) -> Result<CanMessage, Self::Error>;
}

/// An async CAN sender
pub trait AsyncCanSender: Send {
    /// Send a message to the bus
    fn send(
        &mut self,
        msg: CanMessage,
    ) -> impl core::future::Future<Output = Result<(), CanMessage>>;
}

/// An async CAN receiver
pub trait AsyncCanReceiver: Send {
    /// The error type returned by recv
    type Error: core::fmt::Debug + Send;

    /// Return a pending message immediately, or None
    fn try_recv(&mut self) -> Option<CanMessage>;

    /// A blocking receive
    fn recv(
        &mut self,
    ) -> impl core::future::Future<Output = Result<CanMessage, Self::Error>> + Send;

    /// Remove any pending messages from the receiver
    fn flush(&mut self) {
        while self.try_recv().is_some() {}
    }
}
