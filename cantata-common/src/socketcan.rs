//! SocketCAN transport adapters
//!
//! Bridges the [`AsyncCanSender`]/[`AsyncCanReceiver`] traits onto a Linux
//! SocketCAN interface.

use std::sync::Arc;

use crate::{
    messages::{CanError, CanId, CanMessage},
    traits::{AsyncCanReceiver, AsyncCanSender},
};
use snafu::{ResultExt, Snafu};

use socketcan::{tokio::CanSocket, CanFilter, CanFrame, EmbeddedFrame, Frame, SocketOptions};

fn from_socketcan_id(id: socketcan::CanId) -> CanId {
    match id {
        socketcan::CanId::Standard(id) => CanId::std(id.as_raw()),
        socketcan::CanId::Extended(id) => CanId::extended(id.as_raw()),
    }
}

fn to_socketcan_id(id: CanId) -> socketcan::CanId {
    match id {
        // Unwrap safety: CanId variants are range-checked at construction
        CanId::Extended(id) => socketcan::ExtendedId::new(id).unwrap().into(),
        CanId::Std(id) => socketcan::StandardId::new(id).unwrap().into(),
    }
}

fn from_socketcan_frame(frame: CanFrame) -> Result<CanMessage, CanError> {
    let id = from_socketcan_id(frame.can_id());
    match frame {
        CanFrame::Data(frame) => Ok(CanMessage::new(id, frame.data())),
        CanFrame::Remote(_) => Ok(CanMessage::new_rtr(id)),
        CanFrame::Error(frame) => Err(CanError::from_raw(frame.error_bits() as u8)),
    }
}

fn to_socketcan_frame(msg: CanMessage) -> CanFrame {
    let id = to_socketcan_id(msg.id());
    // Unwrap safety: CanMessage payloads are at most 8 bytes
    if msg.is_rtr() {
        CanFrame::new_remote(id, 0).unwrap()
    } else {
        CanFrame::new(id, msg.data()).unwrap()
    }
}

/// Error returned by [`SocketCanReceiver::recv`]
#[derive(Debug, Snafu)]
pub enum ReceiveError {
    /// The underlying socket read failed
    Io {
        /// The socket error
        source: std::io::Error,
    },
    /// The bus delivered an error frame
    Can {
        /// The decoded bus error
        source: CanError,
    },
}

/// Receiving half of a SocketCAN connection
#[derive(Debug, Clone)]
pub struct SocketCanReceiver {
    socket: Arc<CanSocket>,
}

impl AsyncCanReceiver for SocketCanReceiver {
    type Error = ReceiveError;

    fn try_recv(&mut self) -> Option<CanMessage> {
        // The async socket has no non-blocking read; callers poll recv()
        None
    }

    async fn recv(&mut self) -> Result<CanMessage, ReceiveError> {
        loop {
            match self.socket.read_frame().await {
                Ok(frame) => return from_socketcan_frame(frame).context(CanSnafu),
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::WouldBlock {
                        return Err(ReceiveError::Io { source: e });
                    }
                }
            }
        }
    }
}

/// Sending half of a SocketCAN connection
#[derive(Debug, Clone)]
pub struct SocketCanSender {
    socket: Arc<CanSocket>,
}

impl AsyncCanSender for SocketCanSender {
    async fn send(&mut self, msg: CanMessage) -> Result<(), CanMessage> {
        let frame = to_socketcan_frame(msg);
        self.socket.write_frame(frame).await.map_err(|_| msg)
    }
}

/// Open a SocketCAN device, returning a sender/receiver pair
///
/// When `filters` is given, the kernel-side acceptance filters are installed
/// before the socket is handed out.
pub fn open_socketcan(
    device: &str,
    filters: Option<&[CanFilter]>,
) -> Result<(SocketCanSender, SocketCanReceiver), std::io::Error> {
    let socket = CanSocket::open(device)?;
    if let Some(filters) = filters {
        socket.set_filters(filters)?;
    }
    let socket = Arc::new(socket);
    Ok((
        SocketCanSender {
            socket: socket.clone(),
        },
        SocketCanReceiver { socket },
    ))
}
