//! Async SDO client
//!
//! [`SdoClient`] owns an [`SdoClientEngine`] and drives it to completion:
//! it feeds received frames into the engine, forwards the engine's request
//! frames to the bus, and sleeps a tick between `process` calls. The engine
//! stays clockless; this wrapper is where wall time is measured.

use std::time::{Duration, Instant};

use snafu::Snafu;

use cantata_common::{
    constants::cob,
    sdo::AbortCode,
    traits::{AsyncCanReceiver, AsyncCanSender},
};

use crate::sdo_engine::{SdoClientEngine, SdoEngineConfig, TransferError, TransferStatus};

/// Driving tick between engine process calls
const PROCESS_TICK: Duration = Duration::from_millis(1);

/// An abort code as found on the wire
///
/// Peers may send codes this library does not know; those are preserved
/// rather than dropped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawAbortCode {
    /// A recognized abort code
    Valid(AbortCode),
    /// An unrecognized abort code
    Unknown(u32),
}

impl std::fmt::Display for RawAbortCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawAbortCode::Valid(abort_code) => write!(f, "{abort_code:?}"),
            RawAbortCode::Unknown(code) => write!(f, "{code:X}"),
        }
    }
}

impl From<u32> for RawAbortCode {
    fn from(value: u32) -> Self {
        match AbortCode::try_from(value) {
            Ok(code) => Self::Valid(code),
            Err(_) => Self::Unknown(value),
        }
    }
}

/// Error returned by [`SdoClient`] methods
#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum SdoClientError {
    /// The server did not answer before the transfer timeout
    NoResponse,
    /// The transfer could not be started
    #[snafu(display("Transfer setup failed: {source}"))]
    TransferSetup {
        /// The engine-level reason
        source: TransferError,
    },
    /// The server aborted the transfer
    #[snafu(display("Received abort accessing object {index:#06x}sub{sub}: {abort_code}"))]
    ServerAbort {
        /// Index of the aborted access
        index: u16,
        /// Sub index of the aborted access
        sub: u8,
        /// Reason for the abort
        abort_code: RawAbortCode,
    },
    /// This side aborted the transfer (protocol violation by the server)
    #[snafu(display("Aborted transfer of object {index:#06x}sub{sub}: {abort_code:?}"))]
    ClientAbort {
        /// Index of the aborted access
        index: u16,
        /// Sub index of the aborted access
        sub: u8,
        /// The abort reason sent
        abort_code: AbortCode,
    },
    /// Failed to write a message to the bus
    SendFailed,
    /// A typed read returned a different size than the type requires
    UnexpectedSize,
    /// The configured server is this node itself; use local OD access
    /// instead of SDO
    LocalNode,
}

type Result<T> = std::result::Result<T, SdoClientError>;

/// A client for accessing one node's SDO server
///
/// A single server talks to a single client at a time; hold one `SdoClient`
/// per server channel.
#[derive(Debug)]
pub struct SdoClient<S, R> {
    engine: SdoClientEngine,
    sender: S,
    receiver: R,
    target: (u16, u8),
}

impl<S: AsyncCanSender, R: AsyncCanReceiver> SdoClient<S, R> {
    /// Create a client for a node's default SDO server
    ///
    /// The default channel uses `0x600 + node_id` for requests and
    /// `0x580 + node_id` for responses.
    pub fn new_std(server_node_id: u8, sender: S, receiver: R) -> Self {
        Self::new(
            (cob::SDO_RX_BASE + server_node_id as u16) as u32,
            (cob::SDO_TX_BASE + server_node_id as u16) as u32,
            server_node_id,
            sender,
            receiver,
        )
    }

    /// Create a client from raw COB-ID parameter values
    ///
    /// `cob_c2s`/`cob_s2c` follow the 0x1280 record convention: bit 31 set
    /// marks the channel invalid.
    pub fn new(cob_c2s: u32, cob_s2c: u32, server_node_id: u8, sender: S, receiver: R) -> Self {
        let engine = SdoClientEngine::with_config(SdoEngineConfig::default());
        engine.setup_server(cob_c2s, cob_s2c, server_node_id);
        Self {
            engine,
            sender,
            receiver,
            target: (0, 0),
        }
    }

    /// Write data to a sub-object on the SDO server
    ///
    /// Small values go expedited, larger ones segmented.
    pub async fn download(&mut self, index: u16, sub: u8, data: &[u8]) -> Result<()> {
        self.target = (index, sub);
        self.engine
            .begin_download(index, sub, data.len(), false)
            .map_err(|source| SdoClientError::TransferSetup { source })?;
        self.run_transfer(Some(data)).await?;
        Ok(())
    }

    /// Write data using the block transfer protocol
    ///
    /// More efficient for large amounts of data, but not supported by all
    /// devices.
    pub async fn block_download(&mut self, index: u16, sub: u8, data: &[u8]) -> Result<()> {
        self.target = (index, sub);
        self.engine
            .begin_download(index, sub, data.len(), true)
            .map_err(|source| SdoClientError::TransferSetup { source })?;
        self.run_transfer(Some(data)).await?;
        Ok(())
    }

    /// Read a sub-object from the SDO server
    pub async fn upload(&mut self, index: u16, sub: u8) -> Result<Vec<u8>> {
        self.target = (index, sub);
        self.engine
            .begin_upload(index, sub, false)
            .map_err(|source| SdoClientError::TransferSetup { source })?;
        self.run_transfer(None).await
    }

    /// Read a sub-object using the block transfer protocol
    ///
    /// The server may still downgrade small values to a plain upload.
    pub async fn block_upload(&mut self, index: u16, sub: u8) -> Result<Vec<u8>> {
        self.target = (index, sub);
        self.engine
            .begin_upload(index, sub, true)
            .map_err(|source| SdoClientError::TransferSetup { source })?;
        self.run_transfer(None).await
    }

    /// Drive the engine until the transfer reaches a terminal state
    async fn run_transfer(&mut self, payload: Option<&[u8]>) -> Result<Vec<u8>> {
        let (index, sub) = self.target;
        let mut pushed = 0;
        let mut collected = Vec::new();
        let mut last = Instant::now();

        loop {
            // Feed anything already waiting on the receiver
            while let Some(msg) = self.receiver.try_recv() {
                self.engine.on_frame(&msg);
            }

            // Keep the download FIFO topped up
            if let Some(payload) = payload {
                if pushed < payload.len() {
                    pushed += self.engine.push_data(&payload[pushed..]);
                }
                if pushed == payload.len() {
                    self.engine.push_finished();
                }
            }

            let now = Instant::now();
            let elapsed_us = now.duration_since(last).as_micros().min(u32::MAX as u128) as u32;
            last = now;

            let mut out = Vec::new();
            let status = self.engine.process(elapsed_us, false, None, &mut |msg| {
                out.push(msg);
                Ok(())
            });
            for msg in out {
                self.sender
                    .send(msg)
                    .await
                    .map_err(|_| SdoClientError::SendFailed)?;
            }

            // Drain uploaded bytes so the engine never stalls on a full
            // FIFO
            let mut buf = [0u8; 256];
            loop {
                let n = self.engine.pull_data(&mut buf);
                if n == 0 {
                    break;
                }
                collected.extend_from_slice(&buf[..n]);
            }

            match status {
                TransferStatus::Success => return Ok(collected),
                TransferStatus::AbortedByServer { code } => {
                    return ServerAbortSnafu {
                        index,
                        sub,
                        abort_code: RawAbortCode::from(code),
                    }
                    .fail()
                }
                TransferStatus::AbortedByClient {
                    code: AbortCode::SdoTimeout,
                } => return NoResponseSnafu.fail(),
                TransferStatus::AbortedByClient { code } => {
                    return ClientAbortSnafu {
                        index,
                        sub,
                        abort_code: code,
                    }
                    .fail()
                }
                TransferStatus::WaitingLocalTransfer => return LocalNodeSnafu.fail(),
                TransferStatus::Idle => return NoResponseSnafu.fail(),
                TransferStatus::WaitingResponse
                | TransferStatus::BlockDownloadInProgress
                | TransferStatus::BlockUploadInProgress
                | TransferStatus::UploadDataFull => {}
            }

            // Wait for the next frame, or a tick to re-run timers
            match tokio::time::timeout(PROCESS_TICK, self.receiver.recv()).await {
                Ok(Ok(msg)) => self.engine.on_frame(&msg),
                Ok(Err(e)) => {
                    log::error!("Error reading from bus: {e:?}");
                    return NoResponseSnafu.fail();
                }
                Err(_) => {}
            }
        }
    }

    /// Write a u8 value
    pub async fn write_u8(&mut self, index: u16, sub: u8, value: u8) -> Result<()> {
        self.download(index, sub, &value.to_le_bytes()).await
    }

    /// Write a u16 value
    pub async fn write_u16(&mut self, index: u16, sub: u8, value: u16) -> Result<()> {
        self.download(index, sub, &value.to_le_bytes()).await
    }

    /// Write a u32 value
    pub async fn write_u32(&mut self, index: u16, sub: u8, value: u32) -> Result<()> {
        self.download(index, sub, &value.to_le_bytes()).await
    }

    /// Write an i32 value
    pub async fn write_i32(&mut self, index: u16, sub: u8, value: i32) -> Result<()> {
        self.download(index, sub, &value.to_le_bytes()).await
    }

    /// Read a sub-object, expecting a u8
    pub async fn read_u8(&mut self, index: u16, sub: u8) -> Result<u8> {
        let data = self.upload(index, sub).await?;
        if data.len() != 1 {
            return UnexpectedSizeSnafu.fail();
        }
        Ok(data[0])
    }

    /// Read a sub-object, expecting a u16
    pub async fn read_u16(&mut self, index: u16, sub: u8) -> Result<u16> {
        let data = self.upload(index, sub).await?;
        data.try_into()
            .map(u16::from_le_bytes)
            .map_err(|_| UnexpectedSizeSnafu.build())
    }

    /// Read a sub-object, expecting a u32
    pub async fn read_u32(&mut self, index: u16, sub: u8) -> Result<u32> {
        let data = self.upload(index, sub).await?;
        data.try_into()
            .map(u32::from_le_bytes)
            .map_err(|_| UnexpectedSizeSnafu.build())
    }

    /// Read a sub-object, expecting an i32
    pub async fn read_i32(&mut self, index: u16, sub: u8) -> Result<i32> {
        let data = self.upload(index, sub).await?;
        data.try_into()
            .map(i32::from_le_bytes)
            .map_err(|_| UnexpectedSizeSnafu.build())
    }

    /// Read a sub-object as UTF-8 text
    ///
    /// Invalid sequences are replaced rather than failing the read.
    pub async fn read_utf8(&mut self, index: u16, sub: u8) -> Result<String> {
        let data = self.upload(index, sub).await?;
        Ok(String::from_utf8_lossy(&data).into())
    }
}
