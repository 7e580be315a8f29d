//! Protocol constants: COB-ID bases and standard object indices

/// COB-ID base values for the pre-defined connection set
pub mod cob {
    /// NMT command broadcast id
    pub const NMT_CMD: u16 = 0x000;
    /// SYNC broadcast id
    pub const SYNC: u16 = 0x080;
    /// Emergency messages: `EMCY_BASE + node_id`
    pub const EMCY_BASE: u16 = 0x080;
    /// SDO server-to-client responses: `SDO_TX_BASE + node_id`
    pub const SDO_TX_BASE: u16 = 0x580;
    /// SDO client-to-server requests: `SDO_RX_BASE + node_id`
    pub const SDO_RX_BASE: u16 = 0x600;
    /// Heartbeat messages: `HEARTBEAT_BASE + node_id`
    pub const HEARTBEAT_BASE: u16 = 0x700;
}

/// Object indices for standard objects
pub mod object_ids {
    /// The device name object index
    pub const DEVICE_NAME: u16 = 0x1008;
    /// The heartbeat consumer table index
    ///
    /// Each sub-index 1..N holds `(node_id << 16) | period_ms`.
    pub const HEARTBEAT_CONSUMER: u16 = 0x1016;
    /// The heartbeat producer time object index (period in ms)
    pub const HEARTBEAT_PRODUCER_TIME: u16 = 0x1017;
    /// First SDO server parameter record
    pub const SDO_SERVER_PARAMS: u16 = 0x1200;
    /// First SDO client parameter record
    pub const SDO_CLIENT_PARAMS: u16 = 0x1280;
}

/// Bit 31 of a stored COB-ID value marks the channel as invalid
pub const COB_ID_INVALID_FLAG: u32 = 1 << 31;

/// Mask selecting the 11-bit identifier from a stored COB-ID value
pub const COB_ID_MASK: u32 = 0x7FF;
