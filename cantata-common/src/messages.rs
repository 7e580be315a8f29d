//! CAN message and CANopen service message definitions

use snafu::Snafu;

use crate::constants::cob;

/// A CAN identifier, either standard (11-bit) or extended (29-bit)
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CanId {
    /// An extended 29-bit identifier
    Extended(u32),
    /// A standard 11-bit identifier
    Std(u16),
}

impl CanId {
    /// Create a new extended ID
    pub const fn extended(id: u32) -> CanId {
        CanId::Extended(id)
    }

    /// Create a new standard ID
    pub const fn std(id: u16) -> CanId {
        CanId::Std(id)
    }

    /// Get the raw ID as a u32
    pub fn raw(&self) -> u32 {
        match self {
            CanId::Extended(id) => *id,
            CanId::Std(id) => *id as u32,
        }
    }

    /// Returns true if this ID is an extended ID
    pub fn is_extended(&self) -> bool {
        matches!(self, CanId::Extended(_))
    }

    /// Check this ID against an acceptance filter
    ///
    /// Matches when `(id & mask) == filter`, the usual CAN controller filter
    /// convention. Extended and standard IDs never match each other.
    pub fn matches(&self, filter: CanId, mask: u32) -> bool {
        match (self, filter) {
            (CanId::Std(id), CanId::Std(f)) => (*id as u32 & mask) == f as u32 & mask,
            (CanId::Extended(id), CanId::Extended(f)) => (id & mask) == f & mask,
            _ => false,
        }
    }
}

const MAX_DATA_LENGTH: usize = 8;

/// A single CAN frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanMessage {
    /// The data payload. Only the first `dlc` bytes are meaningful.
    pub data: [u8; MAX_DATA_LENGTH],
    /// The length of the data payload
    pub dlc: u8,
    /// Indicates this message is a remote transmission request
    pub rtr: bool,
    /// The id of this message
    pub id: CanId,
}

impl Default for CanMessage {
    fn default() -> Self {
        Self {
            data: [0; MAX_DATA_LENGTH],
            dlc: 0,
            id: CanId::Std(0),
            rtr: false,
        }
    }
}

impl CanMessage {
    /// Create a new CAN message
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than 8 bytes.
    pub fn new(id: CanId, data: &[u8]) -> Self {
        assert!(
            data.len() <= MAX_DATA_LENGTH,
            "CAN payload exceeds {} bytes",
            MAX_DATA_LENGTH
        );
        let mut buf = [0u8; MAX_DATA_LENGTH];
        buf[0..data.len()].copy_from_slice(data);
        Self {
            id,
            dlc: data.len() as u8,
            data: buf,
            rtr: false,
        }
    }

    /// Create a new RTR message
    ///
    /// RTR messages have no data payload
    pub fn new_rtr(id: CanId) -> Self {
        Self {
            id,
            rtr: true,
            ..Default::default()
        }
    }

    /// Get the id of the message
    pub fn id(&self) -> CanId {
        self.id
    }

    /// Get a slice containing the data payload
    pub fn data(&self) -> &[u8] {
        &self.data[0..self.dlc as usize]
    }

    /// Returns true if this message is a remote transmission request
    pub fn is_rtr(&self) -> bool {
        self.rtr
    }
}

/// The error codes which can be delivered in a CAN error frame
#[derive(Clone, Copy, Debug, Snafu)]
#[repr(u8)]
pub enum CanError {
    /// The transmitter detected a different bus level than it was driving
    /// after arbitration completed
    Bit = 1,
    /// A receiver detected six consecutive bits of the same level, i.e. a
    /// bit stuffing violation
    Stuff = 2,
    /// A receiver detected a malformed frame
    Form = 3,
    /// The transmitter did not detect an ACK from any receiver
    Ack = 4,
    /// A receiver detected a CRC mismatch in a frame
    Crc = 5,
    /// Any other error bit pattern
    Other,
}

impl CanError {
    /// Create a CanError from the on-bus error code
    pub fn from_raw(value: u8) -> Self {
        match value {
            1 => CanError::Bit,
            2 => CanError::Stuff,
            3 => CanError::Form,
            4 => CanError::Ack,
            5 => CanError::Crc,
            _ => CanError::Other,
        }
    }
}

/// NMT state of a node, as advertised in its heartbeat message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum NmtState {
    /// Initial state after power-on or reset. A heartbeat carrying this
    /// value is the boot-up message.
    Bootup = 0,
    /// Node is stopped; only NMT and heartbeat are serviced
    Stopped = 4,
    /// Node is fully operational; PDOs are exchanged
    Operational = 5,
    /// Node is configured but PDO traffic is disabled
    PreOperational = 127,
}

impl TryFrom<u8> for NmtState {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(NmtState::Bootup),
            4 => Ok(NmtState::Stopped),
            5 => Ok(NmtState::Operational),
            127 => Ok(NmtState::PreOperational),
            other => Err(other),
        }
    }
}

impl core::fmt::Display for NmtState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            NmtState::Bootup => "Bootup",
            NmtState::Stopped => "Stopped",
            NmtState::Operational => "Operational",
            NmtState::PreOperational => "PreOperational",
        };
        write!(f, "{}", s)
    }
}

/// A heartbeat message
///
/// Produced periodically by every node at `0x700 + node_id` with a single
/// payload byte carrying the producer's NMT state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Heartbeat {
    /// The producing node's id
    pub node: u8,
    /// The producer's NMT state
    pub state: NmtState,
}

impl Heartbeat {
    /// Build the CAN message for this heartbeat
    pub fn to_can_message(&self) -> CanMessage {
        CanMessage::new(
            CanId::std(cob::HEARTBEAT_BASE + self.node as u16),
            &[self.state as u8],
        )
    }
}

impl TryFrom<CanMessage> for Heartbeat {
    type Error = ();

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let raw = match msg.id {
            CanId::Std(id) => id,
            CanId::Extended(_) => return Err(()),
        };
        if !(cob::HEARTBEAT_BASE + 1..=cob::HEARTBEAT_BASE + 127).contains(&raw) {
            return Err(());
        }
        // Heartbeats always carry exactly one byte
        if msg.dlc != 1 {
            return Err(());
        }
        let state = NmtState::try_from(msg.data[0]).map_err(|_| ())?;
        Ok(Heartbeat {
            node: (raw - cob::HEARTBEAT_BASE) as u8,
            state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_filter_match() {
        let id = CanId::std(0x581);
        assert!(id.matches(CanId::std(0x581), 0x7FF));
        assert!(!id.matches(CanId::std(0x582), 0x7FF));
        // Mask selects the function code only
        assert!(id.matches(CanId::std(0x580), 0x780));
        assert!(!id.matches(CanId::extended(0x581), 0x7FF));
    }

    #[test]
    fn test_heartbeat_round_trip() {
        let hb = Heartbeat {
            node: 0x25,
            state: NmtState::Operational,
        };
        let msg = hb.to_can_message();
        assert_eq!(msg.id, CanId::std(0x725));
        assert_eq!(msg.data(), &[5]);
        assert_eq!(Heartbeat::try_from(msg).unwrap(), hb);
    }

    #[test]
    fn test_heartbeat_rejects_bad_dlc() {
        let msg = CanMessage::new(CanId::std(0x725), &[5, 0]);
        assert!(Heartbeat::try_from(msg).is_err());
    }
}
