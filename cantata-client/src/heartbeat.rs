//! Heartbeat consumer
//!
//! Watches the heartbeat messages of a configured set of remote nodes and
//! raises emergencies into an application-supplied sink when a node resets
//! or goes silent. Like the SDO engines, the consumer is fed frames by the
//! bus dispatcher through [`on_frame`](HeartbeatConsumer::on_frame) and
//! driven by periodic [`process`](HeartbeatConsumer::process) calls with
//! injected elapsed time.

use std::sync::Mutex;

use cantata_common::{
    constants::{cob, object_ids},
    messages::{CanId, CanMessage, NmtState},
    objects::{find_object, ODEntry, ObjectAccess as _},
};
use snafu::Snafu;

/// Monitoring state of one consumer entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HbState {
    /// The table slot has no node or a zero period configured
    Unconfigured,
    /// Waiting for the first heartbeat (or re-synchronizing after a reset)
    Unknown,
    /// Heartbeats are arriving within the limit
    Active,
    /// The node went silent past its limit
    Timeout,
}

/// An emergency raised by the consumer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// A monitored node re-announced boot-up after having been active
    RemoteReset {
        /// The node which reset
        node_id: u8,
    },
    /// A monitored node's heartbeat stopped arriving
    Timeout {
        /// The node which went silent
        node_id: u8,
    },
}

/// Receives consumer emergencies
///
/// Implementations forward into the EMCY producer or application alarm
/// handling. Calls are made from inside `process` with the consumer lock
/// held, so implementations must not call back into the consumer.
pub trait EmergencySink: Send + Sync {
    /// An emergency condition was detected
    fn raise(&self, event: HeartbeatEvent);
    /// Every monitored node is active again; previously raised heartbeat
    /// emergencies can be cleared
    fn clear_heartbeat_errors(&self);
}

/// Configuration of one monitored node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonitoredNode {
    /// The node to watch
    pub node_id: u8,
    /// Consumer heartbeat time in milliseconds; 0 disables the entry
    pub period_ms: u16,
}

impl MonitoredNode {
    /// Decode a 0x1016 table value: `(node_id << 16) | period_ms`
    pub fn from_od_value(raw: u32) -> MonitoredNode {
        MonitoredNode {
            node_id: ((raw >> 16) & 0x7F) as u8,
            period_ms: (raw & 0xFFFF) as u16,
        }
    }

    fn is_configured(&self) -> bool {
        self.node_id != 0 && self.period_ms != 0
    }
}

/// Error returned for an invalid monitor table
#[derive(Clone, Copy, Debug, PartialEq, Snafu)]
pub enum HeartbeatConfigError {
    /// Two active entries monitor the same node
    #[snafu(display("node {node_id} is already monitored"))]
    DuplicateNodeId {
        /// The node configured twice
        node_id: u8,
    },
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    node_id: u8,
    cob_id: u16,
    timeout_limit_us: u32,
    nmt_state: Option<NmtState>,
    hb_state: HbState,
    timer_us: u32,
    rx_new: bool,
    rx_state: u8,
}

impl Entry {
    fn new(monitor: MonitoredNode) -> Self {
        Self {
            node_id: monitor.node_id,
            cob_id: cob::HEARTBEAT_BASE + monitor.node_id as u16,
            timeout_limit_us: monitor.period_ms as u32 * 1000,
            nmt_state: None,
            hb_state: if monitor.is_configured() {
                HbState::Unknown
            } else {
                HbState::Unconfigured
            },
            timer_us: 0,
            rx_new: false,
            rx_state: 0,
        }
    }
}

struct ConsumerState {
    entries: Vec<Entry>,
    nmt_active_prev: bool,
    all_active: bool,
}

/// Per-node heartbeat timeout watchdog
///
/// The monitored set is fixed at construction (usually from the 0x1016
/// table); no two active entries may watch the same node.
pub struct HeartbeatConsumer {
    inner: Mutex<ConsumerState>,
    sink: Box<dyn EmergencySink>,
}

impl std::fmt::Debug for HeartbeatConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatConsumer").finish_non_exhaustive()
    }
}

impl HeartbeatConsumer {
    /// Create a consumer for the given monitor table
    pub fn new(
        monitors: &[MonitoredNode],
        sink: Box<dyn EmergencySink>,
    ) -> Result<Self, HeartbeatConfigError> {
        let consumer = Self {
            inner: Mutex::new(ConsumerState {
                entries: Vec::new(),
                nmt_active_prev: false,
                all_active: false,
            }),
            sink,
        };
        for monitor in monitors {
            consumer.check_duplicate(*monitor)?;
            consumer
                .inner
                .lock()
                .unwrap()
                .entries
                .push(Entry::new(*monitor));
        }
        Ok(consumer)
    }

    /// Create a consumer from the 0x1016 table of an object dictionary
    ///
    /// Absence of the object yields an empty (but valid) consumer.
    pub fn from_od(
        od: &[ODEntry],
        sink: Box<dyn EmergencySink>,
    ) -> Result<Self, HeartbeatConfigError> {
        let mut monitors = Vec::new();
        if let Some(table) = find_object(od, object_ids::HEARTBEAT_CONSUMER) {
            if let Ok(count) = table.read_u8(0) {
                for sub in 1..=count {
                    if let Ok(raw) = table.read_u32(sub) {
                        monitors.push(MonitoredNode::from_od_value(raw));
                    }
                }
            }
        }
        Self::new(&monitors, sink)
    }

    /// Add one monitor entry
    ///
    /// Fails when the node is already actively monitored; the bus filter
    /// for the new entry must then not be installed.
    pub fn add(&self, monitor: MonitoredNode) -> Result<(), HeartbeatConfigError> {
        self.check_duplicate(monitor)?;
        self.inner.lock().unwrap().entries.push(Entry::new(monitor));
        Ok(())
    }

    fn check_duplicate(&self, monitor: MonitoredNode) -> Result<(), HeartbeatConfigError> {
        if !monitor.is_configured() {
            return Ok(());
        }
        let state = self.inner.lock().unwrap();
        if state
            .entries
            .iter()
            .any(|e| e.hb_state != HbState::Unconfigured && e.node_id == monitor.node_id)
        {
            return DuplicateNodeIdSnafu {
                node_id: monitor.node_id,
            }
            .fail();
        }
        Ok(())
    }

    /// The CAN identifiers this consumer wants to receive
    pub fn cob_ids(&self) -> Vec<u16> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|e| e.hb_state != HbState::Unconfigured)
            .map(|e| e.cob_id)
            .collect()
    }

    /// Frame intake, called from the bus dispatcher
    ///
    /// Only 1-byte frames on a monitored heartbeat identifier are
    /// accepted.
    pub fn on_frame(&self, msg: &CanMessage) {
        if msg.dlc != 1 || msg.is_rtr() {
            return;
        }
        let raw_id = match msg.id() {
            CanId::Std(id) => id,
            CanId::Extended(_) => return,
        };
        let mut state = self.inner.lock().unwrap();
        if let Some(entry) = state
            .entries
            .iter_mut()
            .find(|e| e.hb_state != HbState::Unconfigured && e.cob_id == raw_id)
        {
            entry.rx_state = msg.data[0];
            entry.rx_new = true;
        }
    }

    /// Advance the watchdogs
    ///
    /// # Arguments
    /// - `nmt_is_pre_or_operational`: whether the local node is in a state
    ///   where heartbeat consumption is meaningful; monitoring pauses (and
    ///   re-synchronizes) while this is false
    /// - `elapsed_us`: microseconds since the previous call
    /// - `next_wake_us`: optional scheduling hint, shrunk to the nearest
    ///   entry deadline
    pub fn process(
        &self,
        nmt_is_pre_or_operational: bool,
        elapsed_us: u32,
        mut next_wake_us: Option<&mut u32>,
    ) {
        let mut state = self.inner.lock().unwrap();
        let state = &mut *state;

        if nmt_is_pre_or_operational && state.nmt_active_prev {
            for entry in &mut state.entries {
                if entry.hb_state == HbState::Unconfigured {
                    continue;
                }

                let mut entry_elapsed = elapsed_us;
                if entry.rx_new {
                    entry.rx_new = false;
                    let received = NmtState::try_from(entry.rx_state).ok();
                    if received == Some(NmtState::Bootup) && entry.hb_state == HbState::Active {
                        // The node rebooted behind our back
                        self.sink.raise(HeartbeatEvent::RemoteReset {
                            node_id: entry.node_id,
                        });
                        entry.hb_state = HbState::Unknown;
                    } else {
                        entry.hb_state = HbState::Active;
                    }
                    entry.nmt_state = received;
                    entry.timer_us = 0;
                    entry_elapsed = 0;
                }

                if entry.hb_state == HbState::Active {
                    entry.timer_us = entry.timer_us.saturating_add(entry_elapsed);
                    if entry.timer_us >= entry.timeout_limit_us {
                        self.sink.raise(HeartbeatEvent::Timeout {
                            node_id: entry.node_id,
                        });
                        entry.nmt_state = None;
                        entry.hb_state = HbState::Timeout;
                    } else if let Some(next_wake_us) = next_wake_us.as_deref_mut() {
                        *next_wake_us =
                            (*next_wake_us).min(entry.timeout_limit_us - entry.timer_us);
                    }
                }
            }
        } else if nmt_is_pre_or_operational != state.nmt_active_prev {
            // Entering or leaving the consuming states drops all knowledge
            // of the remote nodes
            for entry in &mut state.entries {
                if entry.hb_state != HbState::Unconfigured {
                    entry.nmt_state = None;
                    entry.hb_state = HbState::Unknown;
                    entry.timer_us = 0;
                }
            }
        }
        state.nmt_active_prev = nmt_is_pre_or_operational;

        let all_active = state
            .entries
            .iter()
            .filter(|e| e.hb_state != HbState::Unconfigured)
            .all(|e| e.hb_state == HbState::Active);
        if all_active && !state.all_active {
            self.sink.clear_heartbeat_errors();
        }
        state.all_active = all_active;
    }

    /// Monitoring state of a node
    pub fn hb_state(&self, node_id: u8) -> Option<HbState> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .find(|e| e.node_id == node_id)
            .map(|e| e.hb_state)
    }

    /// Last reported NMT state of a node
    pub fn nmt_state(&self, node_id: u8) -> Option<NmtState> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .find(|e| e.node_id == node_id)
            .and_then(|e| e.nmt_state)
    }

    /// True while every configured entry is receiving heartbeats
    pub fn all_active(&self) -> bool {
        self.inner.lock().unwrap().all_active
    }

    /// True when every active entry reports NMT operational
    pub fn all_operational(&self) -> bool {
        let state = self.inner.lock().unwrap();
        state
            .entries
            .iter()
            .filter(|e| e.hb_state != HbState::Unconfigured)
            .all(|e| e.nmt_state == Some(NmtState::Operational))
    }
}
