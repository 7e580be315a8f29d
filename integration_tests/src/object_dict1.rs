//! A static object dictionary for the test node

use cantata_common::objects::{ByteField, DataType, ODEntry, ScalarField, StringField, U32Array};
use cantata_node::NodeMbox;

/// Device type (0x1000), read-only
pub static DEVICE_TYPE: ScalarField<u32> = ScalarField::<u32>::new_ro(0x0000_0191);

/// Heartbeat producer time in ms (0x1017)
pub static HEARTBEAT_TIME: ScalarField<u16> = ScalarField::<u16>::new(0);

/// Heartbeat consumer table (0x1016)
pub static HB_CONSUMER: U32Array<4> = U32Array::new([0; 4]);

/// A plain read-write u32 value
pub static VALUE_U32: ScalarField<u32> = ScalarField::<u32>::new(0);

/// A read-write u16 value
pub static VALUE_U16: ScalarField<u16> = ScalarField::<u16>::new(0);

/// A variable-length entry large enough for every transfer-size scenario
pub static SCRATCH: StringField<70000> = StringField::new();

/// A fixed 78-byte record-ish blob
pub static BLOB: ByteField<78> = ByteField::new(DataType::OctetString, [0; 78]);

/// The node's object table, sorted by index
pub static OD_TABLE: &[ODEntry<'static>] = &[
    ODEntry {
        index: 0x1000,
        data: &DEVICE_TYPE,
    },
    ODEntry {
        index: 0x1016,
        data: &HB_CONSUMER,
    },
    ODEntry {
        index: 0x1017,
        data: &HEARTBEAT_TIME,
    },
    ODEntry {
        index: 0x3000,
        data: &SCRATCH,
    },
    ODEntry {
        index: 0x3001,
        data: &VALUE_U32,
    },
    ODEntry {
        index: 0x3002,
        data: &VALUE_U16,
    },
    ODEntry {
        index: 0x3003,
        data: &BLOB,
    },
];

/// The test node's mailbox
pub static NODE_MBOX: NodeMbox = NodeMbox::new();
