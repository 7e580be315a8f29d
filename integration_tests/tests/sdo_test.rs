use cantata_client::{RawAbortCode, SdoClient, SdoClientError};
use cantata_common::messages::CanId;
use cantata_common::sdo::AbortCode;
use cantata_common::traits::AsyncCanReceiver;
use cantata_common::NodeId;
use cantata_node::Node;
use integration_tests::object_dict1 as od;
use integration_tests::sim_bus::{SimBus, SimBusReceiver, SimBusSender};

mod utils;
use utils::{register_notify, test_with_background_process};

const SERVER_NODE_ID: u8 = 1;

fn setup() -> (
    Node,
    SdoClient<SimBusSender, SimBusReceiver>,
    SimBus,
    SimBusSender,
    std::sync::Arc<tokio::sync::Notify>,
) {
    let node = Node::new(
        NodeId::new(SERVER_NODE_ID).unwrap(),
        &od::NODE_MBOX,
        od::OD_TABLE,
    );
    let mut bus = SimBus::new(vec![&od::NODE_MBOX]);
    let sender = bus.new_sender();
    let receiver = bus.new_receiver();
    let client = SdoClient::new_std(SERVER_NODE_ID, bus.new_sender(), receiver);
    let notify = register_notify(&od::NODE_MBOX);
    (node, client, bus, sender, notify)
}

fn pattern(size: usize) -> Vec<u8> {
    (0..size).map(|x| (x % 251) as u8).collect()
}

#[tokio::test]
#[serial_test::serial]
async fn test_round_trip_all_sizes() {
    let (mut node, mut client, _bus, mut sender, notify) = setup();

    test_with_background_process(&mut [&mut node], &mut sender, notify, async move {
        for size in [0usize, 1, 4, 5, 7, 8, 100, 1024, 65536] {
            let data = pattern(size);
            client.download(0x3000, 0, &data).await.unwrap();
            let read = client.upload(0x3000, 0).await.unwrap();
            assert_eq!(read, data, "size {size}");
        }
    })
    .await;
}

#[tokio::test]
#[serial_test::serial]
async fn test_block_round_trip_all_sizes() {
    let (mut node, mut client, mut bus, mut sender, notify) = setup();
    let mut spy = bus.new_receiver();

    test_with_background_process(&mut [&mut node], &mut sender, notify, async move {
        for size in [5usize, 7, 8, 100, 1024, 65536] {
            let data = pattern(size);
            client.block_download(0x3000, 0, &data).await.unwrap();
            let read = client.block_upload(0x3000, 0).await.unwrap();
            assert_eq!(read, data, "size {size}");
        }

        // At or below the expedited limit a block request downgrades to a
        // plain transfer: the round trip still holds, and no block
        // download command specifier (ccs 6) appears on the request
        // channel
        for size in [0usize, 1, 4] {
            let data = pattern(size);
            spy.flush();
            client.block_download(0x3000, 0, &data).await.unwrap();
            let read = client.block_upload(0x3000, 0).await.unwrap();
            assert_eq!(read, data, "size {size}");

            while let Some(msg) = spy.try_recv() {
                if msg.id() == CanId::std(0x600 + SERVER_NODE_ID as u16) && msg.dlc == 8 {
                    assert_ne!(
                        msg.data[0] >> 5,
                        6,
                        "size {size} used the block download protocol"
                    );
                }
            }
        }
    })
    .await;
}

#[tokio::test]
#[serial_test::serial]
async fn test_typed_accessors() {
    let (mut node, mut client, _bus, mut sender, notify) = setup();

    test_with_background_process(&mut [&mut node], &mut sender, notify, async move {
        client.write_u32(0x3001, 0, 0xDEAD_BEEF).await.unwrap();
        assert_eq!(client.read_u32(0x3001, 0).await.unwrap(), 0xDEAD_BEEF);
        assert_eq!(od::VALUE_U32.get(), 0xDEAD_BEEF);

        client.write_u16(0x3002, 0, 0x1234).await.unwrap();
        assert_eq!(client.read_u16(0x3002, 0).await.unwrap(), 0x1234);

        client.download(0x3000, 0, b"hello").await.unwrap();
        assert_eq!(client.read_utf8(0x3000, 0).await.unwrap(), "hello");
    })
    .await;
}

#[tokio::test]
#[serial_test::serial]
async fn test_missing_object_aborts() {
    let (mut node, mut client, _bus, mut sender, notify) = setup();

    test_with_background_process(&mut [&mut node], &mut sender, notify, async move {
        let err = client.upload(0x7777, 0).await.unwrap_err();
        assert_eq!(
            err,
            SdoClientError::ServerAbort {
                index: 0x7777,
                sub: 0,
                abort_code: RawAbortCode::Valid(AbortCode::NoSuchObject),
            }
        );
    })
    .await;
}

#[tokio::test]
#[serial_test::serial]
async fn test_size_mismatch_aborts_then_reusable() {
    let (mut node, mut client, _bus, mut sender, notify) = setup();

    test_with_background_process(&mut [&mut node], &mut sender, notify, async move {
        // Two bytes into a four-byte object
        let err = client.download(0x3001, 0, &[1, 2]).await.unwrap_err();
        assert_eq!(
            err,
            SdoClientError::ServerAbort {
                index: 0x3001,
                sub: 0,
                abort_code: RawAbortCode::Valid(AbortCode::DataTypeMismatchLengthLow),
            }
        );

        // Six bytes into a four-byte object
        let err = client.download(0x3001, 0, &pattern(6)).await.unwrap_err();
        assert_eq!(
            err,
            SdoClientError::ServerAbort {
                index: 0x3001,
                sub: 0,
                abort_code: RawAbortCode::Valid(AbortCode::DataTypeMismatchLengthHigh),
            }
        );

        // Writing to a read-only object
        let err = client.download(0x1000, 0, &[0; 4]).await.unwrap_err();
        assert_eq!(
            err,
            SdoClientError::ServerAbort {
                index: 0x1000,
                sub: 0,
                abort_code: RawAbortCode::Valid(AbortCode::ReadOnly),
            }
        );

        // After all those aborts the same engine still works
        client.write_u32(0x3001, 0, 42).await.unwrap();
        assert_eq!(client.read_u32(0x3001, 0).await.unwrap(), 42);
    })
    .await;
}

#[tokio::test]
#[serial_test::serial]
async fn test_block_download_corruption_crc_aborts() {
    let (mut node, mut client, bus, mut sender, notify) = setup();

    // Flip one payload byte in the second block segment on its way to the
    // server
    let mut armed = true;
    bus.set_corruption(Box::new(move |msg| {
        if armed
            && msg.id() == CanId::std(0x600 + SERVER_NODE_ID as u16)
            && msg.dlc == 8
            && msg.data[0] == 0x02
        {
            msg.data[3] ^= 0xFF;
            armed = false;
        }
    }));

    test_with_background_process(&mut [&mut node], &mut sender, notify, async move {
        let data = pattern(20);
        let err = client.block_download(0x3000, 0, &data).await.unwrap_err();
        assert_eq!(
            err,
            SdoClientError::ServerAbort {
                index: 0x3000,
                sub: 0,
                abort_code: RawAbortCode::Valid(AbortCode::CrcError),
            }
        );

        // With the corruption gone the transfer goes through
        bus.clear_corruption();
        client.block_download(0x3000, 0, &data).await.unwrap();
        assert_eq!(client.upload(0x3000, 0).await.unwrap(), data);
    })
    .await;
}

#[tokio::test]
#[serial_test::serial]
async fn test_block_upload_corruption_crc_aborts() {
    let (mut node, mut client, bus, mut sender, notify) = setup();

    // Flip one payload byte in the second block segment on its way back to
    // the client
    let mut armed = true;
    bus.set_corruption(Box::new(move |msg| {
        if armed
            && msg.id() == CanId::std(0x580 + SERVER_NODE_ID as u16)
            && msg.dlc == 8
            && msg.data[0] == 0x02
        {
            msg.data[3] ^= 0xFF;
            armed = false;
        }
    }));

    test_with_background_process(&mut [&mut node], &mut sender, notify, async move {
        let data = pattern(20);
        client.download(0x3000, 0, &data).await.unwrap();

        let err = client.block_upload(0x3000, 0).await.unwrap_err();
        assert_eq!(
            err,
            SdoClientError::ClientAbort {
                index: 0x3000,
                sub: 0,
                abort_code: AbortCode::CrcError,
            }
        );

        bus.clear_corruption();
        assert_eq!(client.block_upload(0x3000, 0).await.unwrap(), data);
    })
    .await;
}

#[tokio::test]
#[serial_test::serial]
async fn test_fixed_blob_round_trip() {
    let (mut node, mut client, _bus, mut sender, notify) = setup();

    test_with_background_process(&mut [&mut node], &mut sender, notify, async move {
        // The 78-byte blob reads back at its full allocation
        let data = pattern(78);
        client.download(0x3003, 0, &data).await.unwrap();
        assert_eq!(client.upload(0x3003, 0).await.unwrap(), data);
    })
    .await;
}
