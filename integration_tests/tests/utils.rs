#![allow(dead_code)]
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::executor::block_on;
use tokio::sync::Notify;

use cantata_common::traits::AsyncCanSender;
use cantata_node::{Node, NodeMbox};
use integration_tests::sim_bus::SimBusSender;

/// Wire a mailbox's notify callback to a tokio [`Notify`], so the
/// background process loop reacts to frames immediately instead of waiting
/// out its tick.
pub fn register_notify(mbox: &'static NodeMbox) -> Arc<Notify> {
    let notify = Arc::new(Notify::new());
    let hook = notify.clone();
    mbox.set_process_notify_callback(Box::leak(Box::new(move || hook.notify_one())));
    notify
}

/// Run `test_task` while a background loop keeps processing the nodes
pub async fn test_with_background_process<T>(
    nodes: &mut [&mut Node],
    sender: &mut SimBusSender,
    notify: Arc<Notify>,
    test_task: impl Future<Output = T>,
) -> T {
    // Process once up front so the nodes have announced boot-up before any
    // requests arrive
    for node in nodes.iter_mut() {
        node.process(0, &mut |msg| block_on(sender.send(msg)));
    }

    let mut loop_sender = sender.clone();
    let process_loop = async move {
        let mut last = Instant::now();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(1)) => {}
                _ = notify.notified() => {}
            }
            let now = Instant::now();
            let elapsed_us = now.duration_since(last).as_micros().min(u32::MAX as u128) as u32;
            last = now;
            for node in nodes.iter_mut() {
                node.process(elapsed_us, &mut |msg| block_on(loop_sender.send(msg)));
            }
        }
    };

    tokio::select! {
        result = test_task => result,
        _ = process_loop => unreachable!("process loop never returns"),
    }
}
