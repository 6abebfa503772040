use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::transport::{DataLink, LocalBus};

/// Data-plane proxy: forwards every locally published message to the
/// connected peer brokers. Remote traffic is already on the local bus
/// (the data listener re-publishes it) and is never forwarded again, so
/// a full mesh stays loop-free.
pub fn spawn_proxy(bus: &LocalBus, links: Vec<(String, Arc<DataLink>)>) -> JoinHandle<()> {
    let mut tap = bus.tap();
    tokio::spawn(async move {
        loop {
            match tap.recv().await {
                Ok(bus_msg) => {
                    if bus_msg.remote {
                        continue;
                    }
                    for (peer_id, link) in &links {
                        if !link.forward(Arc::clone(&bus_msg.msg)) {
                            debug!(peer_id = %peer_id, topic = %bus_msg.msg.topic, "peer forward dropped");
                        }
                    }
                }
                // Proxy lag surfaces to peers as sequence gaps, which
                // subscribers report but nobody retransmits.
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "proxy lagged behind local publishers");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("pub/sub proxy exited");
    })
}
