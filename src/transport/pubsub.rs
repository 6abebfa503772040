use std::sync::Arc;

use tokio::sync::broadcast;

use crate::core::{topic_matches, DataMessage};

/// One message on the in-process bus. `remote` tags traffic that arrived
/// from a peer broker so the proxy never forwards it back out.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub msg: Arc<DataMessage>,
    pub remote: bool,
}

/// In-process publish/subscribe bus, the intra-host data plane. Every
/// subscriber observes every published message once; topic filtering
/// happens on the subscriber side.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<BusMessage>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish_local(&self, msg: DataMessage) {
        // A send error only means no subscriber is currently attached.
        let _ = self.tx.send(BusMessage {
            msg: Arc::new(msg),
            remote: false,
        });
    }

    pub fn publish_remote(&self, msg: DataMessage) {
        let _ = self.tx.send(BusMessage {
            msg: Arc::new(msg),
            remote: true,
        });
    }

    /// Topic-filtered subscription. An empty prefix list subscribes to
    /// every topic.
    pub fn subscribe(&self, topics: Vec<String>) -> BusSubscription {
        BusSubscription {
            rx: self.tx.subscribe(),
            topics,
            lagged: 0,
        }
    }

    /// Unfiltered tap used by the broker proxy.
    pub fn tap(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}

pub struct BusSubscription {
    rx: broadcast::Receiver<BusMessage>,
    topics: Vec<String>,
    lagged: u64,
}

impl BusSubscription {
    /// Next message matching the subscription, or `None` once the bus is
    /// closed. A slow subscriber that falls off the ring observes the
    /// skip as an increased `lagged` count and a sequence gap, never a
    /// stall of the publisher.
    pub async fn recv(&mut self) -> Option<Arc<DataMessage>> {
        loop {
            match self.rx.recv().await {
                Ok(bus_msg) => {
                    if self.matches(&bus_msg.msg.topic) {
                        return Some(bus_msg.msg);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.lagged += n;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn lagged(&self) -> u64 {
        self.lagged
    }

    fn matches(&self, topic: &str) -> bool {
        self.topics.is_empty() || self.topics.iter().any(|p| topic_matches(p, topic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Payload;

    fn msg(topic: &str, seq: u64) -> DataMessage {
        DataMessage {
            topic: topic.into(),
            publisher_id: "p".into(),
            seq,
            reference_ts_ns: 0,
            device_ts_ns: None,
            payload: Payload::Tabular(vec![0.0]),
        }
    }

    #[tokio::test]
    async fn subscription_filters_by_prefix() {
        let bus = LocalBus::new(16);
        let mut sub = bus.subscribe(vec!["imu".into()]);
        bus.publish_local(msg("cam.frame", 1));
        bus.publish_local(msg("imu.acc", 2));
        let got = sub.recv().await.unwrap();
        assert_eq!(got.topic, "imu.acc");
        assert_eq!(got.seq, 2);
    }

    #[tokio::test]
    async fn empty_topic_list_subscribes_to_all() {
        let bus = LocalBus::new(16);
        let mut sub = bus.subscribe(Vec::new());
        bus.publish_remote(msg("cam.frame", 9));
        assert_eq!(sub.recv().await.unwrap().seq, 9);
    }
}
