use serde::{Deserialize, Serialize};
use std::fmt::Display;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceType {
    Box,
    Scp,
    Directory,
    User,
}

impl Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceType::Box => write!(f, "BOX"),
            SourceType::Scp => write!(f, "SCP"),
            SourceType::Directory => write!(f, "DIRECTORY"),
            SourceType::User => write!(f, "USER"),
        }
    }
}

/// 领域事件的来源标识
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    #[serde(rename = "source_type")]
    pub source_type: SourceType,
    #[serde(rename = "source_id")]
    pub source_id: i64,
}

/// 进程内广播的领域事件, 订阅方必须幂等
#[derive(Debug, Clone)]
pub enum DomainEvent {
    SourceDeleted(SourceRef),
    ImagesDeleted(Vec<i64>),
    MetaDataAdded { image_id: i64, overwrite: bool },
}

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// 无订阅者时发布失败是正常情况, 直接丢弃
    pub fn publish(&self, event: DomainEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(DomainEvent::ImagesDeleted(vec![1, 2]));

        match rx1.recv().await.unwrap() {
            DomainEvent::ImagesDeleted(ids) => assert_eq!(ids, vec![1, 2]),
            other => panic!("unexpected event: {:?}", other),
        }
        match rx2.recv().await.unwrap() {
            DomainEvent::ImagesDeleted(ids) => assert_eq!(ids, vec![1, 2]),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish(DomainEvent::SourceDeleted(SourceRef {
            source_type: SourceType::Box,
            source_id: 9,
        }));
    }
}
