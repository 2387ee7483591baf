//! Downstream delivery of committed records.

use crate::events::Record;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Receives every committed batch after it is durable in the store.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, records: &[Record]) -> Result<()>;
}

/// Drops everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn publish(&self, _records: &[Record]) -> Result<()> {
        Ok(())
    }
}

/// Fans records out to any number of in-process subscribers. Slow
/// subscribers lag and lose records; the store stays the source of truth.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Record>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Record> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastSink {
    async fn publish(&self, records: &[Record]) -> Result<()> {
        for record in records {
            if self.tx.send(record.clone()).is_err() {
                tracing::trace!(position = record.position, "no subscribers, record not broadcast");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Intent, RecordType, RecordValue, VariableRecord};

    fn record(position: u64) -> Record {
        Record {
            position,
            key: position as i64,
            timestamp: 0,
            record_type: RecordType::Event,
            intent: Intent::VariableCreated,
            value: RecordValue::Variable(VariableRecord {
                name: "x".into(),
                value: serde_json::json!(position),
                scope_key: 1,
                process_instance_key: 1,
                tenant_id: "<default>".into(),
            }),
        }
    }

    #[tokio::test]
    async fn publishing_without_subscribers_succeeds() {
        let sink = BroadcastSink::new(4);
        sink.publish(&[record(1), record(2)]).await.unwrap();

        let mut receiver = sink.subscribe();
        sink.publish(&[record(3)]).await.unwrap();
        assert_eq!(receiver.try_recv().unwrap().position, 3);
        assert!(receiver.try_recv().is_err());
    }
}
