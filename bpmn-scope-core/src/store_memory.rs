use crate::events::Record;
use crate::repository::ProcessDefinition;
use crate::store::ProcessStore;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory [`ProcessStore`] for tests, the CLI and embedded use.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<Vec<Record>>,
    definitions: RwLock<Vec<Arc<ProcessDefinition>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessStore for MemoryStore {
    async fn append_records(&self, records: &[Record]) -> Result<u64> {
        let mut log = self.records.write().await;
        let mut last = log.last().map_or(0, |r| r.position);
        for record in records {
            if record.position <= last {
                bail!(
                    "record position {} does not follow committed position {last}",
                    record.position
                );
            }
            last = record.position;
        }
        log.extend_from_slice(records);
        Ok(last)
    }

    async fn read_records(&self, after_position: u64) -> Result<Vec<Record>> {
        let log = self.records.read().await;
        Ok(log
            .iter()
            .filter(|r| r.position > after_position)
            .cloned()
            .collect())
    }

    async fn last_position(&self) -> Result<u64> {
        Ok(self.records.read().await.last().map_or(0, |r| r.position))
    }

    async fn save_definition(&self, definition: Arc<ProcessDefinition>) -> Result<()> {
        let mut definitions = self.definitions.write().await;
        if definitions.iter().all(|d| d.key != definition.key) {
            definitions.push(definition);
        }
        Ok(())
    }

    async fn load_definitions(&self) -> Result<Vec<Arc<ProcessDefinition>>> {
        Ok(self.definitions.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Intent, RecordType, RecordValue, RejectionRecord};
    use crate::types::{BpmnElementType, RejectionType, NO_KEY};

    fn record(position: u64) -> Record {
        Record {
            position,
            key: NO_KEY,
            timestamp: 0,
            record_type: RecordType::CommandRejection,
            intent: Intent::Cancel,
            value: RecordValue::Rejection(RejectionRecord {
                rejection_type: RejectionType::NotFound,
                reason: String::new(),
                process_instance_key: NO_KEY,
                root_process_instance_key: NO_KEY,
                tenant_id: String::new(),
                element_id: String::new(),
                bpmn_element_type: BpmnElementType::Unspecified,
                flow_scope_key: NO_KEY,
            }),
        }
    }

    #[tokio::test]
    async fn appends_in_position_order() {
        let store = MemoryStore::new();
        assert_eq!(store.append_records(&[record(1), record(2)]).await.unwrap(), 2);
        assert_eq!(store.append_records(&[record(3)]).await.unwrap(), 3);
        assert_eq!(store.read_records(1).await.unwrap().len(), 2);
        assert_eq!(store.last_position().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn rejects_stale_positions() {
        let store = MemoryStore::new();
        store.append_records(&[record(1), record(2)]).await.unwrap();
        assert!(store.append_records(&[record(2)]).await.is_err());
        assert_eq!(store.read_records(0).await.unwrap().len(), 2);
    }
}
