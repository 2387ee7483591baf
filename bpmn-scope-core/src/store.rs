use crate::events::Record;
use crate::repository::ProcessDefinition;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Persistence for one partition: the committed record log and the
/// definitions deployed to it.
///
/// The engine only appends whole batches and reads the log back for replay;
/// state itself is never stored, it is rebuilt from the records. Backends
/// must keep appends atomic per batch.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    // ── Record log (append-only) ──

    /// Append one committed batch. Returns the position of its last record.
    async fn append_records(&self, records: &[Record]) -> Result<u64>;

    /// Records with a position greater than `after_position`, in order.
    async fn read_records(&self, after_position: u64) -> Result<Vec<Record>>;

    async fn last_position(&self) -> Result<u64>;

    // ── Definitions ──

    async fn save_definition(&self, definition: Arc<ProcessDefinition>) -> Result<()>;

    /// Every saved definition in deployment order.
    async fn load_definitions(&self) -> Result<Vec<Arc<ProcessDefinition>>>;
}
