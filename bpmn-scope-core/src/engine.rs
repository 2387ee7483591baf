//! Async host around the command processor.
//!
//! The engine owns one partition. Commands are processed one at a time under
//! the partition lock; a batch is appended to the [`ProcessStore`] before the
//! new state becomes visible, and only then published to the [`EventSink`].
//! A failing store leaves the partition untouched.

use crate::auth::{AllowAll, AuthorizationChecker, RequestMetadata};
use crate::commands::Command;
use crate::config::EngineConfig;
use crate::events::Record;
use crate::model::ProcessModel;
use crate::processor::CommandProcessor;
use crate::rejection::Rejection;
use crate::repository::{ProcessDefinition, ProcessRepository};
use crate::sink::{EventSink, NullSink};
use crate::state::PartitionState;
use crate::store::ProcessStore;
use crate::store_memory::MemoryStore;
use crate::types::{now_ms, Key, Timestamp, DEFAULT_TENANT};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Answer to one command, with the records its batch committed.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResponse {
    Accepted { key: Key, records: Vec<Record> },
    Rejected { rejection: Rejection, records: Vec<Record> },
}

impl CommandResponse {
    pub fn records(&self) -> &[Record] {
        match self {
            Self::Accepted { records, .. } | Self::Rejected { records, .. } => records,
        }
    }

    pub fn key(&self) -> Option<Key> {
        match self {
            Self::Accepted { key, .. } => Some(*key),
            Self::Rejected { .. } => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Accepted { .. } => None,
            Self::Rejected { rejection, .. } => Some(rejection),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

struct Partition {
    state: PartitionState,
    repository: ProcessRepository,
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn ProcessStore>,
    sink: Arc<dyn EventSink>,
    checker: Arc<dyn AuthorizationChecker>,
    partition: Mutex<Partition>,
}

impl Engine {
    /// An engine with an in-memory store, no sink and no authorization.
    pub fn new(config: EngineConfig) -> Self {
        let partition = Partition {
            state: PartitionState::new(config.partition_id),
            repository: ProcessRepository::new(),
        };
        Self {
            config,
            store: Arc::new(MemoryStore::new()),
            sink: Arc::new(NullSink),
            checker: Arc::new(AllowAll),
            partition: Mutex::new(partition),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ProcessStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_authorization(mut self, checker: Arc<dyn AuthorizationChecker>) -> Self {
        self.checker = checker;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Deployment ──

    pub async fn deploy(&self, model: ProcessModel) -> Result<Arc<ProcessDefinition>> {
        self.deploy_for_tenant(model, DEFAULT_TENANT).await
    }

    pub async fn deploy_for_tenant(&self, model: ProcessModel, tenant_id: &str) -> Result<Arc<ProcessDefinition>> {
        let mut partition = self.partition.lock().await;
        let known = partition.repository.len();
        let definition = partition.repository.deploy_for_tenant(model, tenant_id);
        if partition.repository.len() > known {
            self.store
                .save_definition(definition.clone())
                .await
                .context("Saving process definition")?;
            tracing::info!(
                process_id = %definition.bpmn_process_id,
                version = definition.version,
                key = definition.key,
                tenant_id,
                "deployed process definition"
            );
        }
        Ok(definition)
    }

    // ── Commands ──

    pub async fn process(&self, command: Command) -> Result<CommandResponse> {
        self.process_as(command, &RequestMetadata::default()).await
    }

    pub async fn process_as(&self, command: Command, metadata: &RequestMetadata) -> Result<CommandResponse> {
        self.process_at(command, metadata, now_ms()).await
    }

    /// Process with an explicit clock, for deterministic hosts and tests.
    pub async fn process_at(
        &self,
        command: Command,
        metadata: &RequestMetadata,
        now: Timestamp,
    ) -> Result<CommandResponse> {
        let mut partition = self.partition.lock().await;
        let processed = {
            let processor = CommandProcessor::new(&partition.repository, &self.config, self.checker.as_ref());
            processor.process(&partition.state, &command, metadata, now)
        };

        self.store
            .append_records(&processed.records)
            .await
            .with_context(|| format!("Committing {} batch", command.intent().short_name()))?;
        partition.state = processed.state;
        drop(partition);

        if let Err(err) = self.sink.publish(&processed.records).await {
            tracing::warn!(error = %err, "failed to publish committed records");
        }

        Ok(match processed.outcome {
            Ok(key) => CommandResponse::Accepted {
                key,
                records: processed.records,
            },
            Err(rejection) => CommandResponse::Rejected {
                rejection,
                records: processed.records,
            },
        })
    }

    // ── Timers ──

    /// Keys of timer subscriptions due at `now`.
    pub async fn due_timers(&self, now: Timestamp) -> Vec<Key> {
        self.partition.lock().await.state.subscriptions.due_timers(now)
    }

    /// Trigger every timer due at `now`. A timer removed by an earlier
    /// trigger in the same sweep is answered with a rejection.
    pub async fn trigger_due_timers(&self, now: Timestamp) -> Result<Vec<CommandResponse>> {
        let mut responses = Vec::new();
        for subscription_key in self.due_timers(now).await {
            let command = Command::TriggerTimer { subscription_key };
            responses.push(self.process_at(command, &RequestMetadata::default(), now).await?);
        }
        if !responses.is_empty() {
            tracing::debug!(count = responses.len(), now, "triggered due timers");
        }
        Ok(responses)
    }

    // ── State ──

    pub async fn snapshot(&self) -> PartitionState {
        self.partition.lock().await.state.clone()
    }

    pub async fn definition(&self, key: Key) -> Option<Arc<ProcessDefinition>> {
        self.partition.lock().await.repository.get(key)
    }

    /// Rebuild definitions and state from the store, replacing what the
    /// engine holds in memory.
    pub async fn replay(&self) -> Result<PartitionState> {
        let definitions = self.store.load_definitions().await.context("Loading definitions")?;
        let records = self.store.read_records(0).await.context("Reading record log")?;

        let mut repository = ProcessRepository::new();
        for definition in definitions {
            repository.restore(definition);
        }
        let state = PartitionState::replay(self.config.partition_id, &records);
        tracing::info!(
            records = records.len(),
            definitions = repository.len(),
            position = state.last_position,
            "replayed partition"
        );

        let mut partition = self.partition.lock().await;
        partition.repository = repository;
        partition.state = state.clone();
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CreateCommand;
    use crate::model::ProcessBuilder;
    use crate::sink::BroadcastSink;

    fn order() -> ProcessModel {
        ProcessBuilder::new("order")
            .start_event("start")
            .user_task("A")
            .end_event("end")
            .chain(&["start", "A", "end"])
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn committed_records_reach_the_sink() {
        let sink = Arc::new(BroadcastSink::new(64));
        let mut rx = sink.subscribe();
        let engine = Engine::new(EngineConfig::default()).with_sink(sink);
        engine.deploy(order()).await.unwrap();

        let response = engine
            .process(Command::Create(CreateCommand::by_id("order")))
            .await
            .unwrap();
        assert!(response.is_accepted());

        let first = rx.recv().await.unwrap();
        assert_eq!(first, response.records()[0]);
    }

    #[tokio::test]
    async fn redeploying_the_same_model_is_not_stored_twice() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(EngineConfig::default()).with_store(store.clone());
        let first = engine.deploy(order()).await.unwrap();
        let again = engine.deploy(order()).await.unwrap();
        assert_eq!(first.key, again.key);
        assert_eq!(store.load_definitions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejections_are_committed() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(EngineConfig::default()).with_store(store.clone());
        let response = engine
            .process(Command::Cancel {
                process_instance_key: 42,
            })
            .await
            .unwrap();
        assert!(response.rejection().is_some());
        assert_eq!(store.last_position().await.unwrap(), 1);
    }
}
