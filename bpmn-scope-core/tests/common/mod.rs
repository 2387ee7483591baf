//! Shared helpers for engine integration tests.

#![allow(dead_code)]

use bpmn_scope_core::events::ElementRecord;
use bpmn_scope_core::{
    Command, CommandResponse, CreateCommand, Engine, EngineConfig, Intent, Key, ModifyCommand, PartitionState,
    ProcessModel, Record, RecordType, Rejection, RequestMetadata,
};
use serde_json::Value;

// ── Test Infrastructure ──────────────────────────────────────────────────

/// Engine plus every record it committed, in order. Time only moves when a
/// test advances it.
pub struct RecordingHarness {
    pub engine: Engine,
    pub records: Vec<Record>,
    pub now: i64,
    pub metadata: RequestMetadata,
}

impl RecordingHarness {
    pub async fn new(models: Vec<ProcessModel>) -> Self {
        Self::with_config(EngineConfig::default(), models).await
    }

    pub async fn with_config(config: EngineConfig, models: Vec<ProcessModel>) -> Self {
        Self::with_engine(Engine::new(config), models).await
    }

    pub async fn with_engine(engine: Engine, models: Vec<ProcessModel>) -> Self {
        // Initialize logging for tests
        let _ = tracing_subscriber::fmt()
            .with_env_filter("bpmn_scope_core=debug")
            .with_test_writer()
            .try_init();

        for model in models {
            engine.deploy(model).await.unwrap();
        }
        Self {
            engine,
            records: Vec::new(),
            now: 0,
            metadata: RequestMetadata::default(),
        }
    }

    pub async fn run(&mut self, command: Command) -> CommandResponse {
        let response = self
            .engine
            .process_at(command, &self.metadata, self.now)
            .await
            .unwrap();
        self.records.extend_from_slice(response.records());
        response
    }

    /// Run a command that must be accepted; returns its key.
    pub async fn accept(&mut self, command: Command) -> Key {
        match self.run(command).await {
            CommandResponse::Accepted { key, .. } => key,
            CommandResponse::Rejected { rejection, .. } => {
                panic!("expected command to be accepted, got {rejection:?}")
            }
        }
    }

    /// Run a command that must be rejected.
    pub async fn reject(&mut self, command: Command) -> Rejection {
        match self.run(command).await {
            CommandResponse::Rejected { rejection, .. } => rejection,
            CommandResponse::Accepted { key, .. } => {
                panic!("expected command to be rejected, but it was accepted with key {key}")
            }
        }
    }

    pub async fn create(&mut self, bpmn_process_id: &str) -> Key {
        self.accept(Command::Create(CreateCommand::by_id(bpmn_process_id)))
            .await
    }

    pub async fn modify(&mut self, command: ModifyCommand) -> CommandResponse {
        self.run(Command::Modify(command)).await
    }

    pub async fn complete(&mut self, element_instance_key: Key) -> Key {
        self.accept(Command::CompleteElement {
            element_instance_key,
            variables: Default::default(),
        })
        .await
    }

    pub async fn advance(&mut self, millis: i64) -> Vec<CommandResponse> {
        self.now += millis;
        let responses = self.engine.trigger_due_timers(self.now).await.unwrap();
        for response in &responses {
            self.records.extend_from_slice(response.records());
        }
        responses
    }

    pub async fn state(&self) -> PartitionState {
        self.engine.snapshot().await
    }

    /// Key of the single active instance of `element_id` in the process
    /// instance.
    pub async fn key_of(&self, process_instance_key: Key, element_id: &str) -> Key {
        let state = self.state().await;
        let instances = state.tree.active_instances_of(process_instance_key, element_id);
        assert_eq!(
            instances.len(),
            1,
            "expected exactly one active instance of '{element_id}'"
        );
        instances[0].key
    }

    pub async fn keys_of(&self, process_instance_key: Key, element_id: &str) -> Vec<Key> {
        self.state()
            .await
            .tree
            .active_instances_of(process_instance_key, element_id)
            .iter()
            .map(|instance| instance.key)
            .collect()
    }

    pub async fn variable(&self, scope_key: Key, name: &str) -> Option<Value> {
        self.state()
            .await
            .variables
            .get_local(scope_key, name)
            .map(|variable| variable.value.clone())
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    // ── Record queries ──

    pub fn events(&self, intent: Intent) -> Vec<&Record> {
        self.records
            .iter()
            .filter(|r| r.record_type == RecordType::Event && r.intent == intent)
            .collect()
    }

    pub fn element_events(&self, intent: Intent, element_id: &str) -> Vec<&ElementRecord> {
        self.events(intent)
            .into_iter()
            .filter_map(Record::element)
            .filter(|element| element.element_id == element_id)
            .collect()
    }

    pub fn has_record_for(&self, element_id: &str) -> bool {
        self.records.iter().any(|r| r.element_id() == element_id)
    }

    /// Position of the first record matching, for ordering assertions.
    pub fn position_of(&self, predicate: impl Fn(&Record) -> bool) -> Option<usize> {
        self.records.iter().position(predicate)
    }
}

pub fn doc(value: Value) -> bpmn_scope_core::Document {
    value.as_object().cloned().unwrap_or_default()
}
