//! Scope tree, element lifecycle and modification processing for BPMN
//! process instances.
//!
//! Every command is processed into one batch of records. State changes only
//! through the event applier, so a committed log replays into the same
//! state. [`engine::Engine`] hosts one partition over a [`store::ProcessStore`]
//! and an [`sink::EventSink`]; [`processor::CommandProcessor`] is the
//! synchronous core underneath it.

pub mod auth;
pub mod commands;
pub mod config;
pub mod creation;
pub mod engine;
pub mod events;
mod lifecycle;
pub mod model;
pub mod modification;
pub mod processor;
pub mod rejection;
pub mod repository;
pub mod scope_tree;
mod side_effects;
pub mod sink;
pub mod start_instructions;
pub mod state;
pub mod store;
pub mod store_memory;
pub mod subscriptions;
pub mod types;
pub mod variables;
mod writer;

pub use auth::{AllowAll, AuthorizationChecker, Permission, PermissionTable, RequestMetadata};
pub use commands::{Command, CreateCommand, MigrateCommand};
pub use config::{AncestorStatePolicy, EngineConfig};
pub use engine::{CommandResponse, Engine};
pub use events::{Intent, Record, RecordType, RecordValue};
pub use model::{ElementDef, ProcessBuilder, ProcessModel};
pub use modification::{
    ActivateInstruction, AncestorSelection, ModificationInstruction, ModifyCommand, MoveInstruction,
    TerminateInstruction,
};
pub use processor::{CommandProcessor, Processed};
pub use rejection::{CommandError, Rejection};
pub use repository::{ProcessDefinition, ProcessRepository};
pub use sink::{BroadcastSink, EventSink, NullSink};
pub use state::PartitionState;
pub use store::ProcessStore;
pub use store_memory::MemoryStore;
pub use types::{BpmnElementType, Document, Key, LifecycleState, RejectionType, DEFAULT_TENANT, MAX_PARTITION_ID, NO_KEY};
