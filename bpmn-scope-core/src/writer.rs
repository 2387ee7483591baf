//! Record batch of one inbound command.
//!
//! A [`Batch`] owns a working copy of the partition state. Every appended
//! record is applied to that copy immediately, so later steps of the same
//! command read their own writes. Follow-up commands produced while
//! processing are queued here and drained FIFO before the batch is
//! committed. A rejected command simply drops the batch.

use crate::config::EngineConfig;
use crate::events::{ElementRecord, Intent, Record, RecordType, RecordValue};
use crate::rejection::CommandError;
use crate::repository::{ProcessDefinition, ProcessRepository};
use crate::state::PartitionState;
use crate::types::{Document, Key, Timestamp};
use std::collections::VecDeque;
use std::sync::Arc;

/// Restricts the flows a completing element takes to the one leading to
/// `target_element_id`, which is activated with `trigger` as payload.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Route {
    pub target_element_id: String,
    pub trigger: Document,
}

/// Internal command queued while processing another one.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum FollowUp {
    Activate {
        key: Key,
        record: ElementRecord,
        trigger: Option<Document>,
    },
    Complete {
        key: Key,
        variables: Document,
        route: Option<Route>,
    },
    Suspend {
        process_instance_key: Key,
    },
}

pub(crate) struct Batch<'a> {
    pub(crate) state: PartitionState,
    repository: &'a ProcessRepository,
    config: &'a EngineConfig,
    timestamp: Timestamp,
    records: Vec<Record>,
    follow_ups: VecDeque<FollowUp>,
    drained: usize,
}

impl<'a> Batch<'a> {
    pub(crate) fn new(
        state: PartitionState,
        repository: &'a ProcessRepository,
        config: &'a EngineConfig,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            state,
            repository,
            config,
            timestamp,
            records: Vec::new(),
            follow_ups: VecDeque::new(),
            drained: 0,
        }
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        self.config
    }

    pub(crate) fn repository(&self) -> &ProcessRepository {
        self.repository
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.timestamp
    }

    pub(crate) fn next_key(&mut self) -> Key {
        self.state.keys.next_key()
    }

    pub(crate) fn definition_of(&self, record: &ElementRecord) -> Option<Arc<ProcessDefinition>> {
        self.repository.get(record.process_definition_key)
    }

    // ── writing ──

    pub(crate) fn event(&mut self, key: Key, intent: Intent, value: RecordValue) {
        self.append(RecordType::Event, key, intent, value);
    }

    pub(crate) fn command(&mut self, key: Key, intent: Intent, value: RecordValue) {
        self.append(RecordType::Command, key, intent, value);
    }

    pub(crate) fn rejection(&mut self, key: Key, intent: Intent, value: RecordValue) {
        self.append(RecordType::CommandRejection, key, intent, value);
    }

    fn append(&mut self, record_type: RecordType, key: Key, intent: Intent, value: RecordValue) {
        let record = Record {
            position: self.state.last_position + 1,
            key,
            timestamp: self.timestamp,
            record_type,
            intent,
            value,
        };
        self.state.apply(&record);
        self.records.push(record);
    }

    pub(crate) fn records(&self) -> &[Record] {
        &self.records
    }

    /// Serialized size of everything written so far.
    pub(crate) fn encoded_len(&self) -> usize {
        self.records.iter().map(Record::encoded_len).sum()
    }

    pub(crate) fn into_parts(self) -> (PartitionState, Vec<Record>) {
        (self.state, self.records)
    }

    // ── follow-ups ──

    pub(crate) fn enqueue(&mut self, follow_up: FollowUp) {
        self.follow_ups.push_back(follow_up);
    }

    /// Next queued follow-up. Fails once the batch has processed more
    /// follow-ups than configured.
    pub(crate) fn next_follow_up(&mut self) -> Result<Option<FollowUp>, CommandError> {
        let Some(next) = self.follow_ups.pop_front() else {
            return Ok(None);
        };
        self.drained += 1;
        if self.drained > self.config.max_commands_per_batch {
            return Err(CommandError::ExceededBatchRecordSize(format!(
                "Expected to process at most {} follow-up commands in one batch, but the limit was exceeded",
                self.config.max_commands_per_batch
            )));
        }
        Ok(Some(next))
    }

    /// True when an activation inside `scope_key` is still waiting in the queue.
    pub(crate) fn has_queued_activation_in(&self, scope_key: Key) -> bool {
        self.follow_ups.iter().any(|f| {
            matches!(f, FollowUp::Activate { record, .. } if record.flow_scope_key == scope_key)
        })
    }
}
