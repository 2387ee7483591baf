use crate::events::{Intent, RejectionRecord};
use crate::types::{BpmnElementType, Key, RejectionType, NO_KEY};
use serde::{Deserialize, Serialize};

/// Why a command was not applied. Every variant maps to one rejection type;
/// the message is the rejection reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    ExceededBatchRecordSize(String),
}

impl CommandError {
    pub fn rejection_type(&self) -> RejectionType {
        match self {
            CommandError::NotFound(_) => RejectionType::NotFound,
            CommandError::InvalidArgument(_) => RejectionType::InvalidArgument,
            CommandError::InvalidState(_) => RejectionType::InvalidState,
            CommandError::Forbidden(_) => RejectionType::Forbidden,
            CommandError::ExceededBatchRecordSize(_) => RejectionType::ExceededBatchRecordSize,
        }
    }
}

/// Identity of the instance a command targeted, captured before validation so
/// that rejections carry it even when the structural lookup fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionContext {
    pub process_instance_key: Key,
    pub root_process_instance_key: Key,
    pub tenant_id: String,
    pub element_id: String,
    pub bpmn_element_type: BpmnElementType,
    pub flow_scope_key: Key,
}

impl RejectionContext {
    pub fn unknown(process_instance_key: Key, tenant_id: impl Into<String>) -> Self {
        Self {
            process_instance_key,
            root_process_instance_key: process_instance_key,
            tenant_id: tenant_id.into(),
            element_id: String::new(),
            bpmn_element_type: BpmnElementType::Unspecified,
            flow_scope_key: NO_KEY,
        }
    }
}

/// A typed, terminal rejection of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub rejection_type: RejectionType,
    pub reason: String,
    pub process_instance_key: Key,
    pub root_process_instance_key: Key,
    pub tenant_id: String,
    /// The rejected command, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Intent>,
}

impl Rejection {
    pub fn new(error: &CommandError, context: &RejectionContext) -> Self {
        Self {
            rejection_type: error.rejection_type(),
            reason: error.to_string(),
            process_instance_key: context.process_instance_key,
            root_process_instance_key: context.root_process_instance_key,
            tenant_id: context.tenant_id.clone(),
            command: None,
        }
    }

    pub fn for_command(mut self, intent: Intent) -> Self {
        self.command = Some(intent);
        self
    }

    pub(crate) fn to_record(&self, context: &RejectionContext) -> RejectionRecord {
        RejectionRecord {
            rejection_type: self.rejection_type,
            reason: self.reason.clone(),
            process_instance_key: self.process_instance_key,
            root_process_instance_key: self.root_process_instance_key,
            tenant_id: self.tenant_id.clone(),
            element_id: context.element_id.clone(),
            bpmn_element_type: context.bpmn_element_type,
            flow_scope_key: context.flow_scope_key,
        }
    }
}

/// Join values as `'a', 'b'` for rejection messages.
pub(crate) fn quote_join<T: std::fmt::Display>(items: impl IntoIterator<Item = T>) -> String {
    items
        .into_iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join("', '")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_carries_context_and_type() {
        let context = RejectionContext::unknown(42, "tenant-a");
        let rejection = Rejection::new(&CommandError::NotFound("missing".into()), &context);
        assert_eq!(rejection.rejection_type, RejectionType::NotFound);
        assert_eq!(rejection.reason, "missing");
        assert_eq!(rejection.root_process_instance_key, 42);
        assert_eq!(rejection.tenant_id, "tenant-a");
    }

    #[test]
    fn quote_join_formats_ids() {
        assert_eq!(quote_join(["A", "B"]), "A', 'B");
        assert_eq!(format!("'{}'", quote_join([12345])), "'12345'");
    }
}
