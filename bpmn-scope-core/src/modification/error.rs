use crate::rejection::CommandError;
use crate::types::Key;

/// Why a MODIFY command is rejected. Lists are pre-joined as `a', 'b` so the
/// messages read `'a', 'b'`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModificationError {
    #[error("Expected to modify process instance but no process instance found with key '{0}'")]
    ProcessInstanceNotFound(Key),

    #[error("Expected to modify process instance with key '{0}', but it is suspended")]
    Suspended(Key),

    #[error("Expected to modify instance of process '{process_id}' but it contains one or more activate instructions with an element that could not be found: '{ids}'")]
    ActivateElementNotFound { process_id: String, ids: String },

    #[error("Expected to modify instance of process '{process_id}' but it contains one or more terminate instructions with both element instance key and element id, but only one of them is allowed: {pairs}")]
    TerminateKeyAndElementId { process_id: String, pairs: String },

    #[error("Expected to modify instance of process '{process_id}' but it contains one or more terminate instructions with neither an element instance key nor element id: at index '{indexes}'")]
    TerminateNeitherKeyNorElementId { process_id: String, indexes: String },

    #[error("Expected to modify instance of process '{process_id}' but it contains one or more terminate instructions with an element instance that could not be found: '{keys}'")]
    TerminateInstanceNotFound { process_id: String, keys: String },

    #[error("Expected to modify instance of process '{process_id}' but it contains one or more terminate instructions with an element instance that does not belong to the modified process instance: '{keys}'")]
    TerminateInstanceOfOtherProcess { process_id: String, keys: String },

    #[error("Expected to modify instance of process '{process_id}' but it contains one or more terminate instructions with an element that could not be found: '{ids}'")]
    TerminateElementNotFound { process_id: String, ids: String },

    #[error("Expected to modify instance of process '{process_id}' but it contains one or more activate instructions for elements that are unsupported: '{ids}'. {details}.")]
    UnsupportedElements {
        process_id: String,
        ids: String,
        details: String,
    },

    #[error("Expected to modify instance of process '{process_id}' but it contains one or more activate instructions with an ancestor scope key that does not exist, or is not in an active state: '{keys}'")]
    AncestorNotFound { process_id: String, keys: String },

    #[error("Expected to modify instance of process '{process_id}' but it contains one or more activate instructions with an ancestor scope key that does not belong to the modified process instance: '{keys}'")]
    AncestorOfOtherProcess { process_id: String, keys: String },

    /// `lines` holds one `\n- instance ...` line per offending instruction.
    #[error("Expected to modify instance of process '{process_id}' but it contains one or more activate instructions with an ancestor scope key that is not an ancestor of the element to activate:{lines}")]
    AncestorNotFlowScope { process_id: String, lines: String },

    #[error("Expected to modify instance of process '{process_id}' but it contains one or more activate instructions for an element that has a flow scope with more than one active instance: '{ids}'. Can't decide in which instance of the flow scope the element should be activated. Please specify an ancestor element instance key for this activate instruction.")]
    AmbiguousFlowScope { process_id: String, ids: String },

    #[error("Expected to modify instance of process '{process_id}' but it contains one or more activate instructions for elements whose required flow scope instance is also being terminated: {details}. Please provide a valid ancestor scope key for the activation or avoid terminating the required flow scope.")]
    RequiredScopeTerminated { process_id: String, details: String },

    #[error("Expected to modify instance of process '{process_id}' but it contains one or more variable instructions with a scope element id that could not be found: '{ids}'")]
    VariableScopeNotFound { process_id: String, ids: String },

    #[error("Expected to modify instance of process '{process_id}' but it contains one or more variable instructions with a scope element that doesn't belong to the activating element's flow scope: '{ids}'. These variables should be set before or after the modification.")]
    VariableScopeNotFlowScope { process_id: String, ids: String },

    #[error("Expected to modify instance of process '{process_id}' but it contains one or more move instructions with either or both the source or target element id missing: at index '{indexes}'")]
    MoveElementIdMissing { process_id: String, indexes: String },

    #[error("Expected to modify instance of process '{process_id}' but it contains one or more move instructions with both source element instance key and source element id, but only one of them is allowed: {pairs}")]
    MoveKeyAndElementId { process_id: String, pairs: String },

    #[error("Expected to modify instance of process '{process_id}' but it contains multiple move instructions with identical source element ids: '{ids}'")]
    MoveDuplicateSource { process_id: String, ids: String },

    #[error("Expected to modify instance of process '{process_id}' but it contains one or more move instructions with a source element instance that could not be found: '{keys}'")]
    MoveSourceInstanceNotFound { process_id: String, keys: String },

    #[error("Expected to modify instance of process '{process_id}' but it contains one or more move instructions with a source element instance that does not belong to the modified process instance: '{keys}'")]
    MoveSourceInstanceOfOtherProcess { process_id: String, keys: String },

    #[error("Expected to modify instance of process '{process_id}' but it contains one or more move instructions with a source element that could not be found: '{ids}'")]
    MoveSourceElementNotFound { process_id: String, ids: String },

    #[error("Expected to modify instance of process '{process_id}' but the given instructions would terminate the instance. The instance was created by a call activity in the parent process. To terminate this instance please modify the parent process instead.")]
    TerminatesChildProcess { process_id: String },

    #[error("Expected to subscribe to catch event(s) of '{element_id}' but {message}")]
    SubscriptionFailed { element_id: String, message: String },

    #[error("Unable to modify process instance with key '{0}' as the size exceeds the maximum batch size. Please reduce the size by splitting the modification into multiple commands.")]
    TooLarge(Key),
}

impl From<ModificationError> for CommandError {
    fn from(err: ModificationError) -> Self {
        let message = err.to_string();
        match err {
            ModificationError::ProcessInstanceNotFound(_) => CommandError::NotFound(message),
            ModificationError::Suspended(_) => CommandError::InvalidState(message),
            ModificationError::TooLarge(_) => CommandError::ExceededBatchRecordSize(message),
            _ => CommandError::InvalidArgument(message),
        }
    }
}
