use crate::types::Key;
use crate::variables::VariableInstruction;
use serde::{Deserialize, Serialize};

/// One MODIFY command: a batch of instructions applied atomically to a
/// single process instance.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModifyCommand {
    pub process_instance_key: Key,
    #[serde(default)]
    pub instructions: Vec<ModificationInstruction>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModificationInstruction {
    Activate(ActivateInstruction),
    Terminate(TerminateInstruction),
    Move(MoveInstruction),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivateInstruction {
    pub element_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ancestor_scope_key: Option<Key>,
    #[serde(default)]
    pub variable_instructions: Vec<VariableInstruction>,
}

/// Terminates either one instance by key or every topmost active instance
/// of an element.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TerminateInstruction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_instance_key: Option<Key>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
}

/// Which instance the target of a move is activated under.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AncestorSelection {
    /// Regular resolution, as for an activate instruction without ancestor.
    #[default]
    Auto,
    Direct(Key),
    /// Nearest ancestor of the source whose element is a flow scope of the target.
    Inferred,
    /// The flow scope of the source instance.
    SourceParent,
}

/// Terminate the source and activate the target in its place.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MoveInstruction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_element_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_element_instance_key: Option<Key>,
    #[serde(default)]
    pub target_element_id: String,
    #[serde(default)]
    pub ancestor: AncestorSelection,
    #[serde(default)]
    pub variable_instructions: Vec<VariableInstruction>,
}

impl ModifyCommand {
    pub fn new(process_instance_key: Key) -> Self {
        Self {
            process_instance_key,
            instructions: Vec::new(),
        }
    }

    pub fn instruction(mut self, instruction: ModificationInstruction) -> Self {
        self.instructions.push(instruction);
        self
    }

    pub fn activate(self, instruction: ActivateInstruction) -> Self {
        self.instruction(ModificationInstruction::Activate(instruction))
    }

    pub fn terminate_key(self, element_instance_key: Key) -> Self {
        self.instruction(ModificationInstruction::Terminate(TerminateInstruction {
            element_instance_key: Some(element_instance_key),
            element_id: None,
        }))
    }

    pub fn terminate_element(self, element_id: impl Into<String>) -> Self {
        self.instruction(ModificationInstruction::Terminate(TerminateInstruction {
            element_instance_key: None,
            element_id: Some(element_id.into()),
        }))
    }

    pub fn move_element(self, instruction: MoveInstruction) -> Self {
        self.instruction(ModificationInstruction::Move(instruction))
    }
}

impl ActivateInstruction {
    pub fn new(element_id: impl Into<String>) -> Self {
        Self {
            element_id: element_id.into(),
            ancestor_scope_key: None,
            variable_instructions: Vec::new(),
        }
    }

    pub fn ancestor(mut self, ancestor_scope_key: Key) -> Self {
        self.ancestor_scope_key = Some(ancestor_scope_key);
        self
    }

    pub fn variables(mut self, instruction: VariableInstruction) -> Self {
        self.variable_instructions.push(instruction);
        self
    }
}

impl MoveInstruction {
    pub fn by_element(source_element_id: impl Into<String>, target_element_id: impl Into<String>) -> Self {
        Self {
            source_element_id: Some(source_element_id.into()),
            target_element_id: target_element_id.into(),
            ..Self::default()
        }
    }

    pub fn by_key(source_element_instance_key: Key, target_element_id: impl Into<String>) -> Self {
        Self {
            source_element_instance_key: Some(source_element_instance_key),
            target_element_id: target_element_id.into(),
            ..Self::default()
        }
    }

    pub fn ancestor(mut self, ancestor: AncestorSelection) -> Self {
        self.ancestor = ancestor;
        self
    }

    pub fn variables(mut self, instruction: VariableInstruction) -> Self {
        self.variable_instructions.push(instruction);
        self
    }

    /// Source element id, ignoring blanks.
    pub(crate) fn source_id(&self) -> Option<&str> {
        self.source_element_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
    }
}

impl TerminateInstruction {
    pub(crate) fn element(&self) -> Option<&str> {
        self.element_id.as_deref().filter(|id| !id.trim().is_empty())
    }
}
