use crate::model::ProcessModel;
use crate::types::{Key, DEFAULT_TENANT};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;

/// A deployed process: a validated model plus its identity.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessDefinition {
    pub key: Key,
    pub version: u32,
    pub tenant_id: String,
    /// SHA-256 over the canonical JSON form of the model.
    pub checksum: [u8; 32],
    pub model: ProcessModel,
}

impl Deref for ProcessDefinition {
    type Target = ProcessModel;

    fn deref(&self) -> &ProcessModel {
        &self.model
    }
}

fn checksum(model: &ProcessModel) -> [u8; 32] {
    // BTreeMap-backed model serializes deterministically
    let canonical = serde_json::to_vec(model).unwrap_or_default();
    Sha256::digest(&canonical).into()
}

/// Read-only lookup of deployed definitions by key or by id + tenant.
///
/// Deployment itself happens outside the engine core; hosts register the
/// definitions they have deployed before issuing commands.
#[derive(Debug, Clone, Default)]
pub struct ProcessRepository {
    by_key: BTreeMap<Key, Arc<ProcessDefinition>>,
    /// (tenant, bpmn process id) -> version -> key
    versions: BTreeMap<(String, String), BTreeMap<u32, Key>>,
    next_key: Key,
}

impl ProcessRepository {
    pub fn new() -> Self {
        Self {
            next_key: 1,
            ..Self::default()
        }
    }

    /// Register a model for the default tenant.
    pub fn deploy(&mut self, model: ProcessModel) -> Arc<ProcessDefinition> {
        self.deploy_for_tenant(model, DEFAULT_TENANT)
    }

    /// Register a model. Identical re-deployments return the existing version.
    pub fn deploy_for_tenant(
        &mut self,
        model: ProcessModel,
        tenant_id: &str,
    ) -> Arc<ProcessDefinition> {
        let checksum = checksum(&model);
        let id_key = (tenant_id.to_string(), model.bpmn_process_id.clone());

        if let Some(latest) = self.latest_by_id(&model.bpmn_process_id, tenant_id) {
            if latest.checksum == checksum {
                return latest;
            }
        }

        let version = self
            .versions
            .get(&id_key)
            .and_then(|v| v.keys().next_back().copied())
            .unwrap_or(0)
            + 1;
        let key = self.next_key.max(1);
        self.next_key = key + 1;

        let definition = Arc::new(ProcessDefinition {
            key,
            version,
            tenant_id: tenant_id.to_string(),
            checksum,
            model,
        });
        self.by_key.insert(key, definition.clone());
        self.versions.entry(id_key).or_default().insert(version, key);
        tracing::debug!(
            process_id = %definition.bpmn_process_id,
            version,
            key,
            "registered process definition"
        );
        definition
    }

    /// Re-register a definition under its original key, e.g. when rebuilding
    /// from a store.
    pub fn restore(&mut self, definition: Arc<ProcessDefinition>) {
        self.next_key = self.next_key.max(definition.key + 1);
        self.versions
            .entry((definition.tenant_id.clone(), definition.bpmn_process_id.clone()))
            .or_default()
            .insert(definition.version, definition.key);
        self.by_key.insert(definition.key, definition);
    }

    pub fn get(&self, key: Key) -> Option<Arc<ProcessDefinition>> {
        self.by_key.get(&key).cloned()
    }

    pub fn latest_by_id(&self, bpmn_process_id: &str, tenant_id: &str) -> Option<Arc<ProcessDefinition>> {
        self.versions
            .get(&(tenant_id.to_string(), bpmn_process_id.to_string()))
            .and_then(|v| v.values().next_back())
            .and_then(|key| self.get(*key))
    }

    pub fn by_id_and_version(
        &self,
        bpmn_process_id: &str,
        version: u32,
        tenant_id: &str,
    ) -> Option<Arc<ProcessDefinition>> {
        self.versions
            .get(&(tenant_id.to_string(), bpmn_process_id.to_string()))
            .and_then(|v| v.get(&version))
            .and_then(|key| self.get(*key))
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}
