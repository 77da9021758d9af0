//! In-memory object store for tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::error::ErrorResponse;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::client::KubeClient;
use crate::types::{Module, NodeModulesConfig};

#[derive(Default)]
struct State {
    modules: BTreeMap<(String, String), Module>,
    nodes: Vec<Node>,
    nmcs: BTreeMap<String, NodeModulesConfig>,
    secrets: BTreeMap<(String, String), Secret>,
    resource_version: u64,
    nmc_creates: usize,
    nmc_patches: usize,
    module_patches: usize,
}

impl State {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

#[derive(Default)]
pub struct FakeKubeClient {
    state: Mutex<State>,
}

impl FakeKubeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(self, mut module: Module) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            module.metadata.resource_version = Some(state.next_version());
            let key = (
                module.metadata.namespace.clone().unwrap_or_default(),
                module.metadata.name.clone().unwrap_or_default(),
            );
            state.modules.insert(key, module);
        }
        self
    }

    pub fn with_node(self, node: Node) -> Self {
        self.state.lock().unwrap().nodes.push(node);
        self
    }

    pub fn with_nmc(self, mut nmc: NodeModulesConfig) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            nmc.metadata.resource_version = Some(state.next_version());
            let name = nmc.metadata.name.clone().unwrap_or_default();
            state.nmcs.insert(name, nmc);
        }
        self
    }

    pub fn with_secret(self, secret: Secret) -> Self {
        let key = (
            secret.metadata.namespace.clone().unwrap_or_default(),
            secret.metadata.name.clone().unwrap_or_default(),
        );
        self.state.lock().unwrap().secrets.insert(key, secret);
        self
    }

    pub fn module(&self, namespace: &str, name: &str) -> Option<Module> {
        let key = (namespace.to_string(), name.to_string());
        self.state.lock().unwrap().modules.get(&key).cloned()
    }

    pub fn nmc(&self, name: &str) -> Option<NodeModulesConfig> {
        self.state.lock().unwrap().nmcs.get(name).cloned()
    }

    /// Number of NMC creates plus patches.
    pub fn nmc_writes(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.nmc_creates + state.nmc_patches
    }

    pub fn module_patches(&self) -> usize {
        self.state.lock().unwrap().module_patches
    }

    /// Stands in for the node agent acknowledging an unload.
    pub fn clear_nmc_label(&self, nmc: &str, label: &str) {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        if let Some(obj) = state.nmcs.get_mut(nmc) {
            if let Some(labels) = obj.metadata.labels.as_mut() {
                labels.remove(label);
            }
            obj.metadata.resource_version = Some(version);
        }
    }
}

fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: reason.to_lowercase(),
        reason: reason.to_string(),
        code,
    })
}

fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    let empty = BTreeMap::new();
    let labels = labels.unwrap_or(&empty);
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => labels.contains_key(term),
        })
}

/// RFC 7386 JSON merge patch.
fn merge(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(Default::default());
            }
            if let Value::Object(target) = target {
                for (key, value) in entries {
                    if value.is_null() {
                        target.remove(key);
                    } else {
                        merge(target.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn apply_patch<K: Serialize + DeserializeOwned>(
    obj: &K,
    patch: &Value,
    current_version: Option<&str>,
    next_version: String,
) -> Result<K, kube::Error> {
    if let Some(expected) = patch.pointer("/metadata/resourceVersion").and_then(Value::as_str) {
        if Some(expected) != current_version {
            return Err(api_error(409, "Conflict"));
        }
    }
    let mut value = serde_json::to_value(obj).map_err(kube::Error::SerdeError)?;
    merge(&mut value, patch);
    value["metadata"]["resourceVersion"] = Value::String(next_version);
    serde_json::from_value(value).map_err(kube::Error::SerdeError)
}

#[async_trait]
impl KubeClient for FakeKubeClient {
    async fn get_module(&self, namespace: &str, name: &str) -> Result<Option<Module>, kube::Error> {
        Ok(self.module(namespace, name))
    }

    async fn patch_module(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), kube::Error> {
        let mut state = self.state.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        let current = state
            .modules
            .get(&key)
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound"))?;
        let version = state.next_version();
        let patched = apply_patch(
            &current,
            patch,
            current.metadata.resource_version.as_deref(),
            version,
        )?;
        state.module_patches += 1;
        state.modules.insert(key, patched);
        Ok(())
    }

    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>, kube::Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .nodes
            .iter()
            .filter(|node| matches_selector(node.metadata.labels.as_ref(), label_selector))
            .cloned()
            .collect())
    }

    async fn get_nmc(&self, name: &str) -> Result<Option<NodeModulesConfig>, kube::Error> {
        Ok(self.nmc(name))
    }

    async fn list_nmcs(&self, label_selector: &str) -> Result<Vec<NodeModulesConfig>, kube::Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .nmcs
            .values()
            .filter(|nmc| matches_selector(nmc.metadata.labels.as_ref(), label_selector))
            .cloned()
            .collect())
    }

    async fn create_nmc(&self, nmc: &NodeModulesConfig) -> Result<(), kube::Error> {
        let mut state = self.state.lock().unwrap();
        let name = nmc.metadata.name.clone().unwrap_or_default();
        if state.nmcs.contains_key(&name) {
            return Err(api_error(409, "AlreadyExists"));
        }
        let mut created = nmc.clone();
        created.metadata.resource_version = Some(state.next_version());
        state.nmc_creates += 1;
        state.nmcs.insert(name, created);
        Ok(())
    }

    async fn patch_nmc(&self, name: &str, patch: &Value) -> Result<(), kube::Error> {
        let mut state = self.state.lock().unwrap();
        let current = state
            .nmcs
            .get(name)
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound"))?;
        let version = state.next_version();
        let patched = apply_patch(
            &current,
            patch,
            current.metadata.resource_version.as_deref(),
            version,
        )?;
        state.nmc_patches += 1;
        state.nmcs.insert(name.to_string(), patched);
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error> {
        let key = (namespace.to_string(), name.to_string());
        Ok(self.state.lock().unwrap().secrets.get(&key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_patch_removes_nulls_and_replaces_arrays() {
        let mut target = json!({"a": {"b": 1, "c": 2}, "list": [1, 2]});

        merge(&mut target, &json!({"a": {"b": null, "d": 3}, "list": [3]}));

        assert_eq!(target, json!({"a": {"c": 2, "d": 3}, "list": [3]}));
    }

    #[test]
    fn selector_supports_equality_and_existence() {
        let labels = BTreeMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), String::new()),
        ]);

        assert!(matches_selector(Some(&labels), ""));
        assert!(matches_selector(Some(&labels), "a=1,b"));
        assert!(!matches_selector(Some(&labels), "a=2"));
        assert!(!matches_selector(None, "b"));
    }
}
