//! Scheduling decisions and the cluster writes that converge on them.
//!
//! [`ModuleNmcReconcilerHelper`] is the only code that mutates cluster state.
//! Every operation can be re-run from scratch: a pass that fails halfway
//! leaves behind writes that are each correct on their own.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde_json::{json, Value};

use crate::api::ModuleLoaderData;
use crate::client::KubeClient;
use crate::error::Error;
use crate::kernel::{node_kernel_version, KernelMapper, KernelMapperError};
use crate::nmc::{module_configured_label, module_in_use_label, NmcHelper};
use crate::registry::{Registry, RegistryAuthGetter};
use crate::types::{Module, NodeModulesConfig, NodeModulesConfigSpec};

pub const MODULE_FINALIZER: &str = "kmm.node.kubernetes.io/module-finalizer";

/// What one reconcile pass decided for one node.
///
/// `mld` set: the module must be configured on the node.
/// `mld` unset and `nmc_exists`: the module must be removed from the node.
/// Neither: nothing to do.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SchedulingData {
    pub mld: Option<ModuleLoaderData>,
    pub node: Option<Node>,
    pub nmc_exists: bool,
}

/// Decisions for every node that could be resolved, plus one error per node that could not.
#[derive(Debug, Default)]
pub struct SchedulingOutcome {
    pub by_node: BTreeMap<String, SchedulingData>,
    pub errors: Vec<Error>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReconcilerHelper: Send + Sync {
    async fn get_requested_module(&self, namespace: &str, name: &str)
        -> Result<Option<Module>, Error>;

    async fn set_finalizer(&self, module: &Module) -> Result<(), Error>;

    async fn finalize_module(&self, module: &Module) -> Result<(), Error>;

    async fn get_nodes_list_by_selector(&self, module: &Module) -> Result<Vec<Node>, Error>;

    async fn get_nmcs_by_module_set(&self, module: &Module) -> Result<BTreeSet<String>, Error>;

    fn prepare_scheduling_data(
        &self,
        module: &Module,
        target_nodes: &[Node],
        current_nmcs: &BTreeSet<String>,
    ) -> SchedulingOutcome;

    async fn enable_module_on_node(&self, mld: &ModuleLoaderData, node: &Node) -> Result<(), Error>;

    async fn disable_module_on_node(
        &self,
        namespace: &str,
        name: &str,
        node_name: &str,
    ) -> Result<(), Error>;
}

pub struct ModuleNmcReconcilerHelper {
    client: Arc<dyn KubeClient>,
    kernel_mapper: Arc<dyn KernelMapper>,
    registry: Arc<dyn Registry>,
    nmc_helper: Arc<dyn NmcHelper>,
}

impl ModuleNmcReconcilerHelper {
    pub fn new(
        client: Arc<dyn KubeClient>,
        kernel_mapper: Arc<dyn KernelMapper>,
        registry: Arc<dyn Registry>,
        nmc_helper: Arc<dyn NmcHelper>,
    ) -> Self {
        Self {
            client,
            kernel_mapper,
            registry,
            nmc_helper,
        }
    }

    /// Strips the module from an NMC and drops its `configured` label.
    ///
    /// The `in-use` label stays: only the node agent clears it, once the
    /// module is really unloaded. The write happens whenever the module list
    /// or the labels changed.
    pub async fn remove_module_from_nmc(
        &self,
        nmc: &NodeModulesConfig,
        namespace: &str,
        name: &str,
    ) -> Result<(), Error> {
        let nmc_name = nmc.name();
        let mut modified = nmc.clone();

        self.nmc_helper
            .remove_module_config(&mut modified, namespace, name)
            .map_err(|source| Error::RemoveModuleConfigFailed {
                nmc: nmc_name.clone(),
                source,
            })?;

        if let Some(labels) = modified.metadata.labels.as_mut() {
            labels.remove(&module_configured_label(namespace, name));
        }

        if modified == *nmc {
            return Ok(());
        }

        let patch = nmc_merge_patch(nmc, &modified)?;
        self.client
            .patch_nmc(&nmc_name, &patch)
            .await
            .map_err(|error| Error::PatchNmcFailed(nmc_name.clone(), error))?;

        tracing::info!(nmc = %nmc_name, %namespace, module = %name, "removed module from NodeModulesConfig");
        Ok(())
    }

    async fn remove_module_from_fresh_nmc(
        &self,
        nmc_name: &str,
        namespace: &str,
        name: &str,
    ) -> Result<(), Error> {
        let nmc = self
            .client
            .get_nmc(nmc_name)
            .await
            .map_err(|error| Error::GetNmcFailed(nmc_name.to_string(), error))?;
        match nmc {
            Some(nmc) => self.remove_module_from_nmc(&nmc, namespace, name).await,
            None => Ok(()),
        }
    }

    async fn add_finalizer(&self, module: &Module) -> Result<(), Error> {
        let mut finalizers = module.metadata.finalizers.clone().unwrap_or_default();
        if finalizers.iter().any(|finalizer| finalizer == MODULE_FINALIZER) {
            return Ok(());
        }
        finalizers.push(MODULE_FINALIZER.to_string());
        self.patch_finalizers(module, finalizers).await?;

        tracing::info!(module = %module.name(), "added finalizer");
        Ok(())
    }

    async fn nmc_names_with_label(&self, label: &str) -> Result<Vec<String>, Error> {
        let nmcs = self
            .client
            .list_nmcs(label)
            .await
            .map_err(Error::ListNmcsFailed)?;
        Ok(nmcs.iter().map(|nmc| nmc.name()).collect())
    }

    /// Replaces the finalizer list, conditional on the version it was computed from.
    async fn patch_finalizers(&self, module: &Module, finalizers: Vec<String>) -> Result<(), Error> {
        let (namespace, name) = module_identity(module)?;
        let mut patch = json!({ "metadata": { "finalizers": finalizers } });
        if let Some(resource_version) = &module.metadata.resource_version {
            patch["metadata"]["resourceVersion"] = json!(resource_version);
        }
        self.client
            .patch_module(&namespace, &name, &patch)
            .await
            .map_err(|error| Error::PatchModuleFailed(format!("{}/{}", namespace, name), error))
    }
}

#[async_trait]
impl ReconcilerHelper for ModuleNmcReconcilerHelper {
    async fn get_requested_module(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Module>, Error> {
        self.client
            .get_module(namespace, name)
            .await
            .map_err(|error| Error::GetModuleFailed(format!("{}/{}", namespace, name), error))
    }

    async fn set_finalizer(&self, module: &Module) -> Result<(), Error> {
        match self.add_finalizer(module).await {
            Err(Error::PatchModuleFailed(_, kube::Error::Api(response))) if response.code == 409 => {
                let (namespace, name) = module_identity(module)?;
                tracing::debug!(%namespace, module = %name, "module changed since read, retrying finalizer");
                match self.get_requested_module(&namespace, &name).await? {
                    Some(fresh) => self.add_finalizer(&fresh).await,
                    None => Ok(()),
                }
            }
            res => res,
        }
    }

    async fn finalize_module(&self, module: &Module) -> Result<(), Error> {
        let (namespace, name) = module_identity(module)?;
        let (namespace, name) = (namespace.as_str(), name.as_str());

        let configured = self
            .nmc_names_with_label(&module_configured_label(namespace, name))
            .await?;

        let errors = configured
            .iter()
            .map(|nmc_name| async move {
                self.remove_module_from_fresh_nmc(nmc_name, namespace, name)
                    .await
            })
            .collect::<FuturesUnordered<_>>()
            .filter_map(|res| async move { res.err() })
            .collect::<Vec<_>>()
            .await;
        if !errors.is_empty() {
            return Err(Error::Aggregate(errors));
        }

        let in_use = self
            .nmc_names_with_label(&module_in_use_label(namespace, name))
            .await?;
        if !in_use.is_empty() {
            tracing::info!(
                %namespace,
                module = %name,
                nodes = ?in_use,
                "module still in use, keeping finalizer"
            );
            return Ok(());
        }

        let finalizers = module.metadata.finalizers.clone().unwrap_or_default();
        if !finalizers.iter().any(|finalizer| finalizer == MODULE_FINALIZER) {
            return Ok(());
        }
        let remaining = finalizers
            .into_iter()
            .filter(|finalizer| finalizer != MODULE_FINALIZER)
            .collect();
        self.patch_finalizers(module, remaining).await?;

        tracing::info!(%namespace, module = %name, "removed finalizer");
        Ok(())
    }

    async fn get_nodes_list_by_selector(&self, module: &Module) -> Result<Vec<Node>, Error> {
        self.client
            .list_nodes(&label_selector(&module.spec.selector))
            .await
            .map_err(Error::ListNodesFailed)
    }

    async fn get_nmcs_by_module_set(&self, module: &Module) -> Result<BTreeSet<String>, Error> {
        let (namespace, name) = module_identity(module)?;
        let names = self
            .nmc_names_with_label(&module_configured_label(&namespace, &name))
            .await?;
        Ok(names.into_iter().collect())
    }

    fn prepare_scheduling_data(
        &self,
        module: &Module,
        target_nodes: &[Node],
        current_nmcs: &BTreeSet<String>,
    ) -> SchedulingOutcome {
        let mut outcome = SchedulingOutcome::default();
        let mut targeted = BTreeSet::new();

        for node in target_nodes {
            let node_name = node.name();
            targeted.insert(node_name.clone());

            let resolved = node_kernel_version(node).and_then(|kernel_version| {
                self.kernel_mapper
                    .get_module_loader_data_for_kernel(module, &kernel_version)
            });
            let mld = match resolved {
                Ok(mld) => Some(mld),
                Err(KernelMapperError::NoMatchingKernelMapping(kernel_version)) => {
                    tracing::debug!(node = %node_name, %kernel_version, "no kernel mapping for node");
                    None
                }
                Err(source) => {
                    outcome.errors.push(Error::KernelMappingFailed {
                        node: node_name,
                        source,
                    });
                    continue;
                }
            };

            let nmc_exists = current_nmcs.contains(&node_name);
            outcome.by_node.insert(
                node_name,
                SchedulingData {
                    mld,
                    node: Some(node.clone()),
                    nmc_exists,
                },
            );
        }

        for nmc_name in current_nmcs.difference(&targeted) {
            outcome.by_node.insert(
                nmc_name.clone(),
                SchedulingData {
                    mld: None,
                    node: None,
                    nmc_exists: true,
                },
            );
        }

        outcome
    }

    async fn enable_module_on_node(&self, mld: &ModuleLoaderData, node: &Node) -> Result<(), Error> {
        let auth = RegistryAuthGetter::from_mld(mld);
        let exists = self
            .registry
            .image_exists(&mld.container_image, &mld.registry_tls, &auth)
            .await
            .map_err(|source| Error::ImageCheckFailed {
                image: mld.container_image.clone(),
                source,
            })?;
        if !exists {
            tracing::info!(
                image = %mld.container_image,
                node = %node.name(),
                "image does not exist yet, skipping"
            );
            return Ok(());
        }

        let node_name = node.name();
        let config = mld.module_config();
        let owner_reference = object_to_owner_reference::<Node>(node.metadata.clone())?;

        let existing = self
            .client
            .get_nmc(&node_name)
            .await
            .map_err(|error| Error::GetNmcFailed(node_name.clone(), error))?;

        let mut nmc = existing
            .clone()
            .unwrap_or_else(|| NodeModulesConfig::new(&node_name, NodeModulesConfigSpec::default()));

        self.nmc_helper
            .set_module_config(&mut nmc, mld, &config)
            .map_err(|source| Error::SetModuleConfigFailed {
                nmc: node_name.clone(),
                source,
            })?;

        let labels = nmc.metadata.labels.get_or_insert(Default::default());
        labels.insert(module_configured_label(&mld.namespace, &mld.name), String::new());
        labels.insert(module_in_use_label(&mld.namespace, &mld.name), String::new());

        let owner_references = nmc.metadata.owner_references.get_or_insert(Default::default());
        if !owner_references
            .iter()
            .any(|reference| reference.uid == owner_reference.uid)
        {
            owner_references.push(owner_reference);
        }

        match existing {
            None => {
                self.client
                    .create_nmc(&nmc)
                    .await
                    .map_err(|error| Error::CreateNmcFailed(node_name.clone(), error))?;
                tracing::info!(nmc = %node_name, module = %mld.name, "created NodeModulesConfig");
            }
            Some(existing) if existing == nmc => {
                tracing::debug!(nmc = %node_name, module = %mld.name, "NodeModulesConfig up to date");
            }
            Some(existing) => {
                let patch = nmc_merge_patch(&existing, &nmc)?;
                self.client
                    .patch_nmc(&node_name, &patch)
                    .await
                    .map_err(|error| Error::PatchNmcFailed(node_name.clone(), error))?;
                tracing::info!(nmc = %node_name, module = %mld.name, "patched NodeModulesConfig");
            }
        }

        Ok(())
    }

    async fn disable_module_on_node(
        &self,
        namespace: &str,
        name: &str,
        node_name: &str,
    ) -> Result<(), Error> {
        self.remove_module_from_fresh_nmc(node_name, namespace, name)
            .await
    }
}

fn module_identity(module: &Module) -> Result<(String, String), Error> {
    let namespace = module
        .metadata
        .namespace
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = module
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    Ok((namespace, name))
}

/// `k1=v1,k2=v2`; empty when the selector is empty, which matches every node.
fn label_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(",")
}

/// Merge patch turning `original` into `modified`, conditional on the version of `original`.
fn nmc_merge_patch(
    original: &NodeModulesConfig,
    modified: &NodeModulesConfig,
) -> Result<Value, Error> {
    let nmc_name = original.name();
    let empty = BTreeMap::new();
    let original_labels = original.metadata.labels.as_ref().unwrap_or(&empty);
    let modified_labels = modified.metadata.labels.as_ref().unwrap_or(&empty);

    let mut labels = serde_json::Map::new();
    for key in original_labels.keys() {
        if !modified_labels.contains_key(key) {
            labels.insert(key.clone(), Value::Null);
        }
    }
    for (key, value) in modified_labels {
        if original_labels.get(key) != Some(value) {
            labels.insert(key.clone(), Value::String(value.clone()));
        }
    }

    let mut metadata = serde_json::Map::new();
    if let Some(resource_version) = &original.metadata.resource_version {
        metadata.insert("resourceVersion".to_string(), json!(resource_version));
    }
    if !labels.is_empty() {
        metadata.insert("labels".to_string(), Value::Object(labels));
    }
    if original.metadata.owner_references != modified.metadata.owner_references {
        let owner_references = serde_json::to_value(&modified.metadata.owner_references)
            .map_err(|error| Error::SerializeNmcFailed(nmc_name.clone(), error))?;
        metadata.insert("ownerReferences".to_string(), owner_references);
    }

    let mut patch = json!({ "metadata": metadata });
    if original.spec != modified.spec {
        patch["spec"] = serde_json::to_value(&modified.spec)
            .map_err(|error| Error::SerializeNmcFailed(nmc_name, error))?;
    }
    Ok(patch)
}

fn object_to_owner_reference<K: Resource<DynamicType = ()>>(
    meta: ObjectMeta,
) -> Result<OwnerReference, Error> {
    Ok(OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: meta.name.ok_or(Error::MissingObjectKey(".metadata.name"))?,
        uid: meta.uid.ok_or(Error::MissingObjectKey(".metadata.uid"))?,
        ..OwnerReference::default()
    })
}
