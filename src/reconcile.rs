use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use kube::runtime::controller::{Context, ReconcilerAction};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use tracing::Instrument;

use crate::error::Error;
use crate::helper::{ReconcilerHelper, SchedulingOutcome};
use crate::kernel::node_kernel_version;
use crate::nmc::module_from_label;
use crate::types::{Module, NodeModulesConfig};

pub struct Data {
    pub reconciler: ModuleNmcReconciler,
    pub error_requeue: Duration,
}

/// Drives the NodeModulesConfigs of every node towards what one Module asks for.
pub struct ModuleNmcReconciler {
    helper: Arc<dyn ReconcilerHelper>,
}

impl ModuleNmcReconciler {
    pub fn new(helper: Arc<dyn ReconcilerHelper>) -> Self {
        Self { helper }
    }

    pub async fn reconcile_module(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let module = match self.helper.get_requested_module(namespace, name).await? {
            Some(module) => module,
            None => {
                tracing::info!("module not found, nothing to do");
                return Ok(());
            }
        };

        if module.metadata.deletion_timestamp.is_some() {
            tracing::info!("module is being deleted, finalizing");
            return self.helper.finalize_module(&module).await;
        }

        self.helper.set_finalizer(&module).await?;

        let target_nodes = self.helper.get_nodes_list_by_selector(&module).await?;
        let current_nmcs = self.helper.get_nmcs_by_module_set(&module).await?;

        let SchedulingOutcome { by_node, errors } =
            self.helper
                .prepare_scheduling_data(&module, &target_nodes, &current_nmcs);

        let mut first_error = None;
        for (node_name, data) in &by_node {
            let res = match (&data.mld, &data.node) {
                (Some(mld), Some(node)) => self.helper.enable_module_on_node(mld, node).await,
                _ if data.nmc_exists => {
                    self.helper
                        .disable_module_on_node(namespace, name, node_name)
                        .await
                }
                _ => Ok(()),
            };
            if let Err(error) = res {
                tracing::warn!(node = %node_name, %error, "failed to converge node");
                first_error.get_or_insert(error);
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }
        if !errors.is_empty() {
            return Err(Error::Aggregate(errors));
        }
        Ok(())
    }
}

pub async fn reconcile(module: Arc<Module>, ctx: Context<Data>) -> Result<ReconcilerAction, Error> {
    let namespace = module
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = module.name();
    let span = tracing::info_span!("reconcile", %namespace, module = %name);

    ctx.get_ref()
        .reconciler
        .reconcile_module(&namespace, &name)
        .instrument(span)
        .await?;

    Ok(ReconcilerAction {
        requeue_after: None,
    })
}

pub fn error_policy(error: &Error, ctx: Context<Data>) -> ReconcilerAction {
    tracing::error!(%error);
    ReconcilerAction {
        requeue_after: Some(ctx.get_ref().error_requeue),
    }
}

/// Modules named by the `configured` or `in-use` labels of an NMC.
pub fn modules_for_nmc(nmc: NodeModulesConfig) -> Vec<ObjectRef<Module>> {
    nmc.labels()
        .keys()
        .filter_map(|label| module_from_label(label))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|(namespace, name)| ObjectRef::new(&name).within(&namespace))
        .collect()
}

/// Every Module in the controller's cache.
pub fn all_modules(store: &Store<Module>) -> Vec<ObjectRef<Module>> {
    store
        .state()
        .iter()
        .filter_map(|module| {
            let namespace = module.namespace()?;
            Some(ObjectRef::new(&module.name()).within(&namespace))
        })
        .collect()
}

/// The parts of a Node that decide which Modules it gets and which build.
#[derive(Debug, PartialEq)]
struct NodeFingerprint {
    uid: Option<String>,
    labels: BTreeMap<String, String>,
    kernel_version: Option<String>,
    deleting: bool,
}

impl NodeFingerprint {
    fn of(node: &Node) -> Self {
        Self {
            uid: node.metadata.uid.clone(),
            labels: node.metadata.labels.clone().unwrap_or_default(),
            kernel_version: node_kernel_version(node).ok(),
            deleting: node.metadata.deletion_timestamp.is_some(),
        }
    }
}

/// Drops Node events that cannot change scheduling, such as status heartbeats.
#[derive(Default)]
pub struct NodeChangeFilter {
    seen: Mutex<BTreeMap<String, NodeFingerprint>>,
}

impl NodeChangeFilter {
    /// Records the node and reports whether it differs from the last recorded version.
    pub fn changed(&self, node: &Node) -> bool {
        let fingerprint = NodeFingerprint::of(node);
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        if seen.get(&node.name()) == Some(&fingerprint) {
            return false;
        }
        seen.insert(node.name(), fingerprint);
        true
    }
}

/// Every cached Module, when the Node changed in a way that matters.
pub fn modules_for_node(
    filter: &NodeChangeFilter,
    store: &Store<Module>,
    node: &Node,
) -> Vec<ObjectRef<Module>> {
    if !filter.changed(node) {
        return Vec::new();
    }
    all_modules(store)
}
