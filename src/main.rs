mod api;
mod client;
mod config;
mod error;
#[cfg(test)]
mod fake;
mod helper;
mod kernel;
mod nmc;
mod reconcile;
mod registry;
mod types;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use futures_util::stream::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{Context, Controller};
use kube::Client;

use crate::client::{KubeClient, KubeClientImpl};
use crate::config::Config;
use crate::helper::ModuleNmcReconcilerHelper;
use crate::kernel::DefaultKernelMapper;
use crate::nmc::DefaultNmcHelper;
use crate::reconcile::{Data, ModuleNmcReconciler, NodeChangeFilter};
use crate::registry::HttpRegistry;
use crate::types::{Module, NodeModulesConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    config.init_tracing();

    let client = Client::try_default().await?;

    let kube_client: Arc<dyn KubeClient> = Arc::new(KubeClientImpl::new(client.clone()));
    let registry = HttpRegistry::new(kube_client.clone(), config.registry_timeout())?;
    let helper = ModuleNmcReconcilerHelper::new(
        kube_client,
        Arc::new(DefaultKernelMapper),
        Arc::new(registry),
        Arc::new(DefaultNmcHelper),
    );
    let data = Data {
        reconciler: ModuleNmcReconciler::new(Arc::new(helper)),
        error_requeue: config.error_requeue(),
    };

    let module_api = match &config.namespace {
        Some(namespace) => Api::<Module>::namespaced(client.clone(), namespace),
        None => Api::<Module>::all(client.clone()),
    };

    let controller = Controller::new(module_api, ListParams::default());
    let modules = controller.store();
    let node_changes = NodeChangeFilter::default();

    controller
        .watches(
            Api::<NodeModulesConfig>::all(client.clone()),
            ListParams::default(),
            reconcile::modules_for_nmc,
        )
        .watches(
            Api::<Node>::all(client),
            ListParams::default(),
            move |node| reconcile::modules_for_node(&node_changes, &modules, &node),
        )
        .shutdown_on_signal()
        .run(reconcile::reconcile, reconcile::error_policy, Context::new(data))
        .for_each(|res| async move {
            match res {
                Ok(o) => tracing::info!("reconciled {:?}", o),
                Err(e) => tracing::warn!("reconcile failed: {}", e),
            }
        })
        .await;

    tracing::info!("controller terminated");

    Ok(())
}
