use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;

use crate::types::{Module, NodeModulesConfig};

/// Object store operations the controller relies on.
///
/// `get_*` return `Ok(None)` when the object does not exist. Patches are JSON
/// merge patches; callers put `metadata.resourceVersion` in the patch when the
/// update must only apply to the version they read.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    async fn get_module(&self, namespace: &str, name: &str) -> Result<Option<Module>, kube::Error>;

    async fn patch_module(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), kube::Error>;

    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>, kube::Error>;

    async fn get_nmc(&self, name: &str) -> Result<Option<NodeModulesConfig>, kube::Error>;

    async fn list_nmcs(&self, label_selector: &str) -> Result<Vec<NodeModulesConfig>, kube::Error>;

    async fn create_nmc(&self, nmc: &NodeModulesConfig) -> Result<(), kube::Error>;

    async fn patch_nmc(&self, name: &str, patch: &serde_json::Value) -> Result<(), kube::Error>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error>;
}

pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

async fn get_opt<K>(api: Api<K>, name: &str) -> Result<Option<K>, kube::Error>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(None),
        Err(error) => Err(error),
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_module(&self, namespace: &str, name: &str) -> Result<Option<Module>, kube::Error> {
        get_opt(Api::<Module>::namespaced(self.client.clone(), namespace), name).await
    }

    async fn patch_module(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), kube::Error> {
        Api::<Module>::namespaced(self.client.clone(), namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map(|_| ())
    }

    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>, kube::Error> {
        let list = Api::<Node>::all(self.client.clone())
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn get_nmc(&self, name: &str) -> Result<Option<NodeModulesConfig>, kube::Error> {
        get_opt(Api::<NodeModulesConfig>::all(self.client.clone()), name).await
    }

    async fn list_nmcs(&self, label_selector: &str) -> Result<Vec<NodeModulesConfig>, kube::Error> {
        let list = Api::<NodeModulesConfig>::all(self.client.clone())
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn create_nmc(&self, nmc: &NodeModulesConfig) -> Result<(), kube::Error> {
        Api::<NodeModulesConfig>::all(self.client.clone())
            .create(&PostParams::default(), nmc)
            .await
            .map(|_| ())
    }

    async fn patch_nmc(&self, name: &str, patch: &serde_json::Value) -> Result<(), kube::Error> {
        Api::<NodeModulesConfig>::all(self.client.clone())
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map(|_| ())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error> {
        get_opt(Api::<Secret>::namespaced(self.client.clone(), namespace), name).await
    }
}
