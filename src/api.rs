use k8s_openapi::api::core::v1::LocalObjectReference;

use crate::types::{ModprobeSpec, ModuleConfig, RegistryTls};

/// ModuleLoaderData is a Module resolved against one kernel version.
///
/// It is recomputed on every reconcile pass and never stored as is; only the
/// [`ModuleConfig`] derived from it ends up in a NodeModulesConfig.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModuleLoaderData {
    pub name: String,
    pub namespace: String,
    pub kernel_version: String,
    pub container_image: String,
    pub in_tree_module_to_remove: Option<String>,
    pub modprobe: ModprobeSpec,
    pub image_repo_secret: Option<LocalObjectReference>,
    pub registry_tls: RegistryTls,
}

impl ModuleLoaderData {
    pub fn module_config(&self) -> ModuleConfig {
        ModuleConfig {
            kernel_version: self.kernel_version.clone(),
            container_image: self.container_image.clone(),
            in_tree_module_to_remove: self.in_tree_module_to_remove.clone(),
            modprobe: self.modprobe.clone(),
        }
    }
}
