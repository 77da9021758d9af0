use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::LocalObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ModuleSpec describes how to load a kernel module on a set of nodes
#[derive(Serialize, Deserialize, JsonSchema, CustomResource, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "kmm.sigs.x-k8s.io",
    version = "v1beta1",
    kind = "Module",
    namespaced,
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSpec {
    /// Selects the nodes the kernel module should be loaded on.
    #[serde(default)]
    pub selector: BTreeMap<String, String>,

    /// Describes how the module loader image is chosen for each kernel.
    pub module_loader: ModuleLoaderSpec,

    /// Secret holding the credentials of the registry the module loader images live in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_repo_secret: Option<LocalObjectReference>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleLoaderSpec {
    pub container: ModuleLoaderContainerSpec,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleLoaderContainerSpec {
    /// Arguments handed to modprobe by the node agent.
    pub modprobe: ModprobeSpec,

    /// Kernel version to image mappings, tried in order.
    #[serde(default)]
    pub kernel_mappings: Vec<KernelMapping>,

    /// Image used when the matching mapping does not name one.
    /// May contain `${KERNEL_FULL_VERSION}` and similar variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,

    /// In-tree module the node agent should unload before loading this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_tree_module_to_remove: Option<String>,

    #[serde(default, rename = "registryTLS")]
    pub registry_tls: RegistryTls,
}

/// KernelMapping matches a kernel version either literally or with a regular expression
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KernelMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub literal: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regexp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_tree_module_to_remove: Option<String>,

    #[serde(default, rename = "registryTLS", skip_serializing_if = "Option::is_none")]
    pub registry_tls: Option<RegistryTls>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryTls {
    /// Talk to the registry over plain HTTP.
    #[serde(default)]
    pub insecure: bool,

    /// Accept invalid registry certificates.
    #[serde(default, rename = "insecureSkipTLSVerify")]
    pub insecure_skip_tls_verify: bool,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModprobeSpec {
    /// Name of the kernel module to load.
    pub module_name: String,

    /// Directory modprobe searches for the module, inside the image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<String>,

    /// Raw modprobe arguments, replacing the generated ones when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<ModprobeArgs>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_path: Option<String>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModprobeArgs {
    pub load: Vec<String>,
    pub unload: Vec<String>,
}

/// NodeModulesConfigSpec lists the kernel modules a single node should have loaded.
/// The object is named after the node.
#[derive(Serialize, Deserialize, JsonSchema, CustomResource, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "kmm.sigs.x-k8s.io",
    version = "v1beta1",
    kind = "NodeModulesConfig",
    shortname = "nmc",
    derive = "PartialEq"
)]
#[kube(status = "NodeModulesConfigStatus")]
#[serde(rename_all = "camelCase")]
pub struct NodeModulesConfigSpec {
    #[serde(default)]
    pub modules: Vec<NodeModuleSpec>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeModuleSpec {
    pub name: String,
    pub namespace: String,
    pub config: ModuleConfig,
}

/// ModuleConfig is everything the node agent needs to load one module
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfig {
    pub kernel_version: String,
    pub container_image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_tree_module_to_remove: Option<String>,
    pub modprobe: ModprobeSpec,
}

/// Written by the node agent only.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeModulesConfigStatus {
    #[serde(default)]
    pub modules: Vec<NodeModuleStatus>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeModuleStatus {
    pub name: String,
    pub namespace: String,
    pub config: ModuleConfig,

    /// When the agent last loaded or unloaded the module.
    #[serde(default)]
    pub last_transition_time: Option<Time>,
}
