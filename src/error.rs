use thiserror::Error;

use crate::kernel::KernelMapperError;
use crate::nmc::NmcError;
use crate::registry::RegistryError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
    #[error("Failed to get Module {0}: {1}")]
    GetModuleFailed(String, #[source] kube::Error),
    #[error("Failed to patch Module {0}: {1}")]
    PatchModuleFailed(String, #[source] kube::Error),
    #[error("Failed to list nodes: {0}")]
    ListNodesFailed(#[source] kube::Error),
    #[error("Failed to list NodeModulesConfigs: {0}")]
    ListNmcsFailed(#[source] kube::Error),
    #[error("Failed to get NodeModulesConfig {0}: {1}")]
    GetNmcFailed(String, #[source] kube::Error),
    #[error("Failed to create NodeModulesConfig {0}: {1}")]
    CreateNmcFailed(String, #[source] kube::Error),
    #[error("Failed to patch NodeModulesConfig {0}: {1}")]
    PatchNmcFailed(String, #[source] kube::Error),
    #[error("Failed to serialize NodeModulesConfig {0}: {1}")]
    SerializeNmcFailed(String, #[source] serde_json::Error),
    #[error("Failed to resolve kernel mapping for node {node}: {source}")]
    KernelMappingFailed {
        node: String,
        #[source]
        source: KernelMapperError,
    },
    #[error("Failed to check image {image}: {source}")]
    ImageCheckFailed {
        image: String,
        #[source]
        source: RegistryError,
    },
    #[error("Failed to set module config in NodeModulesConfig {nmc}: {source}")]
    SetModuleConfigFailed {
        nmc: String,
        #[source]
        source: NmcError,
    },
    #[error("Failed to remove module config from NodeModulesConfig {nmc}: {source}")]
    RemoveModuleConfigFailed {
        nmc: String,
        #[source]
        source: NmcError,
    },
    #[error("{} error(s) occurred: {}", .0.len(), join(.0))]
    Aggregate(Vec<Error>),
}

fn join(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
