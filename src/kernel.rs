use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
#[cfg(test)]
use mockall::automock;
use regex::Regex;
use thiserror::Error;

use crate::api::ModuleLoaderData;
use crate::types::{KernelMapping, Module};

#[derive(Debug, Error)]
pub enum KernelMapperError {
    /// Expected outcome: the Module simply has no build for this kernel.
    #[error("no kernel mapping matches kernel {0}")]
    NoMatchingKernelMapping(String),
    #[error("node {0} does not report a kernel version")]
    MissingKernelVersion(String),
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
    #[error("invalid kernel mapping regexp {regexp:?}: {source}")]
    InvalidRegexp {
        regexp: String,
        #[source]
        source: regex::Error,
    },
    #[error("no container image defined for kernel {0}")]
    MissingContainerImage(String),
}

#[cfg_attr(test, automock)]
pub trait KernelMapper: Send + Sync {
    fn get_module_loader_data_for_kernel(
        &self,
        module: &Module,
        kernel_version: &str,
    ) -> Result<ModuleLoaderData, KernelMapperError>;
}

/// Kernel version a node is running, as reported by its kubelet.
pub fn node_kernel_version(node: &Node) -> Result<String, KernelMapperError> {
    node.status
        .as_ref()
        .and_then(|status| status.node_info.as_ref())
        .map(|info| info.kernel_version.trim_end_matches('+'))
        .filter(|version| !version.is_empty())
        .map(str::to_string)
        .ok_or_else(|| KernelMapperError::MissingKernelVersion(node.name()))
}

pub struct DefaultKernelMapper;

impl DefaultKernelMapper {
    fn find_mapping<'a>(
        mappings: &'a [KernelMapping],
        kernel_version: &str,
    ) -> Result<&'a KernelMapping, KernelMapperError> {
        for mapping in mappings {
            if mapping.literal.as_deref() == Some(kernel_version) {
                return Ok(mapping);
            }
            if let Some(regexp) = mapping.regexp.as_deref() {
                let re = Regex::new(regexp).map_err(|source| KernelMapperError::InvalidRegexp {
                    regexp: regexp.to_string(),
                    source,
                })?;
                if re.is_match(kernel_version) {
                    return Ok(mapping);
                }
            }
        }
        Err(KernelMapperError::NoMatchingKernelMapping(
            kernel_version.to_string(),
        ))
    }
}

impl KernelMapper for DefaultKernelMapper {
    fn get_module_loader_data_for_kernel(
        &self,
        module: &Module,
        kernel_version: &str,
    ) -> Result<ModuleLoaderData, KernelMapperError> {
        let name = module
            .metadata
            .name
            .clone()
            .ok_or(KernelMapperError::MissingObjectKey(".metadata.name"))?;
        let namespace = module
            .metadata
            .namespace
            .clone()
            .ok_or(KernelMapperError::MissingObjectKey(".metadata.namespace"))?;
        let container = &module.spec.module_loader.container;

        let mapping = Self::find_mapping(&container.kernel_mappings, kernel_version)?;

        let image = mapping
            .container_image
            .as_deref()
            .or(container.container_image.as_deref())
            .filter(|image| !image.is_empty())
            .ok_or_else(|| KernelMapperError::MissingContainerImage(kernel_version.to_string()))?;

        Ok(ModuleLoaderData {
            container_image: substitute_variables(image, kernel_version, &namespace, &name),
            in_tree_module_to_remove: mapping
                .in_tree_module_to_remove
                .clone()
                .or_else(|| container.in_tree_module_to_remove.clone()),
            registry_tls: mapping
                .registry_tls
                .clone()
                .unwrap_or_else(|| container.registry_tls.clone()),
            modprobe: container.modprobe.clone(),
            image_repo_secret: module.spec.image_repo_secret.clone(),
            kernel_version: kernel_version.to_string(),
            name,
            namespace,
        })
    }
}

fn substitute_variables(image: &str, kernel_version: &str, namespace: &str, name: &str) -> String {
    // 5.14.0-284.el9.x86_64 -> ("5", "14", "0")
    let parts = Regex::new(r"^(\d+)\.(\d+)\.(\d+)")
        .ok()
        .and_then(|re| re.captures(kernel_version))
        .map(|caps| {
            (
                caps[1].to_string(),
                caps[2].to_string(),
                caps[3].to_string(),
            )
        });

    let mut out = image
        .replace("${KERNEL_FULL_VERSION}", kernel_version)
        .replace("${KERNEL_VERSION}", kernel_version)
        .replace("${MOD_NAMESPACE}", namespace)
        .replace("${MOD_NAME}", name);

    if let Some((x, y, z)) = parts {
        out = out
            .replace("${KERNEL_XYZ}", &format!("{}.{}.{}", x, y, z))
            .replace("${KERNEL_X}", &x)
            .replace("${KERNEL_Y}", &y)
            .replace("${KERNEL_Z}", &z);
    }

    out
}
