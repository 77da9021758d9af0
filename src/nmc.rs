//! NodeModulesConfig labels and mutation.
//!
//! Every NodeModulesConfig carries two labels per module. The `configured`
//! label mirrors the presence of the module's entry in `spec.modules` and is
//! maintained by the controller. The `in-use` label is added by the controller
//! when the module is enabled and removed only by the node agent once the
//! module has actually been unloaded.

#[cfg(test)]
use mockall::automock;
use thiserror::Error;

use crate::api::ModuleLoaderData;
use crate::types::{ModuleConfig, NodeModuleSpec, NodeModulesConfig};

const LABEL_PREFIX: &str = "beta.kmm.node.kubernetes.io/";
const CONFIGURED_SUFFIX: &str = ".module-configured";
const IN_USE_SUFFIX: &str = ".module-in-use";

pub fn module_configured_label(namespace: &str, name: &str) -> String {
    format!("{}{}.{}{}", LABEL_PREFIX, namespace, name, CONFIGURED_SUFFIX)
}

pub fn module_in_use_label(namespace: &str, name: &str) -> String {
    format!("{}{}.{}{}", LABEL_PREFIX, namespace, name, IN_USE_SUFFIX)
}

/// Returns the `(namespace, name)` of the module a `configured` or `in-use` label refers to.
///
/// Namespaces cannot contain dots, so the first dot after the prefix separates
/// the namespace from the module name.
pub fn module_from_label(label: &str) -> Option<(String, String)> {
    let rest = label.strip_prefix(LABEL_PREFIX)?;
    let rest = rest
        .strip_suffix(CONFIGURED_SUFFIX)
        .or_else(|| rest.strip_suffix(IN_USE_SUFFIX))?;
    let (namespace, name) = rest.split_once('.')?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some((namespace.to_string(), name.to_string()))
}

#[derive(Debug, Error)]
pub enum NmcError {
    #[error("ModuleLoaderData has no {0}")]
    IncompleteModuleLoaderData(&'static str),
}

/// Edits the module list of a NodeModulesConfig in place. Labels are left alone.
#[cfg_attr(test, automock)]
pub trait NmcHelper: Send + Sync {
    /// Adds the module's entry, or overwrites it if one exists.
    fn set_module_config(
        &self,
        nmc: &mut NodeModulesConfig,
        mld: &ModuleLoaderData,
        config: &ModuleConfig,
    ) -> Result<(), NmcError>;

    /// Drops the module's entry. A missing entry is not an error.
    fn remove_module_config(
        &self,
        nmc: &mut NodeModulesConfig,
        namespace: &str,
        name: &str,
    ) -> Result<(), NmcError>;
}

pub struct DefaultNmcHelper;

impl NmcHelper for DefaultNmcHelper {
    fn set_module_config(
        &self,
        nmc: &mut NodeModulesConfig,
        mld: &ModuleLoaderData,
        config: &ModuleConfig,
    ) -> Result<(), NmcError> {
        if mld.name.is_empty() {
            return Err(NmcError::IncompleteModuleLoaderData("name"));
        }
        if mld.namespace.is_empty() {
            return Err(NmcError::IncompleteModuleLoaderData("namespace"));
        }

        let existing = nmc
            .spec
            .modules
            .iter_mut()
            .find(|module| module.namespace == mld.namespace && module.name == mld.name);

        match existing {
            Some(module) => module.config = config.clone(),
            None => nmc.spec.modules.push(NodeModuleSpec {
                name: mld.name.clone(),
                namespace: mld.namespace.clone(),
                config: config.clone(),
            }),
        }

        Ok(())
    }

    fn remove_module_config(
        &self,
        nmc: &mut NodeModulesConfig,
        namespace: &str,
        name: &str,
    ) -> Result<(), NmcError> {
        nmc.spec
            .modules
            .retain(|module| !(module.namespace == namespace && module.name == name));
        Ok(())
    }
}
