use std::collections::BTreeSet;
use std::path::Path;

use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;
use serde::Deserialize;

use crate::{crd::OCSInitialization, Error, Result};

/// StorageClasses provisioned on first initialization. Nothing is shipped by
/// default; manifests come from a YAML file.
#[derive(Clone, Debug, Default)]
pub struct DesiredState {
    storage_classes: Vec<StorageClass>,
}

impl DesiredState {
    pub fn new(storage_classes: Vec<StorageClass>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for sc in &storage_classes {
            let name = sc
                .metadata
                .name
                .as_deref()
                .filter(|n| !n.is_empty())
                .ok_or_else(|| Error::ConfigError("StorageClass without a name".into()))?;
            if !seen.insert(name.to_string()) {
                return Err(Error::ConfigError(format!("duplicate StorageClass `{name}`")));
            }
        }
        Ok(Self { storage_classes })
    }

    /// Parse a multi-document YAML stream of StorageClass manifests
    pub fn from_yaml(text: &str) -> Result<Self> {
        let mut storage_classes = Vec::new();
        for document in serde_yaml::Deserializer::from_str(text) {
            let value = serde_yaml::Value::deserialize(document).map_err(Error::YamlError)?;
            if value.is_null() {
                continue;
            }
            let sc: StorageClass = serde_yaml::from_value(value).map_err(Error::YamlError)?;
            storage_classes.push(sc);
        }
        Self::new(storage_classes)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(Error::IoError)?;
        Self::from_yaml(&text).map_err(|e| Error::ConfigError(format!("{}: {e}", path.display())))
    }

    /// StorageClasses that should exist once `_init` has been provisioned, in
    /// the order they are to be applied.
    pub fn storage_classes(&self, _init: &OCSInitialization) -> Vec<StorageClass> {
        self.storage_classes
            .iter()
            .cloned()
            .map(|mut sc| {
                // cluster scoped
                sc.metadata.namespace = None;
                sc
            })
            .collect()
    }

    pub fn storage_class_names(&self) -> Vec<String> {
        self.storage_classes.iter().map(|sc| sc.name_any()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.storage_classes.is_empty()
    }
}
