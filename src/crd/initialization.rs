use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub static MANAGER_NAME: &str = "ocsinitialization-controller";

/// Singleton object whose presence drives one-time provisioning of
/// cluster-wide storage defaults.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "ocs.openshift.io",
    version = "v1",
    kind = "OCSInitialization",
    namespaced,
    shortname = "ocsinit"
)]
#[kube(status = "OCSInitializationStatus", derive = "PartialEq")]
pub struct OCSInitializationSpec {}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OCSInitializationStatus {
    /// Set once the dependent resources have been provisioned
    #[serde(default)]
    pub initialized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl OCSInitialization {
    pub fn is_initialized(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.initialized)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.error_message.as_deref())
    }

    /// Copy of this object with only `status.errorMessage` changed
    pub fn with_error_message(&self, message: &str) -> Self {
        let mut updated = self.clone();
        let status = updated.status.get_or_insert_with(Default::default);
        status.error_message = Some(message.to_string());
        updated
    }

    /// Copy of this object with `status.initialized` set
    pub fn mark_initialized(&self) -> Self {
        let mut updated = self.clone();
        updated.status.get_or_insert_with(Default::default).initialized = true;
        updated
    }
}
