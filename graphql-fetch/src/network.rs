//! Cache instructions handed to the environment's network layer.

use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::Value;

/// Cache instructions delivered alongside an operation to the environment's
/// network layer.
///
/// [`fetch_query`](crate::fetch_query) always resolves a full `CacheConfig`
/// before touching the network: it starts from this type's defaults and
/// applies the caller's [`CacheConfigOverride`] field by field.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Bypass response caches and require an up-to-date answer from the
    /// server. Defaults to `true`.
    pub force: bool,

    /// Correlation identifier threaded through to the network layer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,

    /// Free-form instructions interpreted by custom network layers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            force: true,
            transaction_id: None,
            metadata: None,
        }
    }
}

impl CacheConfig {
    /// Apply caller overrides on top of this configuration, field by field.
    /// Fields the caller left unset keep their current value.
    pub fn merged_with(mut self, overrides: &CacheConfigOverride) -> Self {
        if let Some(force) = overrides.force {
            self.force = force;
        }
        if let Some(transaction_id) = &overrides.transaction_id {
            self.transaction_id = Some(transaction_id.clone());
        }
        if let Some(metadata) = &overrides.metadata {
            self.metadata = Some(metadata.clone());
        }
        self
    }
}

/// Caller-supplied adjustments to the default [`CacheConfig`].
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfigOverride {
    /// Override for [`CacheConfig::force`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,

    /// Override for [`CacheConfig::transaction_id`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,

    /// Override for [`CacheConfig::metadata`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[buildstructor::buildstructor]
impl CacheConfigOverride {
    /// Builds a partial cache configuration.
    #[builder(visibility = "pub")]
    fn new(
        force: Option<bool>,
        transaction_id: Option<String>,
        metadata: Option<Value>,
    ) -> Self {
        Self {
            force,
            transaction_id,
            metadata,
        }
    }
}
