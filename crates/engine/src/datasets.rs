//! Datasets
//!
//! A dataset is nothing more than the tag namespace `dataset:<name>` plus
//! the convention that queries are scoped by adding that tag to the
//! filter. Each dataset also gets a registry entity (`type:dataset`) so
//! empty datasets still exist and can be listed.

use entitydb_core::{EntityId, Error, Result};

/// Id of the registry entity backing a dataset
pub fn registry_id(name: &str) -> Result<EntityId> {
    EntityId::new(format!("dataset-{}", name))
}

/// The scoping tag body for a dataset
pub fn scope_tag(name: &str) -> String {
    format!("dataset:{}", name)
}

/// Validate a dataset name
///
/// Names become tag segments, so the tag-body character rules apply and
/// `:` is additionally excluded.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_tag("dataset name must not be empty"));
    }
    if name.contains(':') || name.chars().any(|c| c.is_control() || c == '|') {
        return Err(Error::invalid_tag(format!(
            "dataset name {:?} contains reserved characters",
            name
        )));
    }
    // The registry id has to fit the id length cap.
    registry_id(name).map(|_| ())
}

/// Extract a dataset name from a registry entity id
pub fn name_from_registry_id(id: &EntityId) -> Option<&str> {
    id.as_str().strip_prefix("dataset-")
}
