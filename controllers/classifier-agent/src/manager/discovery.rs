//! Resource type discovery.

use crate::error::ControllerError;
use cluster_client::{ClusterClientTrait, ResourceKind};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Returns the kinds the API server currently serves.
///
/// Group/versions that cannot be enumerated are left out with a warning; only
/// a failure to list the API surface at all is an error.
pub async fn discover_installed_kinds(
    client: &dyn ClusterClientTrait,
) -> Result<HashSet<ResourceKind>, ControllerError> {
    let installed = client
        .list_installed_kinds()
        .await
        .map_err(|e| ControllerError::Discovery(e.to_string()))?;

    if installed.is_partial() {
        warn!(
            "Partial discovery: {} group/versions unreachable: {}",
            installed.unreachable.len(),
            installed.unreachable.join(", ")
        );
    }
    debug!("Discovered {} installed kinds", installed.kinds.len());
    Ok(installed.kinds)
}
