//! Security provider contract.
//!
//! Permission checking is an external collaborator. When no provider is
//! installed, every check passes. Export permission is verified at resolve
//! time; import verification is deliberately deferred.

use crate::bundle::Bundle;
use crate::FrameworkError;
use carrack_manifest::PackageName;
use std::sync::Arc;

pub trait SecurityProvider: Send + Sync {
    /// Vet a bundle at install/update time. An error aborts the operation.
    fn check_bundle(&self, bundle: &Arc<Bundle>) -> Result<(), FrameworkError>;

    /// Whether the bundle may export the given package.
    fn implies_export(&self, bundle: &Arc<Bundle>, package: &PackageName) -> bool;
}
