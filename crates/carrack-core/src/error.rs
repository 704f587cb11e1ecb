use crate::activator::ActivatorError;
use crate::resolver::ResolveError;
use crate::BundleId;
use carrack_cache::CacheError;
use carrack_manifest::ManifestError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameworkError {
    #[error("invalid lifecycle transition for bundle {bundle}: {reason}")]
    InvalidTransition { bundle: BundleId, reason: String },
    #[error("activator start error in bundle {bundle}: {source}")]
    ActivatorStart {
        bundle: BundleId,
        #[source]
        source: ActivatorError,
    },
    #[error("activator stop error in bundle {bundle}: {source}")]
    ActivatorStop {
        bundle: BundleId,
        #[source]
        source: ActivatorError,
    },
    #[error("activator '{0}' is not registered")]
    ActivatorNotFound(String),
    #[error("resolve error: {0}")]
    Resolve(#[from] ResolveError),
    #[error("bundle symbolic name and version are not unique: {name}:{version}")]
    DuplicateIdentity { name: String, version: String },
    #[error("execution environment not supported: {0}")]
    UnsupportedEnvironment(String),
    #[error("native library does not exist: {0}")]
    MissingNativeLibrary(String),
    #[error("invalid state: {0}")]
    State(String),
    #[error("invalid argument: {0}")]
    Argument(String),
    #[error("security violation: {0}")]
    Security(String),
    #[error("the framework has been shut down")]
    ShuttingDown,
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
}
