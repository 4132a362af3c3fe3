//! kdash kubehub: cluster registry, credential providers and typed resource watchers.

#![forbid(unsafe_code)]

pub mod authz;
pub mod connection;
pub mod provider;
pub mod registry;
pub mod watcher;

pub use authz::{
    AccessRequest, AllowAll, Authorizer, CachingAuthorizer, Principal, SubjectAccessReviewAuthorizer, DEFAULT_DECISION_TTL,
};
pub use connection::ClusterConnection;
pub use provider::{ClusterCredentials, ClusterDescriptor, CredentialProvider, KubeCredentials, KubeconfigProvider};
pub use registry::{start_all, ClusterRegistry};
pub use watcher::{ResourceWatcher, WatcherConfig, WatcherHandle};

use kdash_core::KdashError;

/// Map a kube client error onto the shared taxonomy.
///
/// 401, and 403 whose reason says the credentials expired, are authentication failures;
/// only those trigger reauthentication.
pub fn classify_kube_error(err: kube::Error) -> KdashError {
    match err {
        kube::Error::Api(resp) => match resp.code {
            401 => KdashError::AuthenticationFailed(resp.message),
            403 if matches!(resp.reason.as_str(), "Expired" | "Unauthorized") => {
                KdashError::AuthenticationFailed(resp.message)
            }
            404 => KdashError::NotFound(resp.message),
            409 => KdashError::AlreadyExists(resp.message),
            _ => KdashError::Internal(format!("{} ({}): {}", resp.reason, resp.code, resp.message)),
        },
        kube::Error::Auth(e) => KdashError::AuthenticationFailed(e.to_string()),
        other => KdashError::from_external(anyhow::Error::new(other)),
    }
}
