//! Per-request authorization against a cluster.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec};
use kdash_core::KdashResult;
use kube::api::{Api, PostParams};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classify_kube_error;
use crate::provider::{CredentialProvider, KubeCredentials};
use crate::registry::ClusterRegistry;

/// The user a request is made on behalf of.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    pub username: String,
    pub uid: Option<String>,
    pub groups: Vec<String>,
    pub extra: BTreeMap<String, Vec<String>>,
}

/// One access question: may `principal` perform `verb` on `resource`?
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessRequest<'a> {
    pub group: &'a str,
    pub resource: &'a str,
    pub namespace: Option<&'a str>,
    pub name: Option<&'a str>,
    pub verb: &'a str,
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn can_access(&self, cluster_id: &str, principal: &Principal, request: &AccessRequest<'_>) -> KdashResult<bool>;
}

/// Permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn can_access(&self, _cluster_id: &str, _principal: &Principal, _request: &AccessRequest<'_>) -> KdashResult<bool> {
        Ok(true)
    }
}

/// Asks the target cluster through a SubjectAccessReview.
pub struct SubjectAccessReviewAuthorizer<P: CredentialProvider<Credentials = KubeCredentials>> {
    registry: Arc<ClusterRegistry<P>>,
}

impl<P: CredentialProvider<Credentials = KubeCredentials>> SubjectAccessReviewAuthorizer<P> {
    pub fn new(registry: Arc<ClusterRegistry<P>>) -> Self {
        Self { registry }
    }
}

pub(crate) fn review_for(principal: &Principal, request: &AccessRequest<'_>) -> SubjectAccessReview {
    let attrs = ResourceAttributes {
        group: if request.group.is_empty() { None } else { Some(request.group.to_string()) },
        resource: Some(request.resource.to_string()),
        namespace: request.namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
        name: request.name.map(str::to_string),
        verb: Some(request.verb.to_string()),
        ..Default::default()
    };
    SubjectAccessReview {
        spec: SubjectAccessReviewSpec {
            user: Some(principal.username.clone()),
            uid: principal.uid.clone(),
            groups: if principal.groups.is_empty() { None } else { Some(principal.groups.clone()) },
            extra: if principal.extra.is_empty() { None } else { Some(principal.extra.clone()) },
            resource_attributes: Some(attrs),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[async_trait]
impl<P: CredentialProvider<Credentials = KubeCredentials>> Authorizer for SubjectAccessReviewAuthorizer<P> {
    async fn can_access(&self, cluster_id: &str, principal: &Principal, request: &AccessRequest<'_>) -> KdashResult<bool> {
        let review = review_for(principal, request);
        let allowed = self
            .registry
            .with_reauthentication(cluster_id, |creds| {
                let review = review.clone();
                async move {
                    let api: Api<SubjectAccessReview> = Api::all(creds.client.clone());
                    let created = api.create(&PostParams::default(), &review).await.map_err(classify_kube_error)?;
                    Ok(created.status.map(|s| s.allowed).unwrap_or(false))
                }
            })
            .await?;
        debug!(cluster = %cluster_id, user = %principal.username, verb = %request.verb, resource = %request.resource, allowed, "access review");
        Ok(allowed)
    }
}

pub const DEFAULT_DECISION_TTL: Duration = Duration::from_secs(30);

const PRUNE_AT: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DecisionKey {
    cluster: String,
    user: String,
    groups: Vec<String>,
    api_group: String,
    resource: String,
    namespace: Option<String>,
    name: Option<String>,
    verb: String,
}

impl DecisionKey {
    fn new(cluster_id: &str, principal: &Principal, request: &AccessRequest<'_>) -> Self {
        let mut groups = principal.groups.clone();
        groups.sort();
        Self {
            cluster: cluster_id.to_string(),
            user: principal.username.clone(),
            groups,
            api_group: request.group.to_string(),
            resource: request.resource.to_string(),
            namespace: request.namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            name: request.name.map(str::to_string),
            verb: request.verb.to_string(),
        }
    }
}

/// Remembers another authorizer's decisions for a fixed time. Errors are never cached.
pub struct CachingAuthorizer<A> {
    inner: A,
    ttl: Duration,
    decisions: Mutex<FxHashMap<DecisionKey, (bool, Instant)>>,
}

impl<A: Authorizer> CachingAuthorizer<A> {
    pub fn new(inner: A) -> Self {
        Self::with_ttl(inner, DEFAULT_DECISION_TTL)
    }

    pub fn with_ttl(inner: A, ttl: Duration) -> Self {
        Self { inner, ttl, decisions: Mutex::new(FxHashMap::default()) }
    }

    fn cached(&self, key: &DecisionKey) -> Option<bool> {
        let decisions = self.decisions.lock().unwrap_or_else(PoisonError::into_inner);
        decisions.get(key).filter(|(_, at)| at.elapsed() < self.ttl).map(|(allowed, _)| *allowed)
    }

    fn remember(&self, key: DecisionKey, allowed: bool) {
        let mut decisions = self.decisions.lock().unwrap_or_else(PoisonError::into_inner);
        if decisions.len() >= PRUNE_AT {
            let ttl = self.ttl;
            decisions.retain(|_, (_, at)| at.elapsed() < ttl);
        }
        decisions.insert(key, (allowed, Instant::now()));
    }
}

#[async_trait]
impl<A: Authorizer> Authorizer for CachingAuthorizer<A> {
    async fn can_access(&self, cluster_id: &str, principal: &Principal, request: &AccessRequest<'_>) -> KdashResult<bool> {
        let key = DecisionKey::new(cluster_id, principal, request);
        if let Some(allowed) = self.cached(&key) {
            counter!("kdash_authz_cache_hits_total", 1);
            return Ok(allowed);
        }
        counter!("kdash_authz_cache_misses_total", 1);
        let allowed = self.inner.can_access(cluster_id, principal, request).await?;
        self.remember(key, allowed);
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdash_core::KdashError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers from a fixed verdict and counts how often it was asked.
    struct Reviews {
        verdict: KdashResult<bool>,
        asked: Arc<AtomicUsize>,
    }

    fn answering(verdict: KdashResult<bool>) -> (Reviews, Arc<AtomicUsize>) {
        let asked = Arc::new(AtomicUsize::new(0));
        (Reviews { verdict, asked: Arc::clone(&asked) }, asked)
    }

    #[async_trait]
    impl Authorizer for Reviews {
        async fn can_access(&self, _cluster_id: &str, _principal: &Principal, _request: &AccessRequest<'_>) -> KdashResult<bool> {
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.verdict.clone()
        }
    }

    fn alice(groups: &[&str]) -> Principal {
        Principal { username: "alice".into(), groups: groups.iter().map(|g| g.to_string()).collect(), ..Default::default() }
    }

    fn list_pods() -> AccessRequest<'static> {
        AccessRequest { resource: "pods", namespace: Some("default"), verb: "list", ..Default::default() }
    }

    #[tokio::test]
    async fn repeated_decision_is_served_from_cache() {
        let (reviews, asked) = answering(Ok(true));
        let authz = CachingAuthorizer::new(reviews);
        assert!(authz.can_access("c1", &alice(&["dev", "ops"]), &list_pods()).await.unwrap());
        // group order does not matter
        assert!(authz.can_access("c1", &alice(&["ops", "dev"]), &list_pods()).await.unwrap());
        assert_eq!(asked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn any_differing_attribute_misses() {
        let (reviews, asked) = answering(Ok(false));
        let authz = CachingAuthorizer::new(reviews);
        let req = list_pods();
        assert!(!authz.can_access("c1", &alice(&[]), &req).await.unwrap());
        authz.can_access("c2", &alice(&[]), &req).await.unwrap();
        authz.can_access("c1", &alice(&["dev"]), &req).await.unwrap();
        authz.can_access("c1", &alice(&[]), &AccessRequest { verb: "watch", ..req.clone() }).await.unwrap();
        authz.can_access("c1", &alice(&[]), &AccessRequest { name: Some("web-1"), ..req.clone() }).await.unwrap();
        assert_eq!(asked.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn decisions_expire() {
        let (reviews, asked) = answering(Ok(true));
        let authz = CachingAuthorizer::with_ttl(reviews, Duration::from_millis(20));
        authz.can_access("c1", &alice(&[]), &list_pods()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        authz.can_access("c1", &alice(&[]), &list_pods()).await.unwrap();
        assert_eq!(asked.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_reviews_are_not_cached() {
        let (reviews, asked) = answering(Err(KdashError::AuthenticationFailed("expired".into())));
        let authz = CachingAuthorizer::new(reviews);
        assert!(authz.can_access("c1", &alice(&[]), &list_pods()).await.is_err());
        assert!(authz.can_access("c1", &alice(&[]), &list_pods()).await.is_err());
        assert_eq!(asked.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn allow_all_allows() {
        let req = AccessRequest { resource: "pods", verb: "list", ..Default::default() };
        assert!(AllowAll.can_access("c1", &Principal::default(), &req).await.unwrap());
    }

    #[test]
    fn review_carries_principal_and_attributes() {
        let principal = Principal { username: "alice".into(), groups: vec!["dev".into()], ..Default::default() };
        let req = AccessRequest { group: "", resource: "pods", namespace: Some("default"), name: Some("web-1"), verb: "get" };
        let review = review_for(&principal, &req);
        assert_eq!(review.spec.user.as_deref(), Some("alice"));
        assert_eq!(review.spec.groups, Some(vec!["dev".to_string()]));
        let attrs = review.spec.resource_attributes.unwrap();
        assert_eq!(attrs.group, None);
        assert_eq!(attrs.namespace.as_deref(), Some("default"));
        assert_eq!(attrs.name.as_deref(), Some("web-1"));
        assert_eq!(attrs.verb.as_deref(), Some("get"));
    }
}
