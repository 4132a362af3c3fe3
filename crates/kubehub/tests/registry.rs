#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kdash_core::{ClusterStatus, KdashError, KdashResult};
use kdash_kubehub::{start_all, ClusterCredentials, ClusterDescriptor, ClusterRegistry, CredentialProvider};

#[derive(Debug, Clone)]
struct FakeCreds {
    token: usize,
    healthy: bool,
}

#[async_trait]
impl ClusterCredentials for FakeCreds {
    fn api_url(&self) -> Option<String> {
        Some(format!("https://fake/{}", self.token))
    }

    async fn probe(&self) -> KdashResult<()> {
        if self.healthy {
            Ok(())
        } else {
            Err(KdashError::Internal("connection refused".into()))
        }
    }
}

#[derive(Default)]
struct FakeProvider {
    auth_calls: AtomicUsize,
    reject: AtomicBool,
    unhealthy: AtomicBool,
}

#[async_trait]
impl CredentialProvider for FakeProvider {
    type Credentials = FakeCreds;

    async fn authenticate(&self, cluster_id: &str) -> KdashResult<FakeCreds> {
        let n = self.auth_calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(10)).await;
        if self.reject.load(Ordering::SeqCst) {
            return Err(KdashError::Internal(format!("no credentials for {}", cluster_id)));
        }
        Ok(FakeCreds { token: n, healthy: !self.unhealthy.load(Ordering::SeqCst) })
    }

    async fn discover_clusters(&self) -> KdashResult<Vec<ClusterDescriptor>> {
        Ok(["c2", "c1"]
            .iter()
            .map(|id| ClusterDescriptor { id: id.to_string(), api_url: None, kubeconfig_path: None })
            .collect())
    }
}

fn registry() -> Arc<ClusterRegistry<FakeProvider>> {
    Arc::new(ClusterRegistry::new(FakeProvider::default()))
}

#[tokio::test]
async fn register_is_lazy_and_duplicates_are_rejected() {
    let reg = registry();
    assert!(reg.register("c1"));
    assert!(!reg.register("c1"));
    assert!(matches!(reg.register_strict("c1"), Err(KdashError::AlreadyExists(_))));
    assert_eq!(reg.provider().auth_calls.load(Ordering::SeqCst), 0);
    assert_eq!(reg.cluster_infos()[0].status, ClusterStatus::Registered);
}

#[tokio::test]
async fn unknown_cluster_is_not_found() {
    let reg = registry();
    assert!(matches!(reg.get_connection("nope").await, Err(KdashError::NotFound(_))));
    assert!(matches!(reg.deregister("nope"), Err(KdashError::NotFound(_))));
}

#[tokio::test]
async fn concurrent_first_use_authenticates_once() {
    let reg = registry();
    reg.register("c1");
    let calls = (0..8).map(|_| {
        let reg = Arc::clone(&reg);
        tokio::spawn(async move { reg.credentials("c1").await.map(|c| c.token) })
    });
    let tokens: Vec<usize> = futures::future::join_all(calls).await.into_iter().map(|r| r.unwrap().unwrap()).collect();
    assert!(tokens.iter().all(|t| *t == 1));
    assert_eq!(reg.provider().auth_calls.load(Ordering::SeqCst), 1);
    let info = &reg.cluster_infos()[0];
    assert_eq!(info.status, ClusterStatus::Authenticated);
    assert_eq!(info.api_url, "https://fake/1");
}

#[tokio::test]
async fn provider_failure_surfaces_as_authentication_failed() {
    let reg = registry();
    reg.register("c1");
    reg.provider().reject.store(true, Ordering::SeqCst);
    let err = reg.get_connection("c1").await.unwrap_err();
    assert!(err.is_auth());
    assert_eq!(reg.cluster_infos()[0].status, ClusterStatus::Registered);
}

#[tokio::test]
async fn auth_error_triggers_single_reauth_and_retry() {
    let reg = registry();
    reg.register("c1");
    let attempts = AtomicUsize::new(0);
    let out = reg
        .with_reauthentication("c1", |creds| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(KdashError::AuthenticationFailed("token expired".into()))
                } else {
                    Ok(creds.token)
                }
            }
        })
        .await
        .unwrap();
    assert_eq!(out, 2, "second attempt runs with fresh credentials");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(reg.provider().auth_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn persistent_auth_error_is_returned_after_one_retry() {
    let reg = registry();
    reg.register("c1");
    let attempts = AtomicUsize::new(0);
    let err = reg
        .with_reauthentication("c1", |_creds| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(KdashError::AuthenticationFailed("Unauthorized".into())) }
        })
        .await
        .unwrap_err();
    assert!(err.is_auth());
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn non_auth_errors_are_not_retried() {
    let reg = registry();
    reg.register("c1");
    let attempts = AtomicUsize::new(0);
    let err = reg
        .with_reauthentication("c1", |_creds| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(KdashError::NotFound("pod web-1".into())) }
        })
        .await
        .unwrap_err();
    assert!(matches!(err, KdashError::NotFound(_)));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(reg.provider().auth_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn deregister_cancels_cluster_scope() {
    let reg = registry();
    reg.register("c1");
    let conn = reg.get_connection("c1").await.unwrap();
    let token = conn.cancel_token();
    conn.mark_running();
    reg.deregister("c1").unwrap();
    assert!(token.is_cancelled());
    assert!(!conn.is_running());
    assert!(reg.list_clusters().is_empty());
}

#[tokio::test]
async fn stop_all_cancels_and_empties_registry() {
    let reg = registry();
    reg.register("a");
    reg.register("b");
    let tokens: Vec<_> = reg.connections().iter().map(|c| c.cancel_token()).collect();
    reg.stop_all();
    assert!(tokens.iter().all(|t| t.is_cancelled()));
    assert!(reg.list_clusters().is_empty());
    // a second sweep over nothing is not an error
    reg.stop_all();
    assert!(reg.register("a"));
}

#[tokio::test]
async fn health_does_not_authenticate() {
    let reg = registry();
    reg.register("cold");
    reg.register("warm");
    reg.get_connection("warm").await.unwrap();
    let health = reg.check_health().await;
    assert_eq!(health, vec![("cold".to_string(), false), ("warm".to_string(), true)]);
    assert_eq!(reg.provider().auth_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_probe_reports_unhealthy() {
    let reg = registry();
    reg.provider().unhealthy.store(true, Ordering::SeqCst);
    reg.register("c1");
    reg.get_connection("c1").await.unwrap();
    assert_eq!(reg.check_health().await, vec![("c1".to_string(), false)]);
}

#[tokio::test]
async fn discovery_registers_new_clusters_only() {
    let reg = registry();
    reg.register("c1");
    let added = reg.discover_and_register().await.unwrap();
    assert_eq!(added, vec!["c2".to_string()]);
    assert_eq!(reg.list_clusters(), vec!["c1".to_string(), "c2".to_string()]);
}

#[tokio::test]
async fn start_all_runs_every_cluster_and_aggregates_failures() {
    let started = Arc::new(AtomicUsize::new(0));
    let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    let err = start_all(ids, |id| {
        let started = Arc::clone(&started);
        async move {
            started.fetch_add(1, Ordering::SeqCst);
            if id == "b" {
                Err(KdashError::NotReady("b not synced".into()))
            } else {
                Ok(())
            }
        }
    })
    .await
    .unwrap_err();
    assert_eq!(started.load(Ordering::SeqCst), 3);
    let msg = err.to_string();
    assert!(msg.contains("b: not_ready"), "{}", msg);
    assert!(!msg.contains("a:"));
}
