use super::harness::{path, Harness};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use subtrack_core::testing::{FakeBackend, Reply};
use subtrack_core::transport::{HttpRequest, REFRESH_PATH};
use subtrack_core::{CredentialStore, Method, SubmissionStatus, SyncNotice};

/// Rejects the stale token, issues `fresh` on refresh, serves any submission
/// id to the fresh token.
fn rotating_backend(refreshes: Arc<AtomicUsize>) -> FakeBackend {
    FakeBackend::with_handler(move |request: &HttpRequest| {
        if request.path == REFRESH_PATH {
            refreshes.fetch_add(1, Ordering::SeqCst);
            assert_eq!(request.body, Some(json!({"refresh_token": "refresh-1"})));
            assert!(request.authorization.is_none());
            return Reply::ok(json!({
                "tokens": {"access_token": "fresh", "refresh_token": "refresh-2", "expires_in": 900}
            }))
            .delayed(Duration::from_millis(50));
        }
        if request.authorization.as_deref() != Some("Bearer fresh") {
            return Reply::error(401, "UNAUTHORIZED", "token expired");
        }
        let id = request.path.trim_start_matches("/submissions/");
        Reply::ok(json!({"id": id, "status": "accepted"}))
    })
}

#[tokio::test]
async fn expired_credential_is_refreshed_and_replayed() {
    let refreshes = Arc::new(AtomicUsize::new(0));
    let h = Harness::without_events(rotating_backend(refreshes.clone()));

    let submission = h.api.get_submission("sub-2").await.expect("replayed request");
    assert_eq!(submission.status, SubmissionStatus::Accepted);

    assert_eq!(h.backend.count(Method::Get, &path("sub-2")), 2);
    assert_eq!(h.backend.count(Method::Post, REFRESH_PATH), 1);
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);

    let stored = h.store.get().expect("credential kept");
    assert_eq!(stored.access_token, "fresh");
    assert_eq!(stored.refresh_token.as_deref(), Some("refresh-2"));
    assert!(stored.expires_at.is_some());

    let calls = h.backend.calls();
    let ids: HashSet<_> = calls.iter().map(|c| c.request_id.clone()).collect();
    assert_eq!(ids.len(), calls.len(), "every attempt gets its own request id");
}

#[tokio::test]
async fn concurrent_requests_share_one_refresh() {
    let refreshes = Arc::new(AtomicUsize::new(0));
    let h = Harness::without_events(rotating_backend(refreshes.clone()));

    let requests = (0..10).map(|i| {
        let api = h.api.clone();
        async move { api.get_submission(&format!("sub-{i}")).await }
    });
    let results = futures::future::join_all(requests).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(h.backend.count(Method::Post, REFRESH_PATH), 1);
}

#[tokio::test]
async fn trackers_hitting_401_together_refresh_once() {
    let refreshes = Arc::new(AtomicUsize::new(0));
    let mut h = Harness::without_events(rotating_backend(refreshes.clone()));

    for i in 0..5 {
        h.sync.track(&format!("sub-{i}"));
    }
    let mut seeded = HashSet::new();
    while seeded.len() < 5 {
        if let SyncNotice::Seeded { job_id, .. } = h.next_notice().await {
            seeded.insert(job_id);
        }
    }
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_refresh_ends_the_session() {
    let backend = FakeBackend::new();
    backend.route(
        Method::Get,
        &path("sub-9"),
        [Reply::error(401, "UNAUTHORIZED", "token expired")],
    );
    backend.route(
        Method::Post,
        REFRESH_PATH,
        [Reply::error(401, "INVALID_REFRESH_TOKEN", "refresh token revoked")],
    );
    let h = Harness::without_events(backend);
    let mut session = h.api.client().session().subscribe();

    let err = h.api.get_submission("sub-9").await.expect_err("unauthorized");
    assert!(err.as_api().map(|e| e.unauthorized()).unwrap_or(false));
    assert!(h.store.get().is_none());
    assert!(session.try_recv().is_ok());
    assert_eq!(h.backend.count(Method::Get, &path("sub-9")), 1);
}
