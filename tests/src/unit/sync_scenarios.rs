use super::harness::{path, submission, Harness, RECONNECT};
use std::time::Duration;
use subtrack_core::testing::{FakeBackend, Reply};
use subtrack_core::{Method, Phase, SubmissionStatus, SyncNotice};
use tokio::time::sleep;

fn changed(job: &str, from: SubmissionStatus, to: SubmissionStatus) -> SyncNotice {
    SyncNotice::StatusChanged {
        job_id: job.into(),
        from,
        to,
    }
}

#[tokio::test(start_paused = true)]
async fn pending_to_accepted_with_poll_and_event() {
    let backend = FakeBackend::new();
    backend.route(
        Method::Get,
        &path("sub-1"),
        [
            submission("sub-1", "pending"),
            submission("sub-1", "running"),
            submission("sub-1", "running"),
            submission("sub-1", "accepted"),
        ],
    );
    let mut h = Harness::new(backend);
    h.sync.track("sub-1");

    assert_eq!(
        h.next_notice().await,
        SyncNotice::Seeded {
            job_id: "sub-1".into(),
            status: SubmissionStatus::Pending
        }
    );

    // t=4: poll sees RUNNING.
    sleep(Duration::from_millis(4_500)).await;
    assert_eq!(
        h.next_notice().await,
        changed("sub-1", SubmissionStatus::Pending, SubmissionStatus::Running)
    );
    assert_eq!(h.sync.phase("sub-1"), Some(Phase::Syncing));

    // t=5: event triggers a refetch that still says RUNNING.
    sleep(Duration::from_millis(500)).await;
    assert!(h.events.push_event("sub-1", "status_update"));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(h.backend.count(Method::Get, &path("sub-1")), 3);
    assert!(h.queued_notices().is_empty());

    // t=8: poll sees ACCEPTED.
    sleep(Duration::from_millis(3_000)).await;
    assert_eq!(
        h.next_notice().await,
        changed("sub-1", SubmissionStatus::Running, SubmissionStatus::Accepted)
    );
    assert_eq!(
        h.next_notice().await,
        SyncNotice::Terminal {
            job_id: "sub-1".into(),
            status: SubmissionStatus::Accepted
        }
    );
    assert_eq!(
        h.next_notice().await,
        SyncNotice::Stopped {
            job_id: "sub-1".into()
        }
    );
    assert!(!h.sync.is_tracking("sub-1"));

    // t=9: channel is closed and no timer is left.
    sleep(Duration::from_millis(600)).await;
    assert!(!h.events.is_connected("sub-1"));
    assert!(!h.events.push_event("sub-1", "completed"));
    sleep(Duration::from_secs(30)).await;
    assert_eq!(h.backend.count(Method::Get, &path("sub-1")), 4);
    assert!(h.queued_notices().is_empty());

    let snapshot = h.cache.get("sub-1").expect("snapshot");
    assert_eq!(snapshot.status(), &SubmissionStatus::Accepted);
}

#[tokio::test(start_paused = true)]
async fn untrack_discards_in_flight_fetch() {
    let backend = FakeBackend::new();
    backend.route(
        Method::Get,
        &path("sub-3"),
        [
            submission("sub-3", "pending"),
            submission("sub-3", "accepted").delayed(Duration::from_secs(2)),
        ],
    );
    let mut h = Harness::new(backend);
    h.sync.track("sub-3");
    assert!(matches!(h.next_notice().await, SyncNotice::Seeded { .. }));

    // The t=4 poll is now waiting on a slow response.
    sleep(Duration::from_millis(4_100)).await;
    assert_eq!(h.backend.count(Method::Get, &path("sub-3")), 2);
    assert!(h.sync.untrack("sub-3"));
    assert!(!h.sync.untrack("sub-3"));

    sleep(Duration::from_secs(10)).await;
    assert_eq!(
        h.queued_notices(),
        vec![SyncNotice::Stopped {
            job_id: "sub-3".into()
        }]
    );
    let snapshot = h.cache.get("sub-3").expect("seeded snapshot");
    assert_eq!(snapshot.status(), &SubmissionStatus::Pending);
    assert_eq!(h.backend.count(Method::Get, &path("sub-3")), 2);
    assert!(!h.events.is_connected("sub-3"));
}

#[tokio::test(start_paused = true)]
async fn refused_channel_keeps_a_single_reconnect_timer() {
    let backend = FakeBackend::new();
    backend.route(Method::Get, &path("sub-4"), [submission("sub-4", "running")]);
    let mut h = Harness::new(backend);
    h.events
        .refuse("sub-4", subtrack_core::ApiError::network("connection refused"));
    h.sync.track("sub-4");
    assert!(matches!(h.next_notice().await, SyncNotice::Seeded { .. }));

    sleep(RECONNECT * 4 + Duration::from_secs(2)).await;
    // t=0, 5, 10, 15, 20
    assert_eq!(h.events.attempts("sub-4"), 5);
    // Polling still runs while the channel is down.
    assert_eq!(h.backend.count(Method::Get, &path("sub-4")), 6);
}

#[tokio::test(start_paused = true)]
async fn repeated_drops_reconnect_once_each() {
    let backend = FakeBackend::new();
    backend.route(Method::Get, &path("sub-5"), [submission("sub-5", "running")]);
    let mut h = Harness::new(backend);
    h.sync.track("sub-5");
    assert!(matches!(h.next_notice().await, SyncNotice::Seeded { .. }));

    for drop in 1..=3 {
        sleep(Duration::from_millis(10)).await;
        assert!(h.events.is_connected("sub-5"));
        h.events.drop_connection("sub-5");
        sleep(RECONNECT + Duration::from_millis(10)).await;
        assert_eq!(h.events.attempts("sub-5"), drop + 1);
    }

    let connection_changes: Vec<bool> = {
        let mut seen = Vec::new();
        while let Ok(notice) = h.notices.try_recv() {
            if let SyncNotice::Connection { connected, .. } = notice {
                seen.push(connected);
            }
        }
        seen
    };
    assert_eq!(
        connection_changes,
        vec![true, false, true, false, true, false, true]
    );
}

#[tokio::test(start_paused = true)]
async fn polling_alone_reaches_terminal() {
    let backend = FakeBackend::new();
    backend.route(
        Method::Get,
        &path("sub-6"),
        [
            submission("sub-6", "pending"),
            submission("sub-6", "running"),
            submission("sub-6", "wrong_answer"),
        ],
    );
    let mut h = Harness::without_events(backend);
    h.sync.track("sub-6");

    assert!(matches!(h.next_notice().await, SyncNotice::Seeded { .. }));
    assert!(matches!(h.next_notice().await, SyncNotice::StatusChanged { .. }));
    assert_eq!(
        h.next_notice().await,
        SyncNotice::Terminal {
            job_id: "sub-6".into(),
            status: SubmissionStatus::Rejected
        }
    );
    assert_eq!(h.backend.count(Method::Get, &path("sub-6")), 3);
    assert_eq!(h.events.attempts("sub-6"), 0);
}

#[tokio::test(start_paused = true)]
async fn forbidden_while_syncing_stops_tracking() {
    let backend = FakeBackend::new();
    backend.route(
        Method::Get,
        &path("sub-7"),
        [
            submission("sub-7", "pending"),
            Reply::error(403, "FORBIDDEN", "not yours"),
        ],
    );
    let mut h = Harness::without_events(backend);
    h.sync.track("sub-7");
    assert!(matches!(h.next_notice().await, SyncNotice::Seeded { .. }));

    match h.next_notice().await {
        SyncNotice::FetchFailed { fatal, error, .. } => {
            assert!(fatal);
            assert!(error.as_api().map(|e| e.forbidden()).unwrap_or(false));
        }
        other => panic!("unexpected notice {other:?}"),
    }
    assert!(matches!(h.next_notice().await, SyncNotice::Stopped { .. }));

    sleep(Duration::from_secs(60)).await;
    assert_eq!(h.backend.count(Method::Get, &path("sub-7")), 2);
}

#[tokio::test(start_paused = true)]
async fn retrack_after_terminal_starts_fresh_epoch() {
    let backend = FakeBackend::new();
    backend.route(Method::Get, &path("sub-8"), [submission("sub-8", "accepted")]);
    let mut h = Harness::without_events(backend);

    assert!(h.sync.track("sub-8"));
    assert!(matches!(h.next_notice().await, SyncNotice::Seeded { .. }));
    assert!(matches!(h.next_notice().await, SyncNotice::Terminal { .. }));
    assert!(matches!(h.next_notice().await, SyncNotice::Stopped { .. }));

    assert!(h.sync.track("sub-8"));
    assert!(matches!(h.next_notice().await, SyncNotice::Seeded { .. }));
    assert!(h.cache.get("sub-8").expect("snapshot").is_terminal());
}
