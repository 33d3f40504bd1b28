use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use subtrack_core::testing::{FakeBackend, FakeEventSource, Reply};
use subtrack_core::{
    ApiClient, Credential, EventChannel, JudgeApi, MemoryCredentialStore, ReconnectPolicy,
    SyncNotice, SyncOptions, Synchronizer, TransportOptions, ViewCache,
};
use tokio::sync::mpsc::UnboundedReceiver;

pub const RECONNECT: Duration = Duration::from_secs(5);

pub fn submission(id: &str, status: &str) -> Reply {
    Reply::ok(json!({ "id": id, "status": status, "problem_id": "p-1" }))
}

pub fn path(id: &str) -> String {
    format!("/submissions/{id}")
}

/// A synchronizer wired to in-process fakes.
pub struct Harness {
    pub backend: Arc<FakeBackend>,
    pub events: Arc<FakeEventSource>,
    pub store: MemoryCredentialStore,
    pub api: JudgeApi,
    pub cache: ViewCache,
    pub sync: Synchronizer,
    pub notices: UnboundedReceiver<SyncNotice>,
}

impl Harness {
    pub fn new(backend: FakeBackend) -> Self {
        Self::build(backend, true)
    }

    pub fn without_events(backend: FakeBackend) -> Self {
        Self::build(backend, false)
    }

    fn build(backend: FakeBackend, with_events: bool) -> Self {
        let backend = Arc::new(backend);
        let events = Arc::new(FakeEventSource::new());
        let store = MemoryCredentialStore::with_credential(
            Credential::new("stale").with_refresh_token("refresh-1"),
        );
        let client = ApiClient::new(
            backend.clone(),
            Arc::new(store.clone()),
            TransportOptions::default(),
        );
        let api = JudgeApi::new(client);
        let cache = ViewCache::new();
        let channel =
            with_events.then(|| EventChannel::new(events.clone(), ReconnectPolicy::fixed(RECONNECT)));
        let (sync, notices) = Synchronizer::new(
            Arc::new(api.clone()),
            channel,
            cache.clone(),
            SyncOptions::default(),
        );
        Self {
            backend,
            events,
            store,
            api,
            cache,
            sync,
            notices,
        }
    }

    /// Next notice other than a connection change.
    pub async fn next_notice(&mut self) -> SyncNotice {
        loop {
            match self.notices.recv().await.expect("notice channel open") {
                SyncNotice::Connection { .. } => continue,
                notice => return notice,
            }
        }
    }

    /// Notices already queued, connection changes excluded.
    pub fn queued_notices(&mut self) -> Vec<SyncNotice> {
        let mut out = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            if !matches!(notice, SyncNotice::Connection { .. }) {
                out.push(notice);
            }
        }
        out
    }
}
