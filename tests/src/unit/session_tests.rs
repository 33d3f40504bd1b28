use serde_json::json;
use std::sync::Arc;
use subtrack::ClientContext;
use subtrack_core::testing::{FakeBackend, Reply};
use subtrack_core::transport::REFRESH_PATH;
use subtrack_core::{
    Credential, CredentialStore, FileCredentialStore, Method, SessionEvent, Settings,
};
use tempfile::TempDir;

fn test_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

fn build_context(backend: FakeBackend, store: Arc<FileCredentialStore>) -> (ClientContext, Arc<FakeBackend>) {
    let backend = Arc::new(backend);
    let context = ClientContext::with_parts(Settings::default(), backend.clone(), store);
    (context, backend)
}

#[test]
fn login_then_refresh_persists_to_disk() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let path = temp_dir.path().join("credentials.json");

    let backend = FakeBackend::new();
    backend.route(
        Method::Post,
        "/auth/login",
        [Reply::ok(json!({
            "user": {"id": "u-1", "username": "grace", "roles": ["user"]},
            "tokens": {"access_token": "first", "refresh_token": "r-1", "expires_in": 900}
        }))],
    );
    backend.route(
        Method::Post,
        REFRESH_PATH,
        [Reply::ok(json!({"tokens": {"access_token": "second"}}))],
    );
    let (context, _backend) = build_context(backend, Arc::new(FileCredentialStore::open(&path)));
    assert!(!context.is_signed_in());

    let user = runtime
        .block_on(context.api.login("grace", "secret"))
        .expect("login");
    assert_eq!(user.username, "grace");
    assert!(context.is_signed_in());

    let stale = FileCredentialStore::open(&path).get();
    runtime
        .block_on(context.api.client().refresh(stale.as_ref()))
        .expect("refresh");

    let reopened = FileCredentialStore::open(&path).get().expect("persisted");
    assert_eq!(reopened.access_token, "second");
    assert_eq!(reopened.refresh_token.as_deref(), Some("r-1"));
}

#[test]
fn rejected_refresh_clears_file_and_signals_logout() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let path = temp_dir.path().join("credentials.json");
    let store = Arc::new(FileCredentialStore::open(&path));
    store.set(Credential::new("expired").with_refresh_token("revoked"));

    let backend = FakeBackend::new();
    backend.route(
        Method::Get,
        "/problems",
        [Reply::error(401, "UNAUTHORIZED", "token expired")],
    );
    backend.route(
        Method::Post,
        REFRESH_PATH,
        [Reply::error(401, "INVALID_REFRESH_TOKEN", "revoked")],
    );
    let (context, backend) = build_context(backend, store);
    let mut session = context.session.subscribe();

    let err = runtime
        .block_on(context.api.list_problems())
        .expect_err("session over");
    assert_eq!(err.user_message().title, "Not signed in");
    assert!(!path.exists());
    assert!(!context.is_signed_in());
    assert!(matches!(
        session.try_recv(),
        Ok(SessionEvent::Invalidated { .. })
    ));
    assert_eq!(backend.count(Method::Post, REFRESH_PATH), 1);
}

#[test]
fn disabled_events_build_polling_only_synchronizer() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let mut settings = Settings::default();
    settings.sync.events_enabled = false;

    let backend = Arc::new(FakeBackend::new());
    backend.route(
        Method::Get,
        "/submissions/s-1",
        [Reply::ok(json!({"id": "s-1", "status": "completed"}))],
    );
    let store = Arc::new(FileCredentialStore::open(temp_dir.path().join("c.json")));
    let context = ClientContext::with_parts(settings, backend.clone(), store);

    runtime.block_on(async {
        let (sync, mut notices) = context.synchronizer().expect("synchronizer");
        sync.track("s-1");
        let mut terminal = false;
        while let Some(notice) = notices.recv().await {
            if matches!(notice, subtrack_core::SyncNotice::Terminal { .. }) {
                terminal = true;
            }
            if matches!(notice, subtrack_core::SyncNotice::Stopped { .. }) {
                break;
            }
        }
        assert!(terminal);
    });
    assert!(context.cache.get("s-1").expect("snapshot").is_terminal());
}
