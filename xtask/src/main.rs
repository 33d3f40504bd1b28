use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use subtrack_core::testing::{FakeBackend, FakeEventSource, Reply};
use subtrack_core::{
    telemetry, ApiClient, Credential, CredentialStore, EventChannel, FileCredentialStore,
    JudgeApi, Method, ReconnectPolicy, SubmissionStatus, SyncNotice, SyncOptions, Synchronizer,
    TransportOptions, ViewCache,
};
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "xtask", version, about = "Automation helpers for Subtrack")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Track a scripted submission end to end against in-process fakes.
    Smoke,
}

fn main() -> Result<()> {
    telemetry::init_tracing(EnvFilter::new("info"))?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Smoke => smoke_test(),
    }
}

fn smoke_test() -> Result<()> {
    let runtime = Runtime::new()?;
    let temp_dir = TempDir::new()?;
    let store = Arc::new(FileCredentialStore::open(temp_dir.path().join("credentials.json")));
    store.set(Credential::new("expired").with_refresh_token("smoke-refresh"));

    let backend = Arc::new(FakeBackend::with_handler(|request| {
        if request.path == "/auth/refresh" {
            return Reply::ok(json!({"tokens": {"access_token": "smoke-token"}}));
        }
        if request.authorization.as_deref() != Some("Bearer smoke-token") {
            return Reply::error(401, "UNAUTHORIZED", "token expired");
        }
        Reply::error(404, "NOT_FOUND", "no such route")
    }));
    backend.route(
        Method::Get,
        "/submissions/smoke-1",
        [
            Reply::error(401, "UNAUTHORIZED", "token expired"),
            Reply::ok(json!({"id": "smoke-1", "status": "pending"})),
            Reply::ok(json!({"id": "smoke-1", "status": "running"})),
            Reply::ok(json!({"id": "smoke-1", "status": "accepted", "score": 100.0})),
        ],
    );

    let client = ApiClient::new(
        backend.clone(),
        store.clone(),
        TransportOptions::default(),
    );
    let events = Arc::new(FakeEventSource::new());
    let cache = ViewCache::new();
    let (sync, mut notices) = Synchronizer::new(
        Arc::new(JudgeApi::new(client)),
        Some(EventChannel::new(
            events.clone(),
            ReconnectPolicy::fixed(Duration::from_millis(200)),
        )),
        cache.clone(),
        SyncOptions {
            poll_interval: Duration::from_millis(100),
            max_poll_backoff: Duration::from_secs(1),
        },
    );

    let outcome = runtime.block_on(async {
        sync.track("smoke-1");
        let mut final_status = None;
        loop {
            let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv()).await;
            match notice {
                Ok(Some(SyncNotice::Terminal { status, .. })) => final_status = Some(status),
                Ok(Some(SyncNotice::Stopped { .. })) | Ok(None) => break,
                Ok(Some(other)) => info!(notice = ?other, "smoke notice"),
                Err(_) => {
                    sync.shutdown();
                    break;
                }
            }
        }
        final_status
    });

    if outcome != Some(SubmissionStatus::Accepted) {
        bail!("smoke run ended with {outcome:?}");
    }
    let token = store.get().map(|c| c.access_token).unwrap_or_default();
    if token != "smoke-token" {
        bail!("credential was not refreshed (have `{token}`)");
    }
    info!(
        "requests" = backend.calls().len(),
        "cached" = cache.get("smoke-1").is_some(),
        "smoke test reached terminal status"
    );

    Ok(())
}
