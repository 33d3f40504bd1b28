use anyhow::{Context, Result};
use std::sync::Arc;
use subtrack_core::{
    ApiClient, CredentialStore, EventChannel, FileCredentialStore, HttpBackend, JudgeApi,
    ReqwestBackend, SessionSignal, Settings, SseEventSource, Synchronizer, SyncNotice, ViewCache,
};
use tokio::sync::mpsc::UnboundedReceiver;

/// Everything a command needs, wired from [`Settings`].
pub struct ClientContext {
    pub settings: Settings,
    pub api: JudgeApi,
    pub session: SessionSignal,
    pub cache: ViewCache,
    credentials: Arc<dyn CredentialStore>,
}

impl ClientContext {
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let credentials: Arc<dyn CredentialStore> = Arc::new(FileCredentialStore::user_default());
        let backend: Arc<dyn HttpBackend> = Arc::new(
            ReqwestBackend::new(&settings.api.base_url).context("failed to build HTTP client")?,
        );
        Ok(Self::with_parts(settings, backend, credentials))
    }

    pub fn with_parts(
        settings: Settings,
        backend: Arc<dyn HttpBackend>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        let session = SessionSignal::new();
        let client = ApiClient::with_session(
            backend,
            credentials.clone(),
            settings.transport_options(),
            session.clone(),
        );
        Self {
            api: JudgeApi::new(client),
            session,
            cache: ViewCache::new(),
            credentials,
            settings,
        }
    }

    pub fn is_signed_in(&self) -> bool {
        self.credentials.get().is_some()
    }

    /// Builds a synchronizer, with live events when enabled in settings.
    pub fn synchronizer(&self) -> Result<(Synchronizer, UnboundedReceiver<SyncNotice>)> {
        let channel = if self.settings.sync.events_enabled {
            let source = SseEventSource::new(&self.settings.api.base_url, self.credentials.clone())
                .context("failed to build event stream client")?;
            Some(EventChannel::new(
                Arc::new(source),
                self.settings.reconnect_policy(),
            ))
        } else {
            None
        };
        Ok(Synchronizer::new(
            Arc::new(self.api.clone()),
            channel,
            self.cache.clone(),
            self.settings.sync_options(),
        ))
    }
}
