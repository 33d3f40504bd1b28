use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// Bearer credential attached to outgoing requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// An `expires_in` outside the representable range leaves the expiry
    /// unknown.
    pub fn expiring_in(mut self, seconds: i64) -> Self {
        self.expires_at =
            Duration::try_seconds(seconds).and_then(|ttl| Utc::now().checked_add_signed(ttl));
        self
    }

    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

/// Holder of the current credential.
///
/// Implementations assume a single logical writer (the transport's refresh
/// path, or an explicit login/logout).
pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Option<Credential>;
    fn set(&self, credential: Credential);
    fn clear(&self);
}

#[derive(Clone, Default)]
pub struct MemoryCredentialStore {
    current: Arc<RwLock<Option<Credential>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        let store = Self::new();
        store.set(credential);
        store
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Option<Credential> {
        self.current.read().clone()
    }

    fn set(&self, credential: Credential) {
        *self.current.write() = Some(credential);
    }

    fn clear(&self) {
        self.current.write().take();
    }
}

/// Process-wide session notifications for collaborators outside the core
/// (e.g. forcing a logout in the UI).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Invalidated { reason: String },
}

#[derive(Clone)]
pub struct SessionSignal {
    tx: broadcast::Sender<SessionEvent>,
}

impl SessionSignal {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn invalidate(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(%reason, "session invalidated");
        // No receivers is fine: nobody is listening for logout.
        let _ = self.tx.send(SessionEvent::Invalidated { reason });
    }
}

impl Default for SessionSignal {
    fn default() -> Self {
        Self::new()
    }
}
