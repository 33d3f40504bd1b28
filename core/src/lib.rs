pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod transport;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use api::{JudgeApi, SubmissionFetcher};
pub use auth::{Credential, CredentialStore, MemoryCredentialStore, SessionEvent, SessionSignal};
pub use cache::{PutOutcome, Snapshot, ViewCache};
pub use config::{ConfigError, Settings};
pub use error::{ApiError, ClientError, SchemaIssue, SchemaValidationError, UserMessage};
pub use events::{
    ChannelMessage, Event, EventChannel, EventKind, EventSource, ReconnectPolicy, SseEventSource,
    Subscription,
};
pub use model::{NewSubmission, Problem, Submission, SubmissionFilter, SubmissionStatus};
pub use store::FileCredentialStore;
pub use sync::{Phase, SyncNotice, SyncOptions, Synchronizer, Trigger};
pub use transport::{ApiClient, ApiRequest, HttpBackend, Method, ReqwestBackend, TransportOptions};
