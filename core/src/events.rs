//! Push notifications for a single job.
//!
//! An [`EventChannel`] subscription owns one background task that keeps a
//! connection to the [`EventSource`] open, decodes messages and reconnects
//! after failures. Events are hints only; consumers re-fetch authoritative
//! state instead of trusting payloads.

use crate::auth::CredentialStore;
use crate::error::ApiError;
use crate::transport::{code_for_status, path_segment};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StatusUpdate,
    JudgeRunUpdate,
    Completed,
    Unknown,
}

impl EventKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "status_update" | "status" => Self::StatusUpdate,
            "judge_run_update" | "judge_run" => Self::JudgeRunUpdate,
            "completed" | "complete" => Self::Completed,
            _ => Self::Unknown,
        }
    }

    /// Whether the event is a reason to re-fetch the job.
    pub fn requests_refresh(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub job_id: String,
    pub payload: Option<Value>,
    pub received_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct WireEvent {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(rename = "submissionId", alias = "submission_id", default)]
    submission_id: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
}

/// Decodes one message. Returns `None` for anything that is not a JSON
/// object; a missing job id defaults to `subscribed`.
pub fn decode_event(raw: &str, subscribed: &str) -> Option<Event> {
    let value: Value = serde_json::from_str(raw).ok()?;
    if !value.is_object() {
        return None;
    }
    let wire: WireEvent = serde_json::from_value(value).ok()?;
    Some(Event {
        kind: wire
            .kind
            .as_deref()
            .map(EventKind::parse)
            .unwrap_or(EventKind::Unknown),
        job_id: wire.submission_id.unwrap_or_else(|| subscribed.to_string()),
        payload: wire.payload,
        received_at: Utc::now(),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Event(Event),
    Connection(bool),
}

pub type RawEventStream = BoxStream<'static, Result<String, ApiError>>;

/// Opens the raw message stream for one job. The stream ending or yielding
/// an error means the connection dropped.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn connect(&self, job_id: &str) -> Result<RawEventStream, ApiError>;
}

/// Server-sent events over `GET {base}/submissions/{id}/events`.
pub struct SseEventSource {
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialStore>,
}

impl SseEventSource {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(ApiError::network)?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }
}

#[async_trait]
impl EventSource for SseEventSource {
    async fn connect(&self, job_id: &str) -> Result<RawEventStream, ApiError> {
        let url = format!("{}/submissions/{}/events", self.base_url, path_segment(job_id));
        let mut builder = self.client.get(url).header(ACCEPT, "text/event-stream");
        if let Some(credential) = self.credentials.get() {
            builder = builder.header(AUTHORIZATION, credential.authorization_header());
        }
        let response = builder.send().await.map_err(ApiError::network)?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(ApiError::new(
                code_for_status(status),
                status,
                format!("event stream rejected with HTTP {status}"),
            ));
        }

        let state = (
            response.bytes_stream().boxed(),
            SseDecoder::default(),
            VecDeque::new(),
        );
        let stream = futures::stream::unfold(state, |(mut bytes, mut decoder, mut ready)| async move {
            loop {
                if let Some(message) = ready.pop_front() {
                    return Some((Ok(message), (bytes, decoder, ready)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => ready.extend(decoder.feed(&chunk)),
                    Some(Err(err)) => {
                        return Some((Err(ApiError::network(err)), (bytes, decoder, ready)))
                    }
                    None => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Incremental `text/event-stream` parser yielding the `data` of each event.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut complete = Vec::new();
        for &byte in chunk {
            if byte != b'\n' {
                self.line.push(byte);
                continue;
            }
            if self.line.last() == Some(&b'\r') {
                self.line.pop();
            }
            let line = String::from_utf8_lossy(&self.line).into_owned();
            self.line.clear();
            if line.is_empty() {
                if !self.data.is_empty() {
                    complete.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            }
            // `event:`, `id:`, `retry:` and `:` comments carry nothing we use.
        }
        complete
    }
}

/// Delay before reconnect attempt `failures + 1`: `initial * 2^failures`,
/// capped at `max`. Equal bounds give a fixed interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl ReconnectPolicy {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial: interval,
            max: interval,
        }
    }

    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct EventChannel {
    source: Arc<dyn EventSource>,
    policy: ReconnectPolicy,
}

impl EventChannel {
    pub fn new(source: Arc<dyn EventSource>, policy: ReconnectPolicy) -> Self {
        Self { source, policy }
    }

    pub fn subscribe(&self, job_id: &str) -> (Subscription, mpsc::UnboundedReceiver<ChannelMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let worker = SubscriptionWorker {
            source: self.source.clone(),
            policy: self.policy.clone(),
            job_id: job_id.to_string(),
            tx,
            cancel: cancel.clone(),
            reported: None,
        };
        tokio::spawn(worker.run());
        (
            Subscription {
                job_id: job_id.to_string(),
                cancel,
            },
            rx,
        )
    }
}

/// Handle to a live subscription. Closing (or dropping) it stops the
/// connection and any pending reconnect.
#[derive(Debug)]
pub struct Subscription {
    job_id: String,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!(job_id = %self.job_id, "closing event subscription");
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

struct SubscriptionWorker {
    source: Arc<dyn EventSource>,
    policy: ReconnectPolicy,
    job_id: String,
    tx: mpsc::UnboundedSender<ChannelMessage>,
    cancel: CancellationToken,
    reported: Option<bool>,
}

impl SubscriptionWorker {
    async fn run(mut self) {
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.connect_loop() => {}
        }
        debug!(job_id = %self.job_id, "event subscription finished");
    }

    // Connect, read until the stream drops, then wait out exactly one
    // reconnect delay. The sleep is awaited inline so there is never more
    // than one timer.
    async fn connect_loop(&mut self) {
        let mut failures = 0u32;
        loop {
            match self.source.connect(&self.job_id).await {
                Ok(stream) => {
                    failures = 0;
                    debug!(job_id = %self.job_id, "event channel connected");
                    if !self.report(true) {
                        return;
                    }
                    if !self.pump(stream).await {
                        return;
                    }
                }
                Err(err) => {
                    warn!(job_id = %self.job_id, error = %err, "event channel connect failed");
                }
            }
            if !self.report(false) {
                return;
            }
            let delay = self.policy.delay(failures);
            failures = failures.saturating_add(1);
            debug!(
                job_id = %self.job_id,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Forwards decoded events until the stream ends. Returns false once the
    /// receiver is gone.
    async fn pump(&mut self, mut stream: RawEventStream) -> bool {
        while let Some(item) = stream.next().await {
            let raw = match item {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(job_id = %self.job_id, error = %err, "event stream failed");
                    return true;
                }
            };
            let Some(event) = decode_event(&raw, &self.job_id) else {
                debug!(job_id = %self.job_id, raw = %raw, "dropping malformed event");
                continue;
            };
            if event.job_id != self.job_id {
                debug!(job_id = %self.job_id, other = %event.job_id, "dropping event for another job");
                continue;
            }
            if self.tx.send(ChannelMessage::Event(event)).is_err() {
                return false;
            }
        }
        debug!(job_id = %self.job_id, "event stream ended");
        true
    }

    /// Sends a connection change once per transition.
    fn report(&mut self, connected: bool) -> bool {
        if self.reported == Some(connected) {
            return !self.tx.is_closed();
        }
        self.reported = Some(connected);
        self.tx.send(ChannelMessage::Connection(connected)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEventSource;

    #[test]
    fn decodes_event_and_defaults_job_id() {
        let event = decode_event(r#"{"type":"status_update","payload":{"status":"running"}}"#, "s-1")
            .expect("event");
        assert_eq!(event.kind, EventKind::StatusUpdate);
        assert_eq!(event.job_id, "s-1");
        assert!(event.payload.is_some());

        let event = decode_event(r#"{"type":"completed","submissionId":"s-9"}"#, "s-1").unwrap();
        assert_eq!(event.job_id, "s-9");
        assert_eq!(event.kind, EventKind::Completed);
    }

    #[test]
    fn malformed_messages_decode_to_none() {
        assert!(decode_event("not json", "s-1").is_none());
        assert!(decode_event("[1,2]", "s-1").is_none());
        assert!(decode_event(r#"{"type": 3}"#, "s-1").is_none());
        let unknown = decode_event(r#"{"type":"heartbeat"}"#, "s-1").unwrap();
        assert!(!unknown.kind.requests_refresh());
    }

    #[test]
    fn sse_decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.feed(b": keepalive\n\nda").is_empty());
        assert!(decoder.feed(b"ta: {\"type\":\"comp").is_empty());
        let out = decoder.feed(b"leted\"}\r\n\r\ndata: a\ndata: b\n\n");
        assert_eq!(out, vec![r#"{"type":"completed"}"#.to_string(), "a\nb".to_string()]);
    }

    #[test]
    fn reconnect_delay_grows_to_cap() {
        let policy = ReconnectPolicy {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(5),
        };
        let delays: Vec<_> = (0..5).map(|n| policy.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        assert_eq!(ReconnectPolicy::fixed(Duration::from_secs(5)).delay(7), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_events_and_drops_noise() {
        let source = Arc::new(FakeEventSource::new());
        let channel = EventChannel::new(source.clone(), ReconnectPolicy::default());
        let (_subscription, mut rx) = channel.subscribe("s-1");

        assert_eq!(rx.recv().await, Some(ChannelMessage::Connection(true)));
        assert!(source.push("s-1", "garbage"));
        assert!(source.push("s-1", r#"{"type":"status_update","submissionId":"s-2"}"#));
        assert!(source.push_event("s-1", "judge_run_update"));

        match rx.recv().await {
            Some(ChannelMessage::Event(event)) => {
                assert_eq!(event.kind, EventKind::JudgeRunUpdate);
                assert_eq!(event.job_id, "s-1");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reports_disconnect_once_and_reconnects() {
        let source = Arc::new(FakeEventSource::new());
        let channel = EventChannel::new(source.clone(), ReconnectPolicy::fixed(Duration::from_secs(5)));
        let (_subscription, mut rx) = channel.subscribe("s-1");

        assert_eq!(rx.recv().await, Some(ChannelMessage::Connection(true)));
        source.drop_connection("s-1");
        assert_eq!(rx.recv().await, Some(ChannelMessage::Connection(false)));
        assert_eq!(rx.recv().await, Some(ChannelMessage::Connection(true)));
        assert_eq!(source.attempts("s-1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connections_wait_one_timer_at_a_time() {
        let source = Arc::new(FakeEventSource::new());
        source.refuse("s-1", ApiError::network("refused"));
        let channel = EventChannel::new(source.clone(), ReconnectPolicy::fixed(Duration::from_secs(5)));
        let (_subscription, _rx) = channel.subscribe("s-1");

        tokio::time::sleep(Duration::from_millis(12_500)).await;
        // t=0, t=5, t=10
        assert_eq!(source.attempts("s-1"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_error_reconnects_and_resumes() {
        let source = Arc::new(FakeEventSource::new());
        let channel = EventChannel::new(source.clone(), ReconnectPolicy::fixed(Duration::from_secs(5)));
        let (_subscription, mut rx) = channel.subscribe("s-1");
        assert_eq!(rx.recv().await, Some(ChannelMessage::Connection(true)));

        source.fail_connection("s-1", ApiError::network("connection reset"));
        assert_eq!(rx.recv().await, Some(ChannelMessage::Connection(false)));
        assert_eq!(rx.recv().await, Some(ChannelMessage::Connection(true)));
        assert_eq!(source.attempts("s-1"), 2);

        assert!(source.push_event("s-1", "completed"));
        match rx.recv().await {
            Some(ChannelMessage::Event(event)) => assert_eq!(event.kind, EventKind::Completed),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_refusals_and_resets_backoff() {
        let source = Arc::new(FakeEventSource::new());
        source.refuse("s-1", ApiError::network("refused"));
        let channel = EventChannel::new(source.clone(), ReconnectPolicy::default());
        let (_subscription, mut rx) = channel.subscribe("s-1");
        assert_eq!(rx.recv().await, Some(ChannelMessage::Connection(false)));

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        // t=0, t=1, t=3; the next try is due at t=7
        assert_eq!(source.attempts("s-1"), 3);

        source.accept("s-1");
        assert_eq!(rx.recv().await, Some(ChannelMessage::Connection(true)));
        assert_eq!(source.attempts("s-1"), 4);

        let dropped_at = tokio::time::Instant::now();
        source.drop_connection("s-1");
        assert_eq!(rx.recv().await, Some(ChannelMessage::Connection(false)));
        assert_eq!(rx.recv().await, Some(ChannelMessage::Connection(true)));
        let waited = dropped_at.elapsed();
        assert!(waited >= Duration::from_secs(1) && waited < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent_and_stops_reconnects() {
        let source = Arc::new(FakeEventSource::new());
        let channel = EventChannel::new(source.clone(), ReconnectPolicy::fixed(Duration::from_secs(1)));
        let (subscription, mut rx) = channel.subscribe("s-1");
        assert_eq!(rx.recv().await, Some(ChannelMessage::Connection(true)));

        subscription.close();
        subscription.close();
        assert!(subscription.is_closed());

        assert_eq!(rx.recv().await, None);
        assert!(!source.is_connected("s-1"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.attempts("s-1"), 1);
    }
}
