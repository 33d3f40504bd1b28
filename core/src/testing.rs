//! In-process fakes for the HTTP backend and the event source.
//!
//! Compiled for unit tests and behind the `test-support` feature so the
//! integration tests crate can drive the same fakes.

use crate::error::{codes, ApiError};
use crate::events::{EventSource, RawEventStream};
use crate::transport::{HttpBackend, HttpRequest, HttpResponse, Method};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;

/// Scripted outcome for one request.
#[derive(Debug, Clone)]
pub enum Reply {
    Respond(HttpResponse),
    Delayed(Duration, HttpResponse),
    Fail(ApiError),
}

impl Reply {
    pub fn ok(data: Value) -> Self {
        Self::Respond(HttpResponse::json(
            200,
            &json!({ "data": data, "error": null }),
        ))
    }

    pub fn ok_with_meta(data: Value, meta: Value) -> Self {
        Self::Respond(HttpResponse::json(
            200,
            &json!({ "data": data, "meta": meta, "error": null }),
        ))
    }

    pub fn error(status: u16, code: &str, message: &str) -> Self {
        Self::Respond(HttpResponse::json(
            status,
            &json!({ "data": null, "error": { "code": code, "message": message } }),
        ))
    }

    pub fn network(detail: &str) -> Self {
        Self::Fail(ApiError::network(detail))
    }

    pub fn delayed(self, delay: Duration) -> Self {
        match self {
            Self::Respond(response) | Self::Delayed(_, response) => Self::Delayed(delay, response),
            fail @ Self::Fail(_) => fail,
        }
    }
}

type Handler = Box<dyn Fn(&HttpRequest) -> Reply + Send + Sync>;

/// Route-scripted [`HttpBackend`].
///
/// Each route holds a queue of replies; the last one repeats once the queue
/// is drained. Requests without a route go to the handler if one was given,
/// otherwise they get a `NOT_FOUND` envelope.
pub struct FakeBackend {
    routes: Mutex<HashMap<(Method, String), VecDeque<Reply>>>,
    handler: Option<Handler>,
    calls: Mutex<Vec<HttpRequest>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            handler: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&HttpRequest) -> Reply + Send + Sync + 'static,
    {
        Self {
            handler: Some(Box::new(handler)),
            ..Self::new()
        }
    }

    /// Replaces the script for `method path` (path includes any query string).
    pub fn route(&self, method: Method, path: &str, replies: impl IntoIterator<Item = Reply>) {
        self.routes
            .lock()
            .insert((method, path.to_string()), replies.into_iter().collect());
    }

    pub fn calls(&self) -> Vec<HttpRequest> {
        self.calls.lock().clone()
    }

    pub fn count(&self, method: Method, path: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.method == method && call.path == path)
            .count()
    }

    fn next_reply(&self, request: &HttpRequest) -> Reply {
        let mut routes = self.routes.lock();
        if let Some(queue) = routes.get_mut(&(request.method, request.path.clone())) {
            let reply = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            if let Some(reply) = reply {
                return reply;
            }
        }
        drop(routes);
        match &self.handler {
            Some(handler) => handler(request),
            None => Reply::error(404, codes::NOT_FOUND, "no route scripted"),
        }
    }
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpBackend for FakeBackend {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        self.calls.lock().push(request.clone());
        match self.next_reply(&request) {
            Reply::Respond(response) => Ok(response),
            Reply::Delayed(delay, response) => {
                tokio::time::sleep(delay).await;
                Ok(response)
            }
            Reply::Fail(err) => Err(err),
        }
    }
}

type Feed = mpsc::UnboundedSender<Result<String, ApiError>>;

/// [`EventSource`] whose connections are driven by the test.
///
/// Every accepted `connect` opens a fresh feed that replaces the previous
/// one for that job.
#[derive(Default)]
pub struct FakeEventSource {
    feeds: Mutex<HashMap<String, Feed>>,
    attempts: Mutex<HashMap<String, usize>>,
    refusing: Mutex<HashMap<String, ApiError>>,
}

impl FakeEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later connect for `job_id` fail with `err`.
    pub fn refuse(&self, job_id: &str, err: ApiError) {
        self.refusing.lock().insert(job_id.to_string(), err);
    }

    pub fn accept(&self, job_id: &str) {
        self.refusing.lock().remove(job_id);
    }

    pub fn attempts(&self, job_id: &str) -> usize {
        self.attempts.lock().get(job_id).copied().unwrap_or(0)
    }

    /// True while the subscriber still holds the latest connection open.
    pub fn is_connected(&self, job_id: &str) -> bool {
        self.feeds
            .lock()
            .get(job_id)
            .map(|feed| !feed.is_closed())
            .unwrap_or(false)
    }

    /// Delivers a raw message. Returns false when no connection is open.
    pub fn push(&self, job_id: &str, raw: impl Into<String>) -> bool {
        self.feeds
            .lock()
            .get(job_id)
            .map(|feed| feed.send(Ok(raw.into())).is_ok())
            .unwrap_or(false)
    }

    pub fn push_event(&self, job_id: &str, kind: &str) -> bool {
        self.push(
            job_id,
            json!({ "type": kind, "submissionId": job_id }).to_string(),
        )
    }

    /// Ends the current connection as if the server closed it.
    pub fn drop_connection(&self, job_id: &str) {
        self.feeds.lock().remove(job_id);
    }

    pub fn fail_connection(&self, job_id: &str, err: ApiError) {
        if let Some(feed) = self.feeds.lock().remove(job_id) {
            let _ = feed.send(Err(err));
        }
    }
}

#[async_trait]
impl EventSource for FakeEventSource {
    async fn connect(&self, job_id: &str) -> Result<RawEventStream, ApiError> {
        *self.attempts.lock().entry(job_id.to_string()).or_default() += 1;
        if let Some(err) = self.refusing.lock().get(job_id) {
            return Err(err.clone());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().insert(job_id.to_string(), tx);
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}
