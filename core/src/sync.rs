//! Live status tracking.
//!
//! Each tracked job gets one task that seeds a snapshot, then merges two
//! trigger sources (the poll timer and the event channel) into a single
//! reconcile routine. Only authoritative fetches move the job's status, and
//! the first terminal status ends tracking.

use crate::api::SubmissionFetcher;
use crate::cache::{PutOutcome, Snapshot, ViewCache};
use crate::error::ClientError;
use crate::events::{ChannelMessage, Event, EventChannel, Subscription};
use crate::model::{Submission, SubmissionStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub poll_interval: Duration,
    /// Cap for the poll delay while fetches keep failing.
    pub max_poll_backoff: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(4),
            max_poll_backoff: Duration::from_secs(60),
        }
    }
}

impl SyncOptions {
    pub fn poll_delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures);
        self.poll_interval
            .saturating_mul(factor)
            .min(self.max_poll_backoff.max(self.poll_interval))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Syncing,
    Terminal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    Poll,
    Event(Event),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotice {
    Seeded {
        job_id: String,
        status: SubmissionStatus,
    },
    StatusChanged {
        job_id: String,
        from: SubmissionStatus,
        to: SubmissionStatus,
    },
    Connection {
        job_id: String,
        connected: bool,
    },
    FetchFailed {
        job_id: String,
        error: ClientError,
        fatal: bool,
    },
    Terminal {
        job_id: String,
        status: SubmissionStatus,
    },
    Stopped {
        job_id: String,
    },
}

impl SyncNotice {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Seeded { job_id, .. }
            | Self::StatusChanged { job_id, .. }
            | Self::Connection { job_id, .. }
            | Self::FetchFailed { job_id, .. }
            | Self::Terminal { job_id, .. }
            | Self::Stopped { job_id } => job_id,
        }
    }
}

/// Errors after which polling cannot succeed.
pub fn is_fatal(error: &ClientError) -> bool {
    match error {
        ClientError::Api(err) => err.not_found() || err.unauthorized() || err.forbidden(),
        ClientError::Schema(_) => true,
    }
}

struct TrackerHandle {
    epoch: u64,
    cancel: CancellationToken,
    phase: Arc<Mutex<Phase>>,
}

type Registry = Arc<Mutex<HashMap<String, TrackerHandle>>>;

/// Registry of per-job trackers.
#[derive(Clone)]
pub struct Synchronizer {
    fetcher: Arc<dyn SubmissionFetcher>,
    channel: Option<EventChannel>,
    cache: ViewCache,
    options: SyncOptions,
    trackers: Registry,
    notices: mpsc::UnboundedSender<SyncNotice>,
}

impl Synchronizer {
    pub fn new(
        fetcher: Arc<dyn SubmissionFetcher>,
        channel: Option<EventChannel>,
        cache: ViewCache,
        options: SyncOptions,
    ) -> (Self, mpsc::UnboundedReceiver<SyncNotice>) {
        let (notices, rx) = mpsc::unbounded_channel();
        (
            Self {
                fetcher,
                channel,
                cache,
                options,
                trackers: Arc::new(Mutex::new(HashMap::new())),
                notices,
            },
            rx,
        )
    }

    pub fn cache(&self) -> &ViewCache {
        &self.cache
    }

    /// Starts tracking `job_id`. Returns false if it is already tracked.
    pub fn track(&self, job_id: &str) -> bool {
        let mut trackers = self.trackers.lock();
        if trackers.contains_key(job_id) {
            debug!(job_id, "already tracking");
            return false;
        }

        let epoch = self.cache.open_epoch(job_id);
        let cancel = CancellationToken::new();
        let phase = Arc::new(Mutex::new(Phase::Initializing));
        let tracker = Tracker {
            job_id: job_id.to_string(),
            epoch,
            fetcher: self.fetcher.clone(),
            channel: self.channel.clone(),
            cache: self.cache.clone(),
            options: self.options.clone(),
            notices: self.notices.clone(),
            registry: self.trackers.clone(),
            phase: phase.clone(),
            current: None,
            failures: 0,
        };
        trackers.insert(
            job_id.to_string(),
            TrackerHandle {
                epoch,
                cancel: cancel.clone(),
                phase,
            },
        );
        drop(trackers);

        info!(job_id, epoch, "tracking job");
        tokio::spawn(tracker.run(cancel));
        true
    }

    /// Stops tracking `job_id`. Returns false if it was not tracked.
    pub fn untrack(&self, job_id: &str) -> bool {
        let Some(handle) = self.trackers.lock().remove(job_id) else {
            return false;
        };
        handle.cancel.cancel();
        self.cache.retire_epoch(job_id, handle.epoch);
        info!(job_id, "stopped tracking job");
        let _ = self.notices.send(SyncNotice::Stopped {
            job_id: job_id.to_string(),
        });
        true
    }

    pub fn is_tracking(&self, job_id: &str) -> bool {
        self.trackers.lock().contains_key(job_id)
    }

    pub fn phase(&self, job_id: &str) -> Option<Phase> {
        self.trackers
            .lock()
            .get(job_id)
            .map(|handle| *handle.phase.lock())
    }

    pub fn tracked(&self) -> Vec<String> {
        self.trackers.lock().keys().cloned().collect()
    }

    pub fn shutdown(&self) {
        let ids = self.tracked();
        for job_id in ids {
            self.untrack(&job_id);
        }
    }
}

enum Step {
    Continue,
    Stop,
}

enum Wake {
    Poll,
    Message(Option<ChannelMessage>),
}

struct Tracker {
    job_id: String,
    epoch: u64,
    fetcher: Arc<dyn SubmissionFetcher>,
    channel: Option<EventChannel>,
    cache: ViewCache,
    options: SyncOptions,
    notices: mpsc::UnboundedSender<SyncNotice>,
    registry: Registry,
    phase: Arc<Mutex<Phase>>,
    current: Option<Submission>,
    failures: u32,
}

impl Tracker {
    async fn run(mut self, cancel: CancellationToken) {
        tokio::select! {
            // `untrack` already cleaned up after us.
            _ = cancel.cancelled() => return,
            _ = self.drive() => {}
        }
        self.finish();
    }

    async fn drive(&mut self) {
        match self.seed().await {
            Step::Stop => return,
            Step::Continue => {}
        }
        self.set_phase(Phase::Syncing);

        let mut subscription: Option<Subscription> = None;
        let mut messages = None;
        if let Some(channel) = &self.channel {
            let (sub, rx) = channel.subscribe(&self.job_id);
            subscription = Some(sub);
            messages = Some(rx);
        }

        let poll = tokio::time::sleep(self.options.poll_delay(self.failures));
        tokio::pin!(poll);
        let mut queued: Option<Trigger> = None;

        loop {
            let trigger = match queued.take() {
                Some(trigger) => trigger,
                None => {
                    let wake = tokio::select! {
                        _ = &mut poll => Wake::Poll,
                        message = next_message(&mut messages) => Wake::Message(message),
                    };
                    match wake {
                        Wake::Poll => Trigger::Poll,
                        Wake::Message(Some(ChannelMessage::Event(event))) => {
                            if !event.kind.requests_refresh() {
                                debug!(job_id = %self.job_id, kind = ?event.kind, "ignoring event");
                                continue;
                            }
                            Trigger::Event(event)
                        }
                        Wake::Message(Some(ChannelMessage::Connection(connected))) => {
                            self.notify(SyncNotice::Connection {
                                job_id: self.job_id.clone(),
                                connected,
                            });
                            continue;
                        }
                        Wake::Message(None) => {
                            debug!(job_id = %self.job_id, "event channel closed, polling only");
                            messages = None;
                            continue;
                        }
                    }
                }
            };

            let polled = trigger == Trigger::Poll;
            let step = self.reconcile(&trigger).await;
            if let Step::Stop = step {
                break;
            }

            // Triggers that arrived during the fetch collapse into one
            // follow-up fetch.
            queued = self.drain(&mut messages);
            if polled {
                let delay = self.options.poll_delay(self.failures);
                poll.as_mut().reset(Instant::now() + delay);
            }
        }

        if let Some(subscription) = subscription {
            subscription.close();
        }
    }

    async fn seed(&mut self) -> Step {
        let seq = self.cache.next_fetch_seq();
        match self.fetcher.fetch(&self.job_id).await {
            Ok(submission) => self.merge(submission, seq),
            Err(error) => {
                // Only a missing job is final here; anything else gets retried by polling.
                let fatal = error.not_found();
                warn!(job_id = %self.job_id, error = %error, fatal, "initial fetch failed");
                self.notify(SyncNotice::FetchFailed {
                    job_id: self.job_id.clone(),
                    error,
                    fatal,
                });
                if fatal {
                    return Step::Stop;
                }
                self.failures = 1;
                Step::Continue
            }
        }
    }

    async fn reconcile(&mut self, trigger: &Trigger) -> Step {
        if *self.phase.lock() == Phase::Terminal {
            return Step::Stop;
        }
        let seq = self.cache.next_fetch_seq();
        debug!(
            job_id = %self.job_id,
            trigger = trigger_name(trigger),
            seq,
            "reconciling"
        );
        match self.fetcher.fetch(&self.job_id).await {
            Ok(submission) => {
                self.failures = 0;
                self.merge(submission, seq)
            }
            Err(error) if is_fatal(&error) => {
                warn!(job_id = %self.job_id, error = %error, "fetch failed, giving up");
                self.notify(SyncNotice::FetchFailed {
                    job_id: self.job_id.clone(),
                    error,
                    fatal: true,
                });
                Step::Stop
            }
            Err(error) => {
                self.failures = self.failures.saturating_add(1);
                debug!(
                    job_id = %self.job_id,
                    error = %error,
                    failures = self.failures,
                    "fetch failed, backing off"
                );
                Step::Continue
            }
        }
    }

    /// Compares an authoritative fetch against the current view.
    fn merge(&mut self, submission: Submission, seq: u64) -> Step {
        if self.current.as_ref() != Some(&submission) {
            let snapshot = Snapshot::new(submission.clone(), seq);
            match self.cache.put_guarded(&self.job_id, self.epoch, snapshot) {
                PutOutcome::Applied => {}
                PutOutcome::EpochRetired => return Step::Stop,
                outcome => {
                    debug!(job_id = %self.job_id, ?outcome, "keeping cached snapshot");
                    return Step::Continue;
                }
            }
        }

        let previous = self.current.replace(submission);
        let status = self.status();
        match previous {
            None => {
                info!(job_id = %self.job_id, status = %status, "seeded");
                self.notify(SyncNotice::Seeded {
                    job_id: self.job_id.clone(),
                    status: status.clone(),
                });
            }
            Some(previous) if previous.status != status => {
                info!(job_id = %self.job_id, from = %previous.status, to = %status, "status changed");
                self.notify(SyncNotice::StatusChanged {
                    job_id: self.job_id.clone(),
                    from: previous.status,
                    to: status.clone(),
                });
            }
            Some(_) => {}
        }

        if status.is_terminal() {
            self.set_phase(Phase::Terminal);
            self.notify(SyncNotice::Terminal {
                job_id: self.job_id.clone(),
                status,
            });
            return Step::Stop;
        }
        Step::Continue
    }

    /// Empties the channel queue, forwarding connection changes and keeping
    /// the last refresh-worthy event.
    fn drain(
        &mut self,
        messages: &mut Option<mpsc::UnboundedReceiver<ChannelMessage>>,
    ) -> Option<Trigger> {
        let rx = messages.as_mut()?;
        let mut latest = None;
        while let Ok(message) = rx.try_recv() {
            match message {
                ChannelMessage::Event(event) if event.kind.requests_refresh() => {
                    latest = Some(Trigger::Event(event));
                }
                ChannelMessage::Event(_) => {}
                ChannelMessage::Connection(connected) => self.notify(SyncNotice::Connection {
                    job_id: self.job_id.clone(),
                    connected,
                }),
            }
        }
        latest
    }

    fn status(&self) -> SubmissionStatus {
        self.current
            .as_ref()
            .map(|s| s.status.clone())
            .unwrap_or(SubmissionStatus::Pending)
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock() = phase;
    }

    fn notify(&self, notice: SyncNotice) {
        let _ = self.notices.send(notice);
    }

    /// Runs when the tracker stopped on its own (terminal or fatal).
    fn finish(self) {
        let mut registry = self.registry.lock();
        let ours = registry
            .get(&self.job_id)
            .map(|handle| handle.epoch == self.epoch)
            .unwrap_or(false);
        if !ours {
            return;
        }
        registry.remove(&self.job_id);
        drop(registry);

        self.cache.retire_epoch(&self.job_id, self.epoch);
        debug!(job_id = %self.job_id, "tracker finished");
        self.notify(SyncNotice::Stopped {
            job_id: self.job_id.clone(),
        });
    }
}

async fn next_message(
    messages: &mut Option<mpsc::UnboundedReceiver<ChannelMessage>>,
) -> Option<ChannelMessage> {
    match messages {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn trigger_name(trigger: &Trigger) -> &'static str {
    match trigger {
        Trigger::Poll => "poll",
        Trigger::Event(_) => "event",
    }
}
