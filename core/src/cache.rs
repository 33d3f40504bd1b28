use crate::model::{Submission, SubmissionStatus};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Reconciled view of one job.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub submission: Submission,
    pub fetched_at: DateTime<Utc>,
    /// Issue order of the fetch that produced this snapshot.
    pub fetch_seq: u64,
}

impl Snapshot {
    pub fn new(submission: Submission, fetch_seq: u64) -> Self {
        Self {
            submission,
            fetched_at: Utc::now(),
            fetch_seq,
        }
    }

    pub fn status(&self) -> &SubmissionStatus {
        &self.submission.status
    }

    pub fn is_terminal(&self) -> bool {
        self.submission.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Applied,
    /// A snapshot from a later fetch is already stored.
    Stale,
    /// Terminal snapshots are never replaced by non-terminal ones.
    TerminalLocked,
    /// The writer's epoch was retired (job untracked or re-tracked).
    EpochRetired,
}

struct Entry {
    tx: watch::Sender<Option<Arc<Snapshot>>>,
    epoch: u64,
}

impl Entry {
    fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx, epoch: 0 }
    }
}

/// Shared keyed store of job snapshots.
///
/// Writes are last-writer-wins by `fetch_seq`. Each entry carries an epoch
/// so a tracker that has been torn down cannot write after the fact.
#[derive(Clone, Default)]
pub struct ViewCache {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    fetch_seq: Arc<AtomicU64>,
}

impl ViewCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the sequence number for a fetch about to be issued.
    pub fn next_fetch_seq(&self) -> u64 {
        self.fetch_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self, job_id: &str) -> Option<Arc<Snapshot>> {
        self.entries
            .read()
            .get(job_id)
            .and_then(|entry| entry.tx.borrow().clone())
    }

    pub fn put(&self, job_id: &str, snapshot: Snapshot) -> PutOutcome {
        let mut entries = self.entries.write();
        let entry = entries.entry(job_id.to_string()).or_insert_with(Entry::new);
        apply(job_id, entry, snapshot)
    }

    /// Like [`put`](Self::put), but only while `epoch` is the entry's current
    /// epoch.
    pub fn put_guarded(&self, job_id: &str, epoch: u64, snapshot: Snapshot) -> PutOutcome {
        let mut entries = self.entries.write();
        match entries.get_mut(job_id) {
            Some(entry) if entry.epoch == epoch => apply(job_id, entry, snapshot),
            _ => {
                debug!(job_id, epoch, "discarding write from retired epoch");
                PutOutcome::EpochRetired
            }
        }
    }

    /// Starts a new writer epoch, retiring any previous one.
    pub fn open_epoch(&self, job_id: &str) -> u64 {
        let mut entries = self.entries.write();
        let entry = entries.entry(job_id.to_string()).or_insert_with(Entry::new);
        entry.epoch += 1;
        entry.epoch
    }

    /// Retires `epoch` if it is still current. Later epochs are unaffected.
    pub fn retire_epoch(&self, job_id: &str, epoch: u64) {
        if let Some(entry) = self.entries.write().get_mut(job_id) {
            if entry.epoch == epoch {
                entry.epoch += 1;
            }
        }
    }

    pub fn invalidate(&self, job_id: &str) {
        if let Some(entry) = self.entries.read().get(job_id) {
            entry.tx.send_replace(None);
        }
    }

    pub fn subscribe(&self, job_id: &str) -> watch::Receiver<Option<Arc<Snapshot>>> {
        let mut entries = self.entries.write();
        entries
            .entry(job_id.to_string())
            .or_insert_with(Entry::new)
            .tx
            .subscribe()
    }
}

fn apply(job_id: &str, entry: &mut Entry, snapshot: Snapshot) -> PutOutcome {
    let outcome = match entry.tx.borrow().as_deref() {
        Some(current) if current.is_terminal() && !snapshot.is_terminal() => {
            PutOutcome::TerminalLocked
        }
        Some(current) if snapshot.fetch_seq < current.fetch_seq => PutOutcome::Stale,
        _ => PutOutcome::Applied,
    };
    if outcome == PutOutcome::Applied {
        entry.tx.send_replace(Some(Arc::new(snapshot)));
    } else {
        debug!(job_id, ?outcome, "cache write rejected");
    }
    outcome
}
