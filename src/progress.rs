//! Per-object, per-phase progress and resume store.
//!
//! Backs multi-day runs: every state transition lands in `progress.json` so
//! a subsequent invocation with `--resume` can seed each phase's work set
//! from [`ProgressStore::pending`] and touch only what is left.
//!
//! Reads come from an in-memory map guarded by a mutex held only for the
//! duration of a clone. Persistence is serialized through a single writer
//! task fed by a channel; each snapshot is written to a temp file and
//! renamed into place, so the file on disk is always a complete document.
//! [`ProgressStore::flush`] drains the queue and is called on cancellation
//! and quota-wall paths.
//!
//! States advance `pending → in_flight → done`; `error` is retryable. A
//! `done` record never regresses.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    Pending,
    InFlight,
    Done,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub state: PhaseState,
    pub last_attempt_at: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

type ProgressData = BTreeMap<String, BTreeMap<String, ProgressRecord>>;

enum PersistMsg {
    Write(String),
    Flush(oneshot::Sender<()>),
}

pub struct ProgressStore {
    path: PathBuf,
    inner: Mutex<ProgressData>,
    tx: mpsc::UnboundedSender<PersistMsg>,
}

/// Per-phase tallies for the final report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseCounts {
    pub done: u64,
    pub errored: u64,
    pub pending: u64,
}

impl ProgressStore {
    /// Open (or create) the store at `path` and start the writer task.
    /// Must be called from within a tokio runtime.
    pub fn open(path: PathBuf) -> Result<Self> {
        let data: ProgressData = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            ProgressData::new()
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(path.clone(), rx));

        Ok(Self {
            path,
            inner: Mutex::new(data),
            tx,
        })
    }

    /// Ensure every ref has a record in `phase`, defaulting to pending.
    /// Existing records keep their state, so resume never loses `done`.
    pub fn seed(&self, phase: &str, refs: &[String]) {
        {
            let mut data = self.inner.lock().expect("progress mutex poisoned");
            let phase_map = data.entry(phase.to_string()).or_default();
            for r in refs {
                phase_map.entry(r.clone()).or_insert(ProgressRecord {
                    state: PhaseState::Pending,
                    last_attempt_at: 0,
                    error: None,
                });
            }
        }
        self.persist();
    }

    /// Return refs to `pending` regardless of current state. For refs whose
    /// work legitimately starts over, e.g. an object whose content hash
    /// changed after the run that completed it.
    pub fn reset(&self, phase: &str, refs: &[String]) {
        {
            let mut data = self.inner.lock().expect("progress mutex poisoned");
            let phase_map = data.entry(phase.to_string()).or_default();
            for r in refs {
                phase_map.insert(
                    r.clone(),
                    ProgressRecord {
                        state: PhaseState::Pending,
                        last_attempt_at: chrono::Utc::now().timestamp(),
                        error: None,
                    },
                );
            }
        }
        self.persist();
    }

    /// Record a state transition. A `done` record never regresses; any
    /// other transition wins.
    pub fn mark(&self, phase: &str, object_ref: &str, state: PhaseState, error: Option<String>) {
        {
            let mut data = self.inner.lock().expect("progress mutex poisoned");
            let phase_map = data.entry(phase.to_string()).or_default();
            if let Some(existing) = phase_map.get(object_ref) {
                if existing.state == PhaseState::Done && state != PhaseState::Done {
                    warn!(phase, object_ref, ?state, "ignoring regression of done record");
                    return;
                }
            }
            phase_map.insert(
                object_ref.to_string(),
                ProgressRecord {
                    state,
                    last_attempt_at: chrono::Utc::now().timestamp(),
                    error,
                },
            );
        }
        self.persist();
    }

    pub fn get(&self, phase: &str, object_ref: &str) -> Option<ProgressRecord> {
        let data = self.inner.lock().expect("progress mutex poisoned");
        data.get(phase).and_then(|m| m.get(object_ref)).cloned()
    }

    /// Refs not yet `done` in `phase`: pending, in-flight (a previous run
    /// died mid-task), and errored (retryable) records all qualify.
    pub fn pending(&self, phase: &str) -> BTreeSet<String> {
        let data = self.inner.lock().expect("progress mutex poisoned");
        data.get(phase)
            .map(|m| {
                m.iter()
                    .filter(|(_, rec)| rec.state != PhaseState::Done)
                    .map(|(r, _)| r.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn counts(&self, phase: &str) -> PhaseCounts {
        let data = self.inner.lock().expect("progress mutex poisoned");
        let mut counts = PhaseCounts::default();
        if let Some(map) = data.get(phase) {
            for rec in map.values() {
                match rec.state {
                    PhaseState::Done => counts.done += 1,
                    PhaseState::Error => counts.errored += 1,
                    PhaseState::Pending | PhaseState::InFlight => counts.pending += 1,
                }
            }
        }
        counts
    }

    /// Most recent error messages in `phase`, newest first, capped at `n`.
    pub fn top_errors(&self, phase: &str, n: usize) -> Vec<(String, String)> {
        let data = self.inner.lock().expect("progress mutex poisoned");
        let mut errored: Vec<(i64, String, String)> = data
            .get(phase)
            .map(|m| {
                m.iter()
                    .filter(|(_, rec)| rec.state == PhaseState::Error)
                    .map(|(r, rec)| {
                        (
                            rec.last_attempt_at,
                            r.clone(),
                            rec.error.clone().unwrap_or_default(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        errored.sort_by(|a, b| b.0.cmp(&a.0));
        errored
            .into_iter()
            .take(n)
            .map(|(_, r, e)| (r, e))
            .collect()
    }

    /// Queue a snapshot for the writer task.
    fn persist(&self) {
        let encoded = {
            let data = self.inner.lock().expect("progress mutex poisoned");
            serde_json::to_string_pretty(&*data).expect("progress data serializes")
        };
        if self.tx.send(PersistMsg::Write(encoded)).is_err() {
            warn!(path = %self.path.display(), "progress writer task gone");
        }
    }

    /// Wait until every queued snapshot has reached disk.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(PersistMsg::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn writer_task(path: PathBuf, mut rx: mpsc::UnboundedReceiver<PersistMsg>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            PersistMsg::Write(mut snapshot) => {
                // Only the latest queued snapshot matters.
                while let Ok(next) = rx.try_recv() {
                    match next {
                        PersistMsg::Write(s) => snapshot = s,
                        PersistMsg::Flush(ack) => {
                            write_snapshot(&path, &snapshot);
                            let _ = ack.send(());
                            snapshot = String::new();
                            break;
                        }
                    }
                }
                if !snapshot.is_empty() {
                    write_snapshot(&path, &snapshot);
                }
            }
            PersistMsg::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

fn write_snapshot(path: &PathBuf, snapshot: &str) {
    let tmp = path.with_extension("json.tmp");
    let result = std::fs::write(&tmp, snapshot)
        .and_then(|_| std::fs::rename(&tmp, path));
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "progress write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn mark_and_pending() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::open(dir.path().join("progress.json")).unwrap();
        store.seed("describe", &["Account".into(), "Contact".into(), "Lead".into()]);
        store.mark("describe", "Account", PhaseState::Done, None);
        store.mark("describe", "Contact", PhaseState::Error, Some("boom".into()));

        let pending = store.pending("describe");
        assert!(!pending.contains("Account"));
        assert!(pending.contains("Contact"));
        assert!(pending.contains("Lead"));

        let counts = store.counts("describe");
        assert_eq!(counts.done, 1);
        assert_eq!(counts.errored, 1);
        assert_eq!(counts.pending, 1);
    }

    #[tokio::test]
    async fn done_never_regresses() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::open(dir.path().join("progress.json")).unwrap();
        store.mark("describe", "Account", PhaseState::Done, None);
        store.mark("describe", "Account", PhaseState::InFlight, None);
        assert_eq!(
            store.get("describe", "Account").unwrap().state,
            PhaseState::Done
        );
    }

    #[tokio::test]
    async fn reset_returns_done_refs_to_pending() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::open(dir.path().join("progress.json")).unwrap();
        store.mark("upload", "Account", PhaseState::Done, None);
        store.reset("upload", &["Account".into()]);
        assert_eq!(
            store.get("upload", "Account").unwrap().state,
            PhaseState::Pending
        );
        // A fresh error after the reset is recorded, not swallowed.
        store.mark("upload", "Account", PhaseState::Error, Some("boom".into()));
        assert_eq!(
            store.get("upload", "Account").unwrap().state,
            PhaseState::Error
        );
    }

    #[tokio::test]
    async fn survives_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        {
            let store = ProgressStore::open(path.clone()).unwrap();
            store.seed("security", &["Account".into(), "Contact".into()]);
            store.mark("security", "Account", PhaseState::Done, None);
            store.flush().await;
        }
        let reopened = ProgressStore::open(path).unwrap();
        let pending = reopened.pending("security");
        assert_eq!(pending.len(), 1);
        assert!(pending.contains("Contact"));
    }

    #[tokio::test]
    async fn in_flight_counts_as_pending_on_resume() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        {
            let store = ProgressStore::open(path.clone()).unwrap();
            store.mark("describe", "Account", PhaseState::InFlight, None);
            store.flush().await;
        }
        let reopened = ProgressStore::open(path).unwrap();
        assert!(reopened.pending("describe").contains("Account"));
    }

    #[tokio::test]
    async fn phases_are_independent() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::open(dir.path().join("progress.json")).unwrap();
        store.mark("describe", "Account", PhaseState::Done, None);
        assert!(store.get("stats", "Account").is_none());
        assert!(store.pending("stats").is_empty());
    }

    #[tokio::test]
    async fn top_errors_capped() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::open(dir.path().join("progress.json")).unwrap();
        for i in 0..10 {
            store.mark(
                "stats",
                &format!("Obj{i}__c"),
                PhaseState::Error,
                Some(format!("error {i}")),
            );
        }
        assert_eq!(store.top_errors("stats", 3).len(), 3);
    }
}
