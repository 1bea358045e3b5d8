//! Bounded, newest-first history of user-sync runs.
//!
//! The ring lock only guards membership of the ring. Each run's terminal
//! state lives in a [`OnceLock`], so finishing one run never waits on
//! readers of the ring and the transition can only happen once.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use serde::Serialize;
use teamsync_core::CorrelationId;
use time::OffsetDateTime;

/// Default number of runs kept.
pub const DEFAULT_CAPACITY: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    InProgress,
    Success,
    Failure,
}

#[derive(Debug)]
struct RunOutcome {
    finished_at: OffsetDateTime,
    error: Option<String>,
}

/// One user-sync run.
#[derive(Debug)]
pub struct UserSyncRun {
    correlation_id: CorrelationId,
    started_at: OffsetDateTime,
    outcome: OnceLock<RunOutcome>,
}

impl UserSyncRun {
    fn new(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            started_at: OffsetDateTime::now_utc(),
            outcome: OnceLock::new(),
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn started_at(&self) -> OffsetDateTime {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<OffsetDateTime> {
        self.outcome.get().map(|outcome| outcome.finished_at)
    }

    pub fn status(&self) -> RunStatus {
        match self.outcome.get() {
            None => RunStatus::InProgress,
            Some(RunOutcome { error: None, .. }) => RunStatus::Success,
            Some(RunOutcome { error: Some(_), .. }) => RunStatus::Failure,
        }
    }

    pub fn error(&self) -> Option<&str> {
        self.outcome.get().and_then(|outcome| outcome.error.as_deref())
    }

    /// Marks the run successful. Returns `false` if it already finished.
    pub fn succeed(&self) -> bool {
        self.finish(None)
    }

    /// Marks the run failed. Returns `false` if it already finished.
    pub fn fail(&self, error: impl Into<String>) -> bool {
        self.finish(Some(error.into()))
    }

    fn finish(&self, error: Option<String>) -> bool {
        self.outcome
            .set(RunOutcome {
                finished_at: OffsetDateTime::now_utc(),
                error,
            })
            .is_ok()
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            correlation_id: self.correlation_id,
            started_at: self.started_at,
            finished_at: self.finished_at(),
            status: self.status(),
            error: self.error().map(str::to_string),
        }
    }
}

/// Serializable view of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub correlation_id: CorrelationId,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Ring of the most recent runs.
#[derive(Debug)]
pub struct RunHistory {
    capacity: usize,
    runs: RwLock<VecDeque<Arc<UserSyncRun>>>,
}

impl RunHistory {
    /// Creates a history keeping at most `capacity` runs (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            runs: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records the start of a run, evicting the oldest if full.
    pub fn start(&self, correlation_id: CorrelationId) -> Arc<UserSyncRun> {
        let run = Arc::new(UserSyncRun::new(correlation_id));
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        runs.push_front(run.clone());
        runs.truncate(self.capacity);
        run
    }

    /// Runs, newest first.
    pub fn runs(&self) -> Vec<Arc<UserSyncRun>> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn snapshots(&self) -> Vec<RunSnapshot> {
        self.runs().iter().map(|run| run.snapshot()).collect()
    }
}

impl Default for RunHistory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_is_bounded_and_newest_first() {
        let history = RunHistory::new(3);
        let ids: Vec<CorrelationId> = (0..5).map(|_| CorrelationId::new()).collect();
        for id in &ids {
            history.start(*id);
        }
        let kept: Vec<CorrelationId> = history.runs().iter().map(|r| r.correlation_id()).collect();
        assert_eq!(kept, vec![ids[4], ids[3], ids[2]]);
    }

    #[test]
    fn test_terminal_transition_happens_once() {
        let history = RunHistory::default();
        let run = history.start(CorrelationId::new());
        assert_eq!(run.status(), RunStatus::InProgress);
        assert!(run.finished_at().is_none());

        assert!(run.fail("directory unavailable"));
        assert!(!run.succeed());
        assert_eq!(run.status(), RunStatus::Failure);
        assert_eq!(run.error(), Some("directory unavailable"));
        assert!(run.finished_at().is_some());
    }

    #[test]
    fn test_concurrent_finishers_race_safely() {
        let history = Arc::new(RunHistory::default());
        let run = history.start(CorrelationId::new());
        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let run = run.clone();
                    let history = history.clone();
                    scope.spawn(move || {
                        let _ = history.snapshots();
                        if i % 2 == 0 { run.succeed() } else { run.fail("boom") }
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| usize::from(h.join().unwrap()))
                .sum()
        });
        assert_eq!(winners, 1);
        assert_ne!(run.status(), RunStatus::InProgress);
    }

    #[test]
    fn test_snapshot_serializes_status() {
        let history = RunHistory::new(0);
        assert_eq!(history.capacity(), 1);
        let run = history.start(CorrelationId::new());
        let json = serde_json::to_value(run.snapshot()).unwrap();
        assert_eq!(json["status"], "in-progress");
        assert!(json["finishedAt"].is_null());
        assert!(json.get("error").is_none());
    }
}
