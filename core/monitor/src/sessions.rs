//! Work session accounting.
//!
//! A session is the span between a document being opened and closed, with the
//! number of saves in between. Transitions are computed by the pure
//! [`reduce_session`] reducer; [`WorkSessionTracker`] owns the table of active
//! sessions and hands every transition to a [`SessionStore`].

use bomwatch_model::{normalize_path, SessionState, WorkSession};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::backoff::RetryPolicy;
use crate::error::{MonitorError, Result};

pub const SAVE_LABEL: &str = "SAVE";

pub trait SessionStore: Send + Sync {
    fn upsert_session(&self, session: &WorkSession) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    Open {
        file_path: String,
        project_id: Option<String>,
        machine_id: Option<i64>,
        engineer: String,
    },
    Save,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum SessionUpdate {
    Started(WorkSession),
    Updated {
        session: WorkSession,
        label: &'static str,
    },
    Ended(WorkSession),
    Skip,
}

pub fn reduce_session(
    current: Option<&WorkSession>,
    action: &SessionAction,
    now: DateTime<Utc>,
) -> SessionUpdate {
    let active = current.filter(|session| session.is_active());

    match (action, active) {
        (SessionAction::Open { .. }, Some(_)) => SessionUpdate::Skip,
        (
            SessionAction::Open {
                file_path,
                project_id,
                machine_id,
                engineer,
            },
            None,
        ) => SessionUpdate::Started(WorkSession {
            id: ulid::Ulid::new().to_string(),
            file_path: file_path.clone(),
            project_id: project_id.clone(),
            machine_id: *machine_id,
            engineer: engineer.clone(),
            start_time: now,
            end_time: None,
            last_save_at: None,
            save_count: 0,
            state: SessionState::Active,
        }),
        (SessionAction::Save, Some(session)) => {
            let mut session = session.clone();
            session.save_count = session.save_count.saturating_add(1);
            session.last_save_at = Some(now);
            SessionUpdate::Updated {
                session,
                label: SAVE_LABEL,
            }
        }
        (SessionAction::Close, Some(session)) => SessionUpdate::Ended(end_session(session, now)),
        (SessionAction::Save | SessionAction::Close, None) => SessionUpdate::Skip,
    }
}

fn end_session(session: &WorkSession, now: DateTime<Utc>) -> WorkSession {
    let mut ended = session.clone();
    // Clock skew between events must not produce a negative duration.
    ended.end_time = Some(now.max(session.start_time));
    ended.state = SessionState::Ended;
    ended
}

pub struct WorkSessionTracker {
    active: Mutex<HashMap<String, WorkSession>>,
    /// Cleared by `end_all`; read and written only while `active` is locked.
    accepting: AtomicBool,
    store: Arc<dyn SessionStore>,
    finalize_policy: RetryPolicy,
}

impl WorkSessionTracker {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self::with_policy(store, RetryPolicy::session_persistence())
    }

    pub fn with_policy(store: Arc<dyn SessionStore>, finalize_policy: RetryPolicy) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            store,
            finalize_policy,
        }
    }

    pub fn open(
        &self,
        file_path: &str,
        project_id: Option<String>,
        machine_id: Option<i64>,
        engineer: &str,
        now: DateTime<Utc>,
    ) -> Option<WorkSession> {
        let action = SessionAction::Open {
            file_path: file_path.to_string(),
            project_id,
            machine_id,
            engineer: engineer.to_string(),
        };
        self.apply(file_path, &action, now)
    }

    pub fn save(&self, file_path: &str, now: DateTime<Utc>) -> Option<WorkSession> {
        self.apply(file_path, &SessionAction::Save, now)
    }

    pub fn close(&self, file_path: &str, now: DateTime<Utc>) -> Option<WorkSession> {
        self.apply(file_path, &SessionAction::Close, now)
    }

    /// Ends every active session and refuses new ones until [`resume`](Self::resume);
    /// used on shutdown.
    pub fn end_all(&self, now: DateTime<Utc>) -> Vec<WorkSession> {
        let ended: Vec<WorkSession> = {
            let mut active = self.lock();
            self.accepting.store(false, Ordering::Release);
            active
                .drain()
                .map(|(_, session)| end_session(&session, now))
                .collect()
        };
        for session in &ended {
            self.finalize(session);
        }
        if !ended.is_empty() {
            info!(count = ended.len(), "Ended active work sessions");
        }
        ended
    }

    pub fn resume(&self) {
        let _active = self.lock();
        self.accepting.store(true, Ordering::Release);
    }

    pub fn active_session(&self, file_path: &str) -> Option<WorkSession> {
        self.lock().get(&normalize_path(file_path)).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    fn apply(
        &self,
        file_path: &str,
        action: &SessionAction,
        now: DateTime<Utc>,
    ) -> Option<WorkSession> {
        let key = normalize_path(file_path);
        let update = {
            let mut active = self.lock();
            let refused = matches!(action, SessionAction::Open { .. })
                && !self.accepting.load(Ordering::Acquire);
            let update = if refused {
                warn!(path = file_path, "Session tracker stopped; open ignored");
                SessionUpdate::Skip
            } else {
                reduce_session(active.get(&key), action, now)
            };
            match &update {
                SessionUpdate::Started(session) | SessionUpdate::Updated { session, .. } => {
                    active.insert(key.clone(), session.clone());
                }
                SessionUpdate::Ended(_) => {
                    active.remove(&key);
                }
                SessionUpdate::Skip => {}
            }
            update
        };

        match update {
            SessionUpdate::Started(session) => {
                debug!(path = %session.file_path, session_id = %session.id, "Work session started");
                self.persist(&session);
                Some(session)
            }
            SessionUpdate::Updated { session, label } => {
                debug!(
                    path = %session.file_path,
                    session_id = %session.id,
                    save_count = session.save_count,
                    change = label,
                    "Work session updated"
                );
                self.persist(&session);
                Some(session)
            }
            SessionUpdate::Ended(session) => {
                info!(
                    path = %session.file_path,
                    session_id = %session.id,
                    save_count = session.save_count,
                    duration_secs = session.duration().map(|d| d.num_seconds()).unwrap_or(0),
                    "Work session ended"
                );
                self.finalize(&session);
                Some(session)
            }
            SessionUpdate::Skip => {
                debug!(path = file_path, ?action, "Session transition ignored");
                None
            }
        }
    }

    fn persist(&self, session: &WorkSession) {
        if let Err(err) = self.store.upsert_session(session) {
            warn!(session_id = %session.id, error = %err, "Failed to persist work session");
        }
    }

    fn finalize(&self, session: &WorkSession) {
        let result = self.finalize_policy.run(
            "session finalization",
            |_| self.store.upsert_session(session),
            |err| matches!(err, MonitorError::Storage(_)),
        );
        if let Err(err) = result {
            warn!(
                session_id = %session.id,
                path = %session.file_path,
                error = %err,
                "Giving up on persisting ended work session"
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, WorkSession>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    #[derive(Default)]
    struct MemoryStore {
        writes: Mutex<Vec<WorkSession>>,
        failures_left: Mutex<u32>,
    }

    impl MemoryStore {
        fn failing(times: u32) -> Self {
            Self {
                writes: Mutex::new(Vec::new()),
                failures_left: Mutex::new(times),
            }
        }

        fn writes(&self) -> Vec<WorkSession> {
            self.writes.lock().expect("writes lock").clone()
        }
    }

    impl SessionStore for MemoryStore {
        fn upsert_session(&self, session: &WorkSession) -> Result<()> {
            let mut failures = self.failures_left.lock().expect("failures lock");
            if *failures > 0 {
                *failures -= 1;
                return Err(MonitorError::Storage("database is locked".to_string()));
            }
            self.writes.lock().expect("writes lock").push(session.clone());
            Ok(())
        }
    }

    fn open_action() -> SessionAction {
        SessionAction::Open {
            file_path: "/w/a.iam".to_string(),
            project_id: Some("P-100".to_string()),
            machine_id: Some(5),
            engineer: "dana".to_string(),
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2))
    }

    #[test]
    fn open_starts_session() {
        let now = Utc::now();
        match reduce_session(None, &open_action(), now) {
            SessionUpdate::Started(session) => {
                assert_eq!(session.state, SessionState::Active);
                assert_eq!(session.save_count, 0);
                assert_eq!(session.start_time, now);
                assert_eq!(session.engineer, "dana");
                assert_eq!(session.machine_id, Some(5));
            }
            other => panic!("unexpected update: {other:?}"),
        }
    }

    #[test]
    fn open_while_active_is_skipped() {
        let now = Utc::now();
        let SessionUpdate::Started(session) = reduce_session(None, &open_action(), now) else {
            panic!("expected start");
        };
        assert_eq!(
            reduce_session(Some(&session), &open_action(), now),
            SessionUpdate::Skip
        );
    }

    #[test]
    fn save_and_close_without_session_are_skipped() {
        let now = Utc::now();
        assert_eq!(reduce_session(None, &SessionAction::Save, now), SessionUpdate::Skip);
        assert_eq!(reduce_session(None, &SessionAction::Close, now), SessionUpdate::Skip);
    }

    #[test]
    fn save_is_labelled() {
        let now = Utc::now();
        let SessionUpdate::Started(session) = reduce_session(None, &open_action(), now) else {
            panic!("expected start");
        };
        match reduce_session(Some(&session), &SessionAction::Save, now) {
            SessionUpdate::Updated { session, label } => {
                assert_eq!(label, SAVE_LABEL);
                assert_eq!(session.save_count, 1);
                assert_eq!(session.last_save_at, Some(now));
            }
            other => panic!("unexpected update: {other:?}"),
        }
    }

    #[test]
    fn close_never_ends_before_start() {
        let start = Utc::now();
        let SessionUpdate::Started(session) = reduce_session(None, &open_action(), start) else {
            panic!("expected start");
        };
        let SessionUpdate::Ended(ended) =
            reduce_session(Some(&session), &SessionAction::Close, start - ChronoDuration::seconds(5))
        else {
            panic!("expected end");
        };
        assert_eq!(ended.end_time, Some(start));
        assert_eq!(ended.state, SessionState::Ended);
    }

    #[test]
    fn tracker_counts_saves_and_persists_every_transition() {
        let store = Arc::new(MemoryStore::default());
        let tracker = WorkSessionTracker::with_policy(store.clone(), fast_policy());
        let start = Utc::now();

        let opened = tracker
            .open("/w/a.iam", None, None, "dana", start)
            .expect("opened");
        tracker.save("/w/A.IAM", start + ChronoDuration::seconds(10));
        tracker.save("/w/a.iam", start + ChronoDuration::seconds(20));
        let ended = tracker
            .close("/w/a.iam", start + ChronoDuration::seconds(60))
            .expect("ended");

        assert_eq!(ended.id, opened.id);
        assert_eq!(ended.save_count, 2);
        assert_eq!(ended.duration(), Some(ChronoDuration::seconds(60)));
        assert_eq!(tracker.active_count(), 0);
        assert_eq!(store.writes().len(), 4);
    }

    #[test]
    fn reopen_creates_new_session() {
        let store = Arc::new(MemoryStore::default());
        let tracker = WorkSessionTracker::with_policy(store, fast_policy());
        let now = Utc::now();

        let first = tracker.open("/w/a.iam", None, None, "dana", now).expect("first");
        tracker.close("/w/a.iam", now);
        let second = tracker.open("/w/a.iam", None, None, "dana", now).expect("second");

        assert_ne!(first.id, second.id);
    }

    #[test]
    fn opens_after_end_all_are_refused_until_resumed() {
        let store = Arc::new(MemoryStore::default());
        let tracker = WorkSessionTracker::with_policy(store.clone(), fast_policy());
        let now = Utc::now();
        tracker.open("/w/a.iam", None, None, "dana", now);

        tracker.end_all(now);
        assert!(tracker.open("/w/late.iam", None, None, "dana", now).is_none());
        assert_eq!(tracker.active_count(), 0);
        assert!(store.writes().iter().all(|s| s.file_path != "/w/late.iam"));

        tracker.resume();
        assert!(tracker.open("/w/late.iam", None, None, "dana", now).is_some());
    }

    #[test]
    fn end_all_finalizes_with_retry() {
        let store = Arc::new(MemoryStore::failing(0));
        let tracker = WorkSessionTracker::with_policy(store.clone(), fast_policy());
        let now = Utc::now();
        tracker.open("/w/a.iam", None, None, "dana", now);
        tracker.open("/w/b.iam", None, None, "dana", now);

        *store.failures_left.lock().expect("failures lock") = 2;
        let ended = tracker.end_all(now + ChronoDuration::seconds(1));

        assert_eq!(ended.len(), 2);
        assert!(ended.iter().all(|s| s.state == SessionState::Ended));
        assert_eq!(tracker.active_count(), 0);
        let finals: Vec<_> = store
            .writes()
            .into_iter()
            .filter(|s| s.state == SessionState::Ended)
            .collect();
        assert_eq!(finals.len(), 2);
    }
}
