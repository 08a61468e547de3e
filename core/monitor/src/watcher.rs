use bomwatch_model::{
    normalize_path, DocumentEvent, DocumentEventType, DocumentInfo, DocumentSnapshot,
};
use chrono::{DateTime, Utc};
use std::cmp;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::notify::Notifier;
use crate::source::DocumentSource;

const STOP_CHECK_SLICE_MS: u64 = 100;

/// Known-document set keyed by normalized path.
pub type KnownDocuments = HashMap<String, DocumentSnapshot>;

pub struct DocumentWatcher {
    source: Arc<dyn DocumentSource>,
    notifier: Arc<dyn Notifier>,
    // None until the first successful poll, so that poll reports every open
    // document as Opened.
    known: Mutex<Option<KnownDocuments>>,
    polling: AtomicBool,
    consecutive_failures: AtomicU32,
    warning_after: u32,
}

/// Clears the reentrancy flag however the poll exits.
struct PollGuard<'a>(&'a AtomicBool);

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl DocumentWatcher {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        notifier: Arc<dyn Notifier>,
        warning_after: u32,
    ) -> Self {
        Self {
            source,
            notifier,
            known: Mutex::new(None),
            polling: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            warning_after: warning_after.max(1),
        }
    }

    /// Runs one poll-and-diff cycle.
    ///
    /// Returns `None` when the cycle was skipped: either a previous cycle is
    /// still running or the source could not be reached. A skipped cycle
    /// leaves the known set untouched.
    pub fn poll_once(&self) -> Option<Vec<DocumentEvent>> {
        if self
            .polling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Previous poll still running; skipping cycle");
            return None;
        }
        let _guard = PollGuard(&self.polling);

        let listing = match self.source.list_open_documents() {
            Ok(listing) => listing,
            Err(err) => {
                self.record_failure(&err.to_string());
                return None;
            }
        };
        self.record_success();

        let observed_at = Utc::now();
        let current = build_known_set(listing);

        let mut known = match self.known.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let events = compute_diff(known.as_ref(), &current, observed_at);
        *known = Some(current);

        if !events.is_empty() {
            debug!(events = events.len(), "Document changes detected");
        }
        Some(events)
    }

    pub fn known_paths(&self) -> Vec<String> {
        let known = match self.known.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut paths: Vec<String> = known
            .as_ref()
            .map(|set| set.values().map(|doc| doc.path.clone()).collect())
            .unwrap_or_default();
        paths.sort();
        paths
    }

    fn record_failure(&self, error: &str) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(error, failures, "CAD source unavailable; skipping poll");
        if failures % self.warning_after == 0 {
            self.notifier.warning(
                "CAD source unavailable",
                &format!(
                    "Unable to reach the modeling application for {} consecutive polls: {}",
                    failures, error
                ),
            );
        }
    }

    fn record_success(&self) {
        let failures = self.consecutive_failures.swap(0, Ordering::AcqRel);
        if failures > 0 {
            info!(failures, "CAD source reachable again");
        }
    }
}

fn build_known_set(listing: Vec<DocumentInfo>) -> KnownDocuments {
    let mut current = KnownDocuments::with_capacity(listing.len());
    for info in listing {
        if info.path.trim().is_empty() {
            continue;
        }
        let key = normalize_path(&info.path);
        let snapshot = DocumentSnapshot::from(info);
        match current.get(&key) {
            // The same file can show up twice (e.g. open in two windows);
            // keep the newest write time.
            Some(existing) if existing.last_write_time >= snapshot.last_write_time => {}
            _ => {
                current.insert(key, snapshot);
            }
        }
    }
    current
}

/// Diffs two known sets. Events are ordered Opened, Saved, Closed, each group
/// sorted by path, so a path's Opened always precedes anything else for it.
pub fn compute_diff(
    previous: Option<&KnownDocuments>,
    current: &KnownDocuments,
    observed_at: DateTime<Utc>,
) -> Vec<DocumentEvent> {
    let mut opened = Vec::new();
    let mut saved = Vec::new();
    let mut closed = Vec::new();

    for (key, doc) in current {
        match previous.and_then(|set| set.get(key)) {
            None => opened.push(event(DocumentEventType::Opened, doc, observed_at)),
            Some(before) if before.last_write_time != doc.last_write_time => {
                saved.push(event(DocumentEventType::Saved, doc, observed_at))
            }
            Some(_) => {}
        }
    }

    if let Some(previous) = previous {
        for (key, doc) in previous {
            if !current.contains_key(key) {
                closed.push(event(DocumentEventType::Closed, doc, observed_at));
            }
        }
    }

    for group in [&mut opened, &mut saved, &mut closed] {
        group.sort_by(|left, right| left.path.cmp(&right.path));
    }
    opened.extend(saved);
    opened.extend(closed);
    opened
}

fn event(
    event_type: DocumentEventType,
    doc: &DocumentSnapshot,
    observed_at: DateTime<Utc>,
) -> DocumentEvent {
    DocumentEvent {
        event_type,
        path: doc.path.clone(),
        kind: doc.kind,
        last_write_time: doc.last_write_time,
        observed_at,
    }
}

/// Drives `poll_once` on a dedicated thread until `stop` is raised. Every
/// emitted event is handed to `sink`, which must not block on downstream work.
pub fn spawn_poll_loop(
    watcher: Arc<DocumentWatcher>,
    initial_delay: Duration,
    interval: Duration,
    stop: Arc<AtomicBool>,
    sink: impl Fn(DocumentEvent) + Send + 'static,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        if !sleep_unless_stopped(initial_delay, &stop) {
            return;
        }
        info!(
            interval_ms = interval.as_millis() as u64,
            "Document polling started"
        );
        loop {
            let started = Instant::now();
            if let Some(events) = watcher.poll_once() {
                for event in events {
                    sink(event);
                }
            }
            let remaining = interval.saturating_sub(started.elapsed());
            if !sleep_unless_stopped(remaining, &stop) {
                break;
            }
        }
        info!("Document polling stopped");
    })
}

/// Sleeps in short slices; returns false once `stop` is observed.
fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(cmp::min(
            deadline - now,
            Duration::from_millis(STOP_CHECK_SLICE_MS),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MonitorError, Result};
    use crate::notify::RecordingNotifier;
    use bomwatch_model::{DocumentKind, RawBomItem};
    use std::collections::VecDeque;

    fn at(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("parse")
            .with_timezone(&Utc)
    }

    fn doc(path: &str, written: &str) -> DocumentInfo {
        DocumentInfo {
            path: path.to_string(),
            last_write_time: at(written),
            type_tag: None,
        }
    }

    type Listing = Result<Vec<DocumentInfo>>;

    #[derive(Clone)]
    struct FakeSource {
        listings: Arc<Mutex<VecDeque<Listing>>>,
    }

    impl FakeSource {
        fn new(listings: Vec<Listing>) -> Self {
            Self {
                listings: Arc::new(Mutex::new(VecDeque::from(listings))),
            }
        }
    }

    impl DocumentSource for FakeSource {
        fn list_open_documents(&self) -> Result<Vec<DocumentInfo>> {
            self.listings
                .lock()
                .expect("lock listings")
                .pop_front()
                .unwrap_or_else(|| Err(MonitorError::TransientSource("exhausted".to_string())))
        }

        fn read_custom_property(&self, _path: &str, _name: &str) -> Result<Option<String>> {
            Ok(None)
        }

        fn extract_bom(&self, path: &str) -> Result<Vec<RawBomItem>> {
            Err(MonitorError::extraction(path, "not supported"))
        }
    }

    fn watcher(listings: Vec<Listing>) -> (DocumentWatcher, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::new());
        let watcher = DocumentWatcher::new(
            Arc::new(FakeSource::new(listings)),
            notifier.clone(),
            3,
        );
        (watcher, notifier)
    }

    fn kinds(events: &[DocumentEvent]) -> Vec<(DocumentEventType, &str)> {
        events
            .iter()
            .map(|event| (event.event_type, event.path.as_str()))
            .collect()
    }

    #[test]
    fn first_poll_reports_every_open_document_as_opened() {
        let (watcher, _) = watcher(vec![Ok(vec![
            doc("/w/Gearbox.iam", "2026-03-01T10:00:00Z"),
            doc("/w/Shaft.ipt", "2026-03-01T09:00:00Z"),
        ])]);

        let events = watcher.poll_once().expect("poll");
        assert_eq!(
            kinds(&events),
            vec![
                (DocumentEventType::Opened, "/w/Gearbox.iam"),
                (DocumentEventType::Opened, "/w/Shaft.ipt"),
            ]
        );
        assert_eq!(events[0].kind, DocumentKind::Assembly);
        assert_eq!(events[1].kind, DocumentKind::Part);
    }

    #[test]
    fn detects_open_save_and_close() {
        let (watcher, _) = watcher(vec![
            Ok(vec![
                doc("/w/a.iam", "2026-03-01T10:00:00Z"),
                doc("/w/b.iam", "2026-03-01T10:00:00Z"),
            ]),
            Ok(vec![
                doc("/w/a.iam", "2026-03-01T10:05:00Z"),
                doc("/w/c.iam", "2026-03-01T10:01:00Z"),
            ]),
        ]);

        watcher.poll_once().expect("baseline");
        let events = watcher.poll_once().expect("second poll");
        assert_eq!(
            kinds(&events),
            vec![
                (DocumentEventType::Opened, "/w/c.iam"),
                (DocumentEventType::Saved, "/w/a.iam"),
                (DocumentEventType::Closed, "/w/b.iam"),
            ]
        );
    }

    #[test]
    fn unchanged_listing_yields_no_events() {
        let listing = vec![doc("/w/a.iam", "2026-03-01T10:00:00Z")];
        let (watcher, _) = watcher(vec![Ok(listing.clone()), Ok(listing)]);

        watcher.poll_once().expect("baseline");
        assert!(watcher.poll_once().expect("second poll").is_empty());
    }

    #[test]
    fn source_failure_preserves_known_set() {
        let (watcher, _) = watcher(vec![
            Ok(vec![doc("/w/a.iam", "2026-03-01T10:00:00Z")]),
            Err(MonitorError::TransientSource("offline".to_string())),
            Ok(vec![doc("/w/a.iam", "2026-03-01T10:00:00Z")]),
        ]);

        watcher.poll_once().expect("baseline");
        assert!(watcher.poll_once().is_none());
        assert_eq!(watcher.known_paths(), vec!["/w/a.iam".to_string()]);

        let events = watcher.poll_once().expect("reconnect");
        assert!(events.is_empty(), "no spurious Closed/Opened on reconnect");
    }

    #[test]
    fn repeated_failures_raise_periodic_warning() {
        let failures = (0..6)
            .map(|_| Err(MonitorError::TransientSource("offline".to_string())))
            .collect();
        let (watcher, notifier) = watcher(failures);

        for _ in 0..6 {
            assert!(watcher.poll_once().is_none());
        }
        let warnings = notifier.entries();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].message.contains("3 consecutive"));
        assert!(warnings[1].message.contains("6 consecutive"));
    }

    #[test]
    fn duplicate_paths_keep_newest_write_time() {
        let current = build_known_set(vec![
            doc("C:\\W\\A.iam", "2026-03-01T10:05:00Z"),
            doc("c:/w/a.iam", "2026-03-01T10:00:00Z"),
        ]);
        assert_eq!(current.len(), 1);
        let snapshot = current.get("c:/w/a.iam").expect("entry");
        assert_eq!(snapshot.last_write_time, at("2026-03-01T10:05:00Z"));
    }

    #[test]
    fn compute_diff_without_previous_is_all_opened() {
        let current = build_known_set(vec![doc("/w/a.iam", "2026-03-01T10:00:00Z")]);
        let events = compute_diff(None, &current, Utc::now());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, DocumentEventType::Opened);
    }

    #[test]
    fn reentrant_poll_is_skipped() {
        let (watcher, _) = watcher(vec![Ok(Vec::new())]);
        watcher.polling.store(true, Ordering::Release);
        assert!(watcher.poll_once().is_none());
        watcher.polling.store(false, Ordering::Release);
        assert!(watcher.poll_once().is_some());
    }

    #[test]
    fn poll_loop_stops_promptly() {
        let (watcher, _) = watcher(Vec::new());
        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn_poll_loop(
            Arc::new(watcher),
            Duration::from_millis(0),
            Duration::from_secs(60),
            Arc::clone(&stop),
            |_| {},
        );
        thread::sleep(Duration::from_millis(50));
        stop.store(true, Ordering::Release);
        handle.join().expect("poll loop joins");
    }
}
