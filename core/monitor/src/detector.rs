//! BOM change detection.
//!
//! Turns a Saved event for an assembly into a decision: the first snapshot of
//! a key is its baseline, a snapshot whose canonical hash differs from the
//! last persisted one is a change, anything else is unchanged.

use bomwatch_model::{validate_items, AssemblyKey, BomItem, BomSnapshot, RawBomItem};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::source::DocumentSource;
use crate::store::Db;

/// Read side of the version store the detector needs.
pub trait VersionHistory: Send + Sync {
    fn latest_hash(&self, assembly_key: &str) -> Result<Option<String>>;
}

impl VersionHistory for Db {
    fn latest_hash(&self, assembly_key: &str) -> Result<Option<String>> {
        Db::latest_hash(self, assembly_key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorSettings {
    pub stability_attempts: u32,
    pub stability_delay: Duration,
    pub extraction_timeout: Duration,
    pub max_concurrent: usize,
}

impl From<&MonitorConfig> for DetectorSettings {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            stability_attempts: config.stability.max_attempts,
            stability_delay: config.stability_delay(),
            extraction_timeout: config.extraction_timeout(),
            max_concurrent: config.extraction.max_concurrent,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeDecision {
    /// No hash known for the key, in memory or in the store.
    Baseline(BomSnapshot),
    Changed {
        snapshot: BomSnapshot,
        previous_hash: String,
    },
    Unchanged {
        content_hash: String,
    },
}

impl ChangeDecision {
    pub fn snapshot(&self) -> Option<&BomSnapshot> {
        match self {
            ChangeDecision::Baseline(snapshot) | ChangeDecision::Changed { snapshot, .. } => {
                Some(snapshot)
            }
            ChangeDecision::Unchanged { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stability {
    Stable,
    Unsettled,
    /// The path is not on local disk; nothing to sample.
    Missing,
}

pub struct BomChangeDetector {
    source: Arc<dyn DocumentSource>,
    history: Arc<dyn VersionHistory>,
    settings: DetectorSettings,
    permits: Arc<ExtractionPermits>,
    last_hashes: Mutex<HashMap<String, String>>,
}

impl BomChangeDetector {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        history: Arc<dyn VersionHistory>,
        settings: DetectorSettings,
    ) -> Self {
        Self {
            source,
            history,
            permits: Arc::new(ExtractionPermits::new(settings.max_concurrent)),
            settings,
            last_hashes: Mutex::new(HashMap::new()),
        }
    }

    /// Extracts the current BOM of `path` and compares it with the last hash
    /// recorded for `key`. Never advances the recorded hash; call
    /// [`record_persisted`](Self::record_persisted) once the version is stored.
    pub fn detect(&self, key: &AssemblyKey, path: &str) -> Result<ChangeDecision> {
        if wait_for_stable_file(
            path,
            self.settings.stability_attempts,
            self.settings.stability_delay,
        ) == Stability::Unsettled
        {
            warn!(path, "File still changing on disk; extracting anyway");
        }

        let permit = ExtractionPermits::acquire(&self.permits);
        let raw =
            extract_with_timeout(&self.source, path, self.settings.extraction_timeout, permit)?;
        let (snapshot, skipped) = build_snapshot(path, &raw)?;
        for err in &skipped {
            warn!(path, error = %err, "Skipping invalid BOM item");
        }

        let key_text = key.to_string();
        let previous = self.previous_hash(&key_text)?;
        let decision = match previous {
            None => ChangeDecision::Baseline(snapshot),
            Some(previous) if previous == snapshot.content_hash => {
                debug!(assembly_key = %key_text, hash = %previous, "BOM unchanged");
                ChangeDecision::Unchanged {
                    content_hash: previous,
                }
            }
            Some(previous) => ChangeDecision::Changed {
                snapshot,
                previous_hash: previous,
            },
        };
        Ok(decision)
    }

    pub fn record_persisted(&self, key: &AssemblyKey, content_hash: &str) {
        self.lock_hashes()
            .insert(key.to_string(), content_hash.to_string());
    }

    pub fn known_hash(&self, key: &AssemblyKey) -> Option<String> {
        self.lock_hashes().get(&key.to_string()).cloned()
    }

    fn previous_hash(&self, key: &str) -> Result<Option<String>> {
        if let Some(hash) = self.lock_hashes().get(key) {
            return Ok(Some(hash.clone()));
        }
        let stored = self.history.latest_hash(key)?;
        if let Some(hash) = &stored {
            debug!(assembly_key = key, "Seeded last hash from version store");
            self.lock_hashes()
                .entry(key.to_string())
                .or_insert_with(|| hash.clone());
        }
        Ok(stored)
    }

    fn lock_hashes(&self) -> MutexGuard<'_, HashMap<String, String>> {
        match self.last_hashes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Validates `raw` into a snapshot. Rows that fail validation are dropped and
/// returned as [`MonitorError::Validation`] alongside it.
fn build_snapshot(path: &str, raw: &[RawBomItem]) -> Result<(BomSnapshot, Vec<MonitorError>)> {
    let (items, rejections) = validate_items(raw);
    if items.is_empty() && !rejections.is_empty() {
        return Err(MonitorError::extraction(
            path,
            format!("all {} BOM items were invalid", rejections.len()),
        ));
    }
    let content_hash = canonical_hash(&items);
    let skipped = rejections.into_iter().map(MonitorError::from).collect();
    Ok((
        BomSnapshot {
            items,
            content_hash,
        },
        skipped,
    ))
}

/// SHA-256 over the items in canonical order with fixed-precision numbers,
/// so neither enumeration order nor float formatting changes the hash. Items
/// are ordered by `(level, part_number, description, material)` and ties by
/// their full serialized line, so every field takes part in the order.
pub fn canonical_hash(items: &[BomItem]) -> String {
    let mut lines: Vec<(&BomItem, String)> = items
        .iter()
        .map(|item| (item, canonical_line(item)))
        .collect();
    lines.sort_by(|(a, a_line), (b, b_line)| {
        a.level
            .cmp(&b.level)
            .then_with(|| a.part_number.cmp(&b.part_number))
            .then_with(|| a.description.cmp(&b.description))
            .then_with(|| a.material.cmp(&b.material))
            .then_with(|| a_line.cmp(b_line))
    });

    let mut hasher = Sha256::new();
    for (_, line) in &lines {
        hasher.update(line.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn canonical_line(item: &BomItem) -> String {
    let mut line = String::new();
    let _ = write!(
        line,
        "{}\u{1f}{}\u{1f}{}\u{1f}{:.6}\u{1f}{}\u{1f}",
        item.level,
        item.part_number,
        item.description,
        item.quantity,
        item.material.as_deref().unwrap_or("")
    );
    if let Some(mass) = item.mass {
        let _ = write!(line, "{:.6}", mass);
    }
    line.push('\n');
    line
}

/// Samples `(len, modified)` until two consecutive samples agree.
pub fn wait_for_stable_file(path: &str, max_attempts: u32, delay: Duration) -> Stability {
    let Some(mut previous) = sample_metadata(path) else {
        return Stability::Missing;
    };
    for _ in 0..max_attempts.max(1) {
        thread::sleep(delay);
        let Some(current) = sample_metadata(path) else {
            return Stability::Missing;
        };
        if current == previous {
            return Stability::Stable;
        }
        previous = current;
    }
    Stability::Unsettled
}

fn sample_metadata(path: &str) -> Option<(u64, Option<SystemTime>)> {
    let metadata = fs_err::metadata(path).ok()?;
    Some((metadata.len(), metadata.modified().ok()))
}

/// Runs the extraction on a worker thread and gives up after `timeout`. The
/// worker is left to finish on its own and its result is discarded; it holds
/// `permit` until `extract_bom` returns, so abandoned extractions still count
/// against the concurrency limit.
pub fn extract_with_timeout(
    source: &Arc<dyn DocumentSource>,
    path: &str,
    timeout: Duration,
    permit: ExtractionPermit,
) -> Result<Vec<RawBomItem>> {
    let (tx, rx) = mpsc::channel();
    let worker_source = Arc::clone(source);
    let worker_path = path.to_string();
    thread::Builder::new()
        .name("bom-extract".to_string())
        .spawn(move || {
            let result = worker_source.extract_bom(&worker_path);
            drop(permit);
            let _ = tx.send(result);
        })
        .map_err(|err| MonitorError::extraction(path, format!("failed to spawn worker: {}", err)))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            warn!(path, timeout_secs = timeout.as_secs(), "BOM extraction timed out");
            Err(MonitorError::extraction(
                path,
                format!("extraction timed out after {:?}", timeout),
            ))
        }
        Err(RecvTimeoutError::Disconnected) => Err(MonitorError::extraction(
            path,
            "extraction worker exited without a result",
        )),
    }
}

/// Counting semaphore bounding concurrent extractions.
pub struct ExtractionPermits {
    available: Mutex<usize>,
    released: Condvar,
}

/// Slot in an [`ExtractionPermits`] pool, released on drop.
pub struct ExtractionPermit {
    permits: Arc<ExtractionPermits>,
}

impl ExtractionPermits {
    pub fn new(capacity: usize) -> Self {
        Self {
            available: Mutex::new(capacity.max(1)),
            released: Condvar::new(),
        }
    }

    /// Blocks until a slot is free.
    pub fn acquire(pool: &Arc<Self>) -> ExtractionPermit {
        let mut available = match pool.available.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while *available == 0 {
            available = match pool.released.wait(available) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        *available -= 1;
        ExtractionPermit {
            permits: Arc::clone(pool),
        }
    }

    pub fn available(&self) -> usize {
        match self.available.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl Drop for ExtractionPermit {
    fn drop(&mut self) {
        let mut available = match self.permits.available.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *available += 1;
        self.permits.released.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bomwatch_model::DocumentInfo;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSource {
        boms: Mutex<VecDeque<Result<Vec<RawBomItem>>>>,
        delay: Duration,
    }

    impl FakeSource {
        fn new(boms: Vec<Result<Vec<RawBomItem>>>) -> Self {
            Self {
                boms: Mutex::new(boms.into()),
                delay: Duration::ZERO,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                boms: Mutex::new(VecDeque::new()),
                delay,
            }
        }
    }

    impl DocumentSource for FakeSource {
        fn list_open_documents(&self) -> Result<Vec<DocumentInfo>> {
            Ok(Vec::new())
        }

        fn read_custom_property(&self, _path: &str, _name: &str) -> Result<Option<String>> {
            Ok(None)
        }

        fn extract_bom(&self, _path: &str) -> Result<Vec<RawBomItem>> {
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            self.boms
                .lock()
                .expect("boms lock")
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    #[derive(Default)]
    struct FakeHistory {
        hashes: HashMap<String, String>,
        lookups: AtomicUsize,
    }

    impl VersionHistory for FakeHistory {
        fn latest_hash(&self, assembly_key: &str) -> Result<Option<String>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.hashes.get(assembly_key).cloned())
        }
    }

    fn raw(part: &str, qty: f64) -> RawBomItem {
        RawBomItem {
            part_number: Some(part.to_string()),
            quantity: Some(qty),
            level: Some(1),
            ..RawBomItem::default()
        }
    }

    fn item(part: &str, qty: f64, level: u32) -> BomItem {
        BomItem {
            part_number: part.to_string(),
            description: String::new(),
            quantity: qty,
            level,
            material: None,
            mass: None,
        }
    }

    fn settings() -> DetectorSettings {
        DetectorSettings {
            stability_attempts: 1,
            stability_delay: Duration::from_millis(1),
            extraction_timeout: Duration::from_secs(5),
            max_concurrent: 2,
        }
    }

    fn key() -> AssemblyKey {
        AssemblyKey::new(Some("P-100".to_string()), None, "/virtual/Gearbox.iam")
    }

    #[test]
    fn hash_ignores_enumeration_order() {
        let a = vec![item("A", 1.0, 1), item("B", 2.0, 2), item("C", 3.0, 1)];
        let b = vec![item("C", 3.0, 1), item("A", 1.0, 1), item("B", 2.0, 2)];
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn hash_ignores_order_of_items_differing_only_in_mass() {
        let bolt = |mass: f64| BomItem {
            mass: Some(mass),
            ..item("BOLT-M8", 4.0, 1)
        };
        let forward = vec![bolt(1.0), bolt(2.0), item("BOLT-M8", 4.0, 1)];
        let reversed = vec![item("BOLT-M8", 4.0, 1), bolt(2.0), bolt(1.0)];
        assert_eq!(canonical_hash(&forward), canonical_hash(&reversed));
        assert_ne!(
            canonical_hash(&forward),
            canonical_hash(&[bolt(1.0), bolt(3.0), item("BOLT-M8", 4.0, 1)])
        );
    }

    #[test]
    fn hash_changes_with_quantity_and_level() {
        let base = canonical_hash(&[item("A", 1.0, 1)]);
        assert_ne!(base, canonical_hash(&[item("A", 2.0, 1)]));
        assert_ne!(base, canonical_hash(&[item("A", 1.0, 2)]));
        assert_eq!(base, canonical_hash(&[item("A", 1.000_000_01, 1)]));
    }

    #[test]
    fn first_snapshot_is_baseline_then_unchanged() {
        let source = Arc::new(FakeSource::new(vec![
            Ok(vec![raw("A", 1.0)]),
            Ok(vec![raw("A", 1.0)]),
        ]));
        let detector =
            BomChangeDetector::new(source, Arc::new(FakeHistory::default()), settings());
        let key = key();

        let first = detector.detect(&key, "/virtual/Gearbox.iam").expect("first");
        let ChangeDecision::Baseline(snapshot) = first else {
            panic!("expected baseline");
        };
        detector.record_persisted(&key, &snapshot.content_hash);

        let second = detector.detect(&key, "/virtual/Gearbox.iam").expect("second");
        assert!(matches!(second, ChangeDecision::Unchanged { .. }));
    }

    #[test]
    fn hash_is_not_advanced_until_recorded() {
        let source = Arc::new(FakeSource::new(vec![
            Ok(vec![raw("A", 1.0)]),
            Ok(vec![raw("A", 1.0)]),
        ]));
        let detector =
            BomChangeDetector::new(source, Arc::new(FakeHistory::default()), settings());
        let key = key();

        detector.detect(&key, "/virtual/Gearbox.iam").expect("first");
        let retry = detector.detect(&key, "/virtual/Gearbox.iam").expect("retry");
        assert!(matches!(retry, ChangeDecision::Baseline(_)));
        assert!(detector.known_hash(&key).is_none());
    }

    #[test]
    fn seeds_from_store_once() {
        let expected = canonical_hash(&[item("A", 1.0, 1)]);
        let history = Arc::new(FakeHistory {
            hashes: HashMap::from([(key().to_string(), expected.clone())]),
            lookups: AtomicUsize::new(0),
        });
        let source = Arc::new(FakeSource::new(vec![
            Ok(vec![raw("A", 1.0)]),
            Ok(vec![raw("A", 3.0)]),
        ]));
        let detector = BomChangeDetector::new(source, history.clone(), settings());
        let key = key();

        let first = detector.detect(&key, "/virtual/Gearbox.iam").expect("first");
        assert_eq!(
            first,
            ChangeDecision::Unchanged {
                content_hash: expected.clone()
            }
        );

        let second = detector.detect(&key, "/virtual/Gearbox.iam").expect("second");
        match second {
            ChangeDecision::Changed { previous_hash, .. } => assert_eq!(previous_hash, expected),
            other => panic!("expected change, got {other:?}"),
        }
        assert_eq!(history.lookups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalid_items_are_skipped() {
        let source = Arc::new(FakeSource::new(vec![Ok(vec![
            raw("A", 1.0),
            raw("BAD", -1.0),
        ])]));
        let detector =
            BomChangeDetector::new(source, Arc::new(FakeHistory::default()), settings());

        let decision = detector.detect(&key(), "/virtual/Gearbox.iam").expect("detect");
        let snapshot = decision.snapshot().expect("snapshot");
        assert_eq!(snapshot.items.len(), 1);
        assert_eq!(snapshot.items[0].part_number, "A");
    }

    #[test]
    fn skipped_items_are_reported_as_validation_errors() {
        let (snapshot, skipped) =
            build_snapshot("/w/a.iam", &[raw("A", 1.0), raw("BAD", -1.0)]).expect("snapshot");

        assert_eq!(snapshot.items.len(), 1);
        match skipped.as_slice() {
            [MonitorError::Validation(rejection)] => assert_eq!(rejection.index, 1),
            other => panic!("expected one validation error, got {other:?}"),
        }
    }

    #[test]
    fn all_invalid_items_fail_extraction() {
        let source = Arc::new(FakeSource::new(vec![Ok(vec![RawBomItem::default()])]));
        let detector =
            BomChangeDetector::new(source, Arc::new(FakeHistory::default()), settings());

        let err = detector
            .detect(&key(), "/virtual/Gearbox.iam")
            .expect_err("invalid");
        assert!(matches!(err, MonitorError::Extraction { .. }));
    }

    #[test]
    fn extraction_error_is_propagated() {
        let source = Arc::new(FakeSource::new(vec![Err(MonitorError::extraction(
            "/virtual/Gearbox.iam",
            "document locked",
        ))]));
        let detector =
            BomChangeDetector::new(source, Arc::new(FakeHistory::default()), settings());

        let err = detector
            .detect(&key(), "/virtual/Gearbox.iam")
            .expect_err("locked");
        assert!(err.to_string().contains("document locked"));
    }

    #[test]
    fn slow_extraction_times_out() {
        let source: Arc<dyn DocumentSource> =
            Arc::new(FakeSource::slow(Duration::from_millis(500)));

        let permits = Arc::new(ExtractionPermits::new(1));
        let permit = ExtractionPermits::acquire(&permits);
        let err = extract_with_timeout(&source, "/w/a.iam", Duration::from_millis(50), permit)
            .expect_err("timeout");
        assert!(err.to_string().contains("timed out"));
    }

    struct StalledSource {
        running: AtomicUsize,
        peak: AtomicUsize,
        stall: Duration,
    }

    impl DocumentSource for StalledSource {
        fn list_open_documents(&self) -> Result<Vec<DocumentInfo>> {
            Ok(Vec::new())
        }

        fn read_custom_property(&self, _path: &str, _name: &str) -> Result<Option<String>> {
            Ok(None)
        }

        fn extract_bom(&self, _path: &str) -> Result<Vec<RawBomItem>> {
            let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now_running, Ordering::SeqCst);
            thread::sleep(self.stall);
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![raw("A", 1.0)])
        }
    }

    #[test]
    fn timed_out_extractions_keep_their_slot() {
        let source = Arc::new(StalledSource {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            stall: Duration::from_millis(150),
        });
        let detector = Arc::new(BomChangeDetector::new(
            source.clone(),
            Arc::new(FakeHistory::default()),
            DetectorSettings {
                extraction_timeout: Duration::from_millis(20),
                max_concurrent: 1,
                ..settings()
            },
        ));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let detector = Arc::clone(&detector);
                thread::spawn(move || detector.detect(&key(), "/virtual/Gearbox.iam"))
            })
            .collect();
        for handle in handles {
            let err = handle.join().expect("join").expect_err("timeout");
            assert!(err.to_string().contains("timed out"));
        }

        assert_eq!(source.peak.load(Ordering::SeqCst), 1);
        thread::sleep(Duration::from_millis(300));
        assert_eq!(detector.permits.available(), 1);
    }

    #[test]
    fn missing_file_skips_stability_check() {
        assert_eq!(
            wait_for_stable_file("/definitely/not/here.iam", 3, Duration::from_millis(1)),
            Stability::Missing
        );
    }

    #[test]
    fn unchanged_file_is_stable() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("a.iam");
        fs_err::write(&path, b"assembly").expect("write");

        let stability =
            wait_for_stable_file(path.to_str().expect("utf8"), 3, Duration::from_millis(5));
        assert_eq!(stability, Stability::Stable);
    }

    #[test]
    fn permits_bound_concurrency() {
        let permits = Arc::new(ExtractionPermits::new(2));
        let first = ExtractionPermits::acquire(&permits);
        let _second = ExtractionPermits::acquire(&permits);
        assert_eq!(permits.available(), 0);
        drop(first);
        assert_eq!(permits.available(), 1);
    }
}
