//! Wires the watcher, resolver, session tracker, change detector and store
//! into one pipeline with an explicit start/shutdown lifecycle.

use bomwatch_model::{normalize_path, DocumentEvent, DocumentEventType, DocumentKind};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::detector::{BomChangeDetector, ChangeDecision, DetectorSettings};
use crate::directory::MachineDirectory;
use crate::dispatch::KeyedDispatcher;
use crate::error::{MonitorError, Result};
use crate::notify::{NotificationDebouncer, Notifier};
use crate::resolver::{ProjectIdentity, ProjectMachineResolver, ResolutionSignal};
use crate::sessions::WorkSessionTracker;
use crate::source::DocumentSource;
use crate::store::{Db, VersionMetadata};
use crate::watcher::{spawn_poll_loop, DocumentWatcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// False when in-flight handlers were still running at the drain deadline.
    pub drained: bool,
    pub ended_sessions: usize,
}

pub struct Monitor {
    config: MonitorConfig,
    watcher: Arc<DocumentWatcher>,
    pipeline: Arc<Pipeline>,
    dispatcher: KeyedDispatcher,
    stop: Arc<AtomicBool>,
    poll_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Event handlers and the state they share. Lives behind an `Arc` so queued
/// jobs can outlive the borrow of the monitor that submitted them.
struct Pipeline {
    resolver: ProjectMachineResolver,
    sessions: WorkSessionTracker,
    detector: BomChangeDetector,
    store: Arc<Db>,
    notifier: Arc<dyn Notifier>,
    debouncer: NotificationDebouncer,
    bindings: Mutex<HashMap<String, ProjectIdentity>>,
    engineer: String,
    directory_failures: AtomicU32,
    warning_after: u32,
}

impl Monitor {
    pub fn new(
        config: MonitorConfig,
        source: Arc<dyn DocumentSource>,
        directory: Arc<dyn MachineDirectory>,
        notifier: Arc<dyn Notifier>,
        store: Arc<Db>,
    ) -> Result<Self> {
        config.validate()?;
        let resolver = ProjectMachineResolver::new(
            config.compiled_project_patterns()?,
            config.identity.unknown_project,
            Arc::clone(&source),
            directory,
        );
        let detector = BomChangeDetector::new(
            Arc::clone(&source),
            store.clone(),
            DetectorSettings::from(&config),
        );
        let pipeline = Pipeline {
            resolver,
            sessions: WorkSessionTracker::new(store.clone()),
            detector,
            store,
            notifier: Arc::clone(&notifier),
            debouncer: NotificationDebouncer::new(config.debounce()),
            bindings: Mutex::new(HashMap::new()),
            engineer: config.engineer_name(),
            directory_failures: AtomicU32::new(0),
            warning_after: config.polling.source_warning_after.max(1),
        };
        let watcher = DocumentWatcher::new(source, notifier, config.polling.source_warning_after);

        Ok(Self {
            config,
            watcher: Arc::new(watcher),
            pipeline: Arc::new(pipeline),
            dispatcher: KeyedDispatcher::new(),
            stop: Arc::new(AtomicBool::new(false)),
            poll_thread: Mutex::new(None),
        })
    }

    /// Starts the polling thread. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut poll_thread = lock(&self.poll_thread);
        if poll_thread.is_some() {
            debug!("Monitor already started");
            return;
        }
        self.stop.store(false, Ordering::Release);
        self.pipeline.sessions.resume();

        let dispatcher = self.dispatcher.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let handle = spawn_poll_loop(
            Arc::clone(&self.watcher),
            self.config.polling.initial_delay(),
            self.config.polling.interval(),
            Arc::clone(&self.stop),
            move |event| dispatch_event(&dispatcher, &pipeline, event),
        );
        *poll_thread = Some(handle);
        info!(engineer = %self.pipeline.engineer, "Monitor started");
    }

    /// Stops polling, drains queued handlers within the configured bound and
    /// ends every active session at shutdown time. Handlers still running past
    /// the drain bound cannot start new sessions afterwards.
    pub fn shutdown(&self) -> ShutdownReport {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = lock(&self.poll_thread).take() {
            if handle.join().is_err() {
                error!("Poll thread panicked");
            }
        }

        let drained = self.dispatcher.wait_idle(self.config.shutdown_drain());
        if !drained {
            warn!(
                in_flight = self.dispatcher.in_flight(),
                "Shutdown drain timed out; ending sessions anyway"
            );
        }

        let ended = self.pipeline.sessions.end_all(Utc::now());
        lock(&self.pipeline.bindings).clear();
        info!(ended_sessions = ended.len(), drained, "Monitor stopped");
        ShutdownReport {
            drained,
            ended_sessions: ended.len(),
        }
    }

    /// Runs one poll cycle on the calling thread and queues its events.
    /// Returns the number of events emitted.
    pub fn poll_now(&self) -> usize {
        let events = self.watcher.poll_once().unwrap_or_default();
        let count = events.len();
        for event in events {
            dispatch_event(&self.dispatcher, &self.pipeline, event);
        }
        count
    }

    /// Blocks until every queued handler has run or `timeout` elapses.
    pub fn wait_idle(&self, timeout: std::time::Duration) -> bool {
        self.dispatcher.wait_idle(timeout)
    }

    /// Handles one event synchronously on the calling thread.
    pub fn handle_event(&self, event: &DocumentEvent) {
        self.pipeline.handle_event(event);
    }

    pub fn active_session_count(&self) -> usize {
        self.pipeline.sessions.active_count()
    }

    pub fn active_session(&self, path: &str) -> Option<bomwatch_model::WorkSession> {
        self.pipeline.sessions.active_session(path)
    }

    pub fn store(&self) -> &Arc<Db> {
        &self.pipeline.store
    }

    pub fn handler_panics(&self) -> u64 {
        self.dispatcher.panic_count()
    }
}

fn dispatch_event(dispatcher: &KeyedDispatcher, pipeline: &Arc<Pipeline>, event: DocumentEvent) {
    let key = normalize_path(&event.path);
    let pipeline = Arc::clone(pipeline);
    dispatcher.submit(&key, move || pipeline.handle_event(&event));
}

impl Pipeline {
    fn handle_event(&self, event: &DocumentEvent) {
        debug!(
            event = ?event.event_type,
            path = %event.path,
            kind = event.kind.as_str(),
            "Handling document event"
        );
        match event.event_type {
            DocumentEventType::Opened => self.on_opened(event),
            DocumentEventType::Saved => self.on_saved(event),
            DocumentEventType::Closed => self.on_closed(event),
        }
    }

    fn on_opened(&self, event: &DocumentEvent) {
        let identity = self.resolve_and_bind(&event.path);

        self.sessions.open(
            &event.path,
            identity.project_id.clone(),
            identity.machine_id,
            &self.engineer,
            event.observed_at,
        );

        if let Some(label) = identity.machine_label() {
            if self
                .debouncer
                .should_send(&normalize_path(&event.path), event.observed_at)
            {
                self.notifier
                    .info("Machine opened", &format!("{} opened", label));
            } else {
                debug!(path = %event.path, "Machine opened notification debounced");
            }
        }
    }

    fn on_saved(&self, event: &DocumentEvent) {
        self.sessions.save(&event.path, event.observed_at);

        if event.kind != DocumentKind::Assembly {
            return;
        }
        let identity = match self.binding(&event.path) {
            Some(identity) => identity,
            None => self.resolve_and_bind(&event.path),
        };
        if identity.ignored {
            debug!(path = %event.path, "Versioning skipped for unresolved project");
            return;
        }

        let key = identity.assembly_key(&event.path);
        let decision = match self.detector.detect(&key, &event.path) {
            Ok(decision) => decision,
            Err(err) => {
                warn!(
                    path = %event.path,
                    error = %err,
                    "BOM change detection failed; will retry on next save"
                );
                return;
            }
        };

        let snapshot = match &decision {
            ChangeDecision::Unchanged { .. } => {
                info!(assembly_key = %key, "BOM unchanged; no new version");
                return;
            }
            ChangeDecision::Baseline(snapshot) => {
                info!(assembly_key = %key, items = snapshot.items.len(), "Recording baseline BOM");
                snapshot
            }
            ChangeDecision::Changed { snapshot, .. } => snapshot,
        };

        let metadata = VersionMetadata {
            extracted_by: self.engineer.clone(),
            extracted_at: event.observed_at,
            project_id: identity.project_id.clone(),
        };
        match self.store.create_version(&key, snapshot, &metadata) {
            Ok(version) => {
                self.detector
                    .record_persisted(&key, &version.content_hash);
            }
            Err(err @ MonitorError::VersionConflict { .. }) => {
                error!(assembly_key = %key, error = %err, "BOM version was not saved");
                self.notifier.error(
                    "BOM version not saved",
                    &format!("{} could not be versioned: {}", event.path, err),
                );
            }
            Err(err) => {
                error!(assembly_key = %key, error = %err, "Failed to persist BOM version");
            }
        }
    }

    fn on_closed(&self, event: &DocumentEvent) {
        self.sessions.close(&event.path, event.observed_at);
        lock(&self.bindings).remove(&normalize_path(&event.path));
    }

    fn resolve_and_bind(&self, path: &str) -> ProjectIdentity {
        let resolution = self.resolver.resolve(path);
        let mut directory_failed = false;
        for signal in &resolution.signals {
            match signal {
                ResolutionSignal::OpMismatch {
                    machine_id,
                    declared,
                    recorded,
                } => {
                    warn!(path, machine_id, declared = %declared, recorded = %recorded, "Operation mismatch");
                    self.notifier.warning(
                        "Operation mismatch",
                        &format!(
                            "{} declares operation {} but machine {} is registered for {}",
                            path, declared, machine_id, recorded
                        ),
                    );
                }
                ResolutionSignal::DirectoryUnavailable { error, .. } => {
                    directory_failed = true;
                    self.record_directory_failure(error);
                }
                _ => {}
            }
        }
        if !directory_failed && resolution.identity.machine_id.is_some() {
            self.directory_failures.store(0, Ordering::Release);
        }
        lock(&self.bindings).insert(normalize_path(path), resolution.identity.clone());
        resolution.identity
    }

    fn record_directory_failure(&self, error: &str) {
        let failures = self.directory_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures % self.warning_after == 0 {
            self.notifier.warning(
                "Machine directory unavailable",
                &format!(
                    "{} consecutive machine lookups failed: {}",
                    failures, error
                ),
            );
        }
    }

    fn binding(&self, path: &str) -> Option<ProjectIdentity> {
        lock(&self.bindings).get(&normalize_path(path)).cloned()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
