//! Event-loop wiring: one thread owns every mutable detector structure, and
//! every input (output chunks, execution ends, diagnostics events, edits,
//! commands, timer firings) arrives as an [`EngineEvent`] over one channel.
//!
//! Routing all mutation through this single thread is what makes the gate's
//! check-and-set atomic in practice; nothing else in the crate touches the
//! detectors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::debug;

use crate::audio::{resolve_sound_path, AlertSink};
use crate::diagnostics::{Diagnostic, DiagnosticsWatcher, ScanDecision};
use crate::execution::{ExecutionId, ExecutionTracker};
use crate::gate::AlertGate;
use crate::settings::{DiagnosticsSeverityMode, RuntimeSettings, StoredSettings};

/// Floor for scheduled retry delays, so a nearly-expired cooldown still
/// yields a real timer rather than a busy loop.
const MIN_RETRY_DELAY_MS: u64 = 50;
/// A burst of edits collapses to one scan this long after the last edit.
const EDIT_DEBOUNCE_MS: u64 = 300;
const ENGINE_JOIN_POLL_MS: u64 = 5;
const ENGINE_JOIN_TIMEOUT_MS: u64 = 1_000;

/// Editor-side source of truth for a document's current diagnostics.
pub trait DiagnosticsProvider: Send {
    fn diagnostics_for(&self, uri: &str) -> Vec<Diagnostic>;
}

/// Outward behavioral contracts for UI wiring.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    /// Dispatch unconditionally, bypassing the gate.
    PlayTestSound,
    Snooze { duration_ms: i64 },
    ClearSnooze,
    SetQuietHours { enabled: bool, start: String, end: String },
    SetEnabled(bool),
    SetMonitorTerminal(bool),
    SetMonitorDiagnostics(bool),
    SetDiagnosticsSeverity(DiagnosticsSeverityMode),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    ExecutionChunk { id: ExecutionId, chunk: String },
    ExecutionEnded { id: ExecutionId, exit_code: Option<i32> },
    EditorActivated { uri: Option<String> },
    DiagnosticsChanged { uris: Vec<String> },
    DocumentEdited { uri: String },
    SettingsUpdated(StoredSettings),
    Command(EngineCommand),
    RetryDue { uri: String, generation: u64 },
    EditDebounceDue { generation: u64 },
    Shutdown,
}

pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

fn spawn_timer(events: Sender<EngineEvent>, delay_ms: u64, event: EngineEvent) {
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(delay_ms));
        // A send after shutdown simply fails; stale firings are also
        // filtered by generation on arrival.
        let _ = events.send(event);
    });
}

/// The detection-and-gating engine. All state is owned here and mutated only
/// by [`Engine::run`]'s thread (or a test driving `handle_event` directly).
pub struct Engine {
    events_tx: Sender<EngineEvent>,
    events_rx: Receiver<EngineEvent>,
    stored: StoredSettings,
    settings: RuntimeSettings,
    gate: AlertGate,
    watcher: DiagnosticsWatcher,
    tracker: ExecutionTracker,
    provider: Box<dyn DiagnosticsProvider>,
    sink: Box<dyn AlertSink>,
    active_uri: Option<String>,
    /// Pending diagnostics retries: URI to the generation that may fire.
    retries: HashMap<String, u64>,
    retry_seq: u64,
    /// Only the newest edit-debounce generation is honored.
    debounce_generation: u64,
}

impl Engine {
    #[must_use = "an engine does nothing until run() or handle_event() drives it"]
    pub fn new(
        stored: StoredSettings,
        provider: Box<dyn DiagnosticsProvider>,
        sink: Box<dyn AlertSink>,
    ) -> Self {
        let (events_tx, events_rx) = unbounded();
        let settings = stored.compile();
        Self {
            events_tx,
            events_rx,
            stored,
            settings,
            gate: AlertGate::new(),
            watcher: DiagnosticsWatcher::new(),
            tracker: ExecutionTracker::new(),
            provider,
            sink,
            active_uri: None,
            retries: HashMap::new(),
            retry_seq: 0,
            debounce_generation: 0,
        }
    }

    /// Sender used to feed this engine events from any thread.
    #[must_use = "the sender is the only way into the engine"]
    pub fn events(&self) -> Sender<EngineEvent> {
        self.events_tx.clone()
    }

    /// Drain events until shutdown or until every sender is gone.
    pub fn run(mut self) {
        while let Ok(event) = self.events_rx.recv() {
            if !self.handle_event(event, epoch_ms()) {
                break;
            }
        }
    }

    /// Process one event at the given clock reading. Returns false once the
    /// engine has shut down.
    pub(crate) fn handle_event(&mut self, event: EngineEvent, now_ms: u64) -> bool {
        match event {
            EngineEvent::ExecutionChunk { id, chunk } => {
                self.on_execution_chunk(id, &chunk, now_ms);
            }
            EngineEvent::ExecutionEnded { id, exit_code } => {
                self.on_execution_ended(id, exit_code, now_ms);
            }
            EngineEvent::EditorActivated { uri } => {
                self.on_editor_activated(uri, now_ms);
            }
            EngineEvent::DiagnosticsChanged { uris } => {
                let is_active = self
                    .active_uri
                    .as_ref()
                    .is_some_and(|active| uris.iter().any(|uri| uri == active));
                if is_active {
                    self.scan_active_document(now_ms);
                }
            }
            EngineEvent::DocumentEdited { uri } => {
                if self.active_uri.as_deref() == Some(uri.as_str()) {
                    self.debounce_generation += 1;
                    spawn_timer(
                        self.events_tx.clone(),
                        EDIT_DEBOUNCE_MS,
                        EngineEvent::EditDebounceDue { generation: self.debounce_generation },
                    );
                }
            }
            EngineEvent::SettingsUpdated(stored) => {
                self.settings = stored.compile();
                self.stored = stored;
            }
            EngineEvent::Command(command) => {
                self.on_command(command, now_ms);
            }
            EngineEvent::RetryDue { uri, generation } => {
                if self.retries.get(&uri) == Some(&generation) {
                    self.retries.remove(&uri);
                    // Re-run the full scan: the diagnostics set may have
                    // changed while the retry was pending.
                    self.scan_active_document(now_ms);
                }
            }
            EngineEvent::EditDebounceDue { generation } => {
                if generation == self.debounce_generation {
                    self.scan_active_document(now_ms);
                }
            }
            EngineEvent::Shutdown => {
                self.teardown();
                return false;
            }
        }
        true
    }

    fn on_execution_chunk(&mut self, id: ExecutionId, chunk: &str, now_ms: u64) {
        if !self.settings.enabled || !self.settings.monitor_terminal {
            return;
        }
        if self.tracker.chunk_has_error(id, chunk, &self.settings)
            && self.tracker.try_alert(id, &self.settings, &self.gate, now_ms)
        {
            self.dispatch_alert("terminal");
        }
    }

    fn on_execution_ended(&mut self, id: ExecutionId, exit_code: Option<i32>, now_ms: u64) {
        // A command that failed without printing a matching line still
        // alerts; the shared played flag keeps this from double-firing.
        let failed = matches!(exit_code, Some(code) if code != 0);
        if self.settings.enabled
            && failed
            && self.tracker.try_alert(id, &self.settings, &self.gate, now_ms)
        {
            self.dispatch_alert("terminal");
        }
        self.tracker.finish(id);
    }

    fn on_editor_activated(&mut self, uri: Option<String>, now_ms: u64) {
        self.debounce_generation += 1;
        match &uri {
            Some(active) => self.retries.retain(|pending, _| pending == active),
            None => self.retries.clear(),
        }
        self.active_uri = uri;
        self.scan_active_document(now_ms);
    }

    fn on_command(&mut self, command: EngineCommand, now_ms: u64) {
        match command {
            EngineCommand::PlayTestSound => self.dispatch_alert("test"),
            EngineCommand::Snooze { duration_ms } => {
                let deadline_ms = self.gate.snooze_for_ms(duration_ms, now_ms);
                debug!(deadline_ms, "alerts snoozed");
            }
            EngineCommand::ClearSnooze => self.gate.clear_snooze(),
            EngineCommand::SetQuietHours { enabled, start, end } => {
                self.stored.quiet_hours_enabled = enabled;
                if crate::settings::is_valid_quiet_hours_time(&start) {
                    self.stored.quiet_hours_start = start;
                }
                if crate::settings::is_valid_quiet_hours_time(&end) {
                    self.stored.quiet_hours_end = end;
                }
                self.recompile_settings();
            }
            EngineCommand::SetEnabled(enabled) => {
                self.stored.enabled = enabled;
                self.recompile_settings();
            }
            EngineCommand::SetMonitorTerminal(enabled) => {
                self.stored.monitor_terminal = enabled;
                self.recompile_settings();
            }
            EngineCommand::SetMonitorDiagnostics(enabled) => {
                self.stored.monitor_diagnostics = enabled;
                self.recompile_settings();
            }
            EngineCommand::SetDiagnosticsSeverity(mode) => {
                self.stored.diagnostics_severity = mode;
                self.recompile_settings();
            }
        }
    }

    fn recompile_settings(&mut self) {
        self.settings = self.stored.compile();
    }

    fn scan_active_document(&mut self, now_ms: u64) {
        let Some(uri) = self.active_uri.clone() else {
            return;
        };
        let diagnostics = self.provider.diagnostics_for(&uri);
        match self
            .watcher
            .scan(&uri, &diagnostics, &self.settings, &self.gate, now_ms)
        {
            ScanDecision::Skip => {}
            ScanDecision::Cleared | ScanDecision::Unchanged => self.cancel_retry(&uri),
            ScanDecision::Alert => {
                self.cancel_retry(&uri);
                self.dispatch_alert("diagnostics");
            }
            ScanDecision::Retry { delay_ms } => self.schedule_retry(&uri, delay_ms),
        }
    }

    /// Idempotent per URI: a schedule request while one is pending is a no-op.
    fn schedule_retry(&mut self, uri: &str, delay_ms: u64) {
        if self.retries.contains_key(uri) {
            return;
        }
        self.retry_seq += 1;
        let generation = self.retry_seq;
        self.retries.insert(uri.to_string(), generation);
        spawn_timer(
            self.events_tx.clone(),
            delay_ms.max(MIN_RETRY_DELAY_MS),
            EngineEvent::RetryDue { uri: uri.to_string(), generation },
        );
    }

    fn cancel_retry(&mut self, uri: &str) {
        self.retries.remove(uri);
    }

    fn dispatch_alert(&self, scope: &str) {
        let sound_path = resolve_sound_path(&self.settings.custom_sound_path);
        debug!(scope, path = %sound_path.display(), "dispatching alert");
        self.sink.play(&self.settings, &sound_path);
    }

    fn teardown(&mut self) {
        self.retries.clear();
        self.debounce_generation += 1;
        self.watcher.clear();
        self.tracker.clear();
    }
}

/// Running engine plus the only ways to talk to it.
pub struct EngineHandle {
    events: Sender<EngineEvent>,
    next_execution_id: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

/// Start the engine on its own thread.
#[must_use = "dropping the handle shuts the engine down"]
pub fn spawn_engine(
    stored: StoredSettings,
    provider: Box<dyn DiagnosticsProvider>,
    sink: Box<dyn AlertSink>,
) -> EngineHandle {
    let engine = Engine::new(stored, provider, sink);
    let events = engine.events();
    let thread = thread::spawn(move || engine.run());
    EngineHandle {
        events,
        next_execution_id: Arc::new(AtomicU64::new(1)),
        thread: Some(thread),
    }
}

impl EngineHandle {
    /// Sender for feeding events from readers, editor glue, or UI wiring.
    pub fn events(&self) -> Sender<EngineEvent> {
        self.events.clone()
    }

    /// Allocate a handle for a new shell command run.
    pub fn begin_execution(&self) -> ExecutionId {
        ExecutionId::from_raw(self.next_execution_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Fire-and-forget event delivery; a closed engine ignores the event.
    pub fn send(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Stop the engine and wait briefly for its thread to exit.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.events.send(EngineEvent::Shutdown);
        let deadline = Instant::now() + Duration::from_millis(ENGINE_JOIN_TIMEOUT_MS);
        while !thread.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(ENGINE_JOIN_POLL_MS));
        }
        if thread.is_finished() {
            if let Err(err) = thread.join() {
                debug!("engine thread panicked during shutdown: {err:?}");
            }
        } else {
            debug!("engine thread did not exit in time; detaching");
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

#[cfg(test)]
mod tests;
