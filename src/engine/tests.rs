use super::*;
use crate::diagnostics::Severity;
use crate::settings::PatternMode;
use std::path::Path;
use std::sync::Mutex;

const T0: u64 = 1_700_000_000_000;
const URI: &str = "file:///active.rs";
const OTHER_URI: &str = "file:///other.rs";

#[derive(Clone, Default)]
struct RecordingSink {
    plays: Arc<Mutex<Vec<String>>>,
}

impl RecordingSink {
    fn play_count(&self) -> usize {
        self.plays.lock().expect("sink lock").len()
    }
}

impl AlertSink for RecordingSink {
    fn play(&self, _settings: &RuntimeSettings, sound_path: &Path) {
        self.plays
            .lock()
            .expect("sink lock")
            .push(sound_path.display().to_string());
    }
}

#[derive(Clone, Default)]
struct MapProvider {
    by_uri: Arc<Mutex<HashMap<String, Vec<Diagnostic>>>>,
}

impl MapProvider {
    fn set(&self, uri: &str, diagnostics: Vec<Diagnostic>) {
        self.by_uri
            .lock()
            .expect("provider lock")
            .insert(uri.to_string(), diagnostics);
    }
}

impl DiagnosticsProvider for MapProvider {
    fn diagnostics_for(&self, uri: &str) -> Vec<Diagnostic> {
        self.by_uri
            .lock()
            .expect("provider lock")
            .get(uri)
            .cloned()
            .unwrap_or_default()
    }
}

fn test_engine(stored: StoredSettings) -> (Engine, RecordingSink, MapProvider) {
    let sink = RecordingSink::default();
    let provider = MapProvider::default();
    let engine = Engine::new(stored, Box::new(provider.clone()), Box::new(sink.clone()));
    (engine, sink, provider)
}

fn error_diag(message: &str) -> Diagnostic {
    Diagnostic::new(Severity::Error, message)
}

fn chunk(id: ExecutionId, text: &str) -> EngineEvent {
    EngineEvent::ExecutionChunk { id, chunk: text.to_string() }
}

#[test]
fn qualifying_chunk_plays_exactly_once_per_execution() {
    let (mut engine, sink, _) = test_engine(StoredSettings::default());
    let exec = ExecutionId::from_raw(1);

    engine.handle_event(chunk(exec, "error: build failed\n"), T0);
    assert_eq!(sink.play_count(), 1);

    // More qualifying lines from the same run, long after the cooldown.
    engine.handle_event(chunk(exec, "fatal: still broken\n"), T0 + 60_000);
    assert_eq!(sink.play_count(), 1);
}

#[test]
fn nonzero_exit_code_is_a_fallback_trigger() {
    let (mut engine, sink, _) = test_engine(StoredSettings::default());
    let exec = ExecutionId::from_raw(1);

    engine.handle_event(chunk(exec, "nothing suspicious here\n"), T0);
    assert_eq!(sink.play_count(), 0);
    engine.handle_event(EngineEvent::ExecutionEnded { id: exec, exit_code: Some(2) }, T0 + 10);
    assert_eq!(sink.play_count(), 1);
}

#[test]
fn clean_or_unknown_exit_codes_stay_silent() {
    let (mut engine, sink, _) = test_engine(StoredSettings::default());
    engine.handle_event(
        EngineEvent::ExecutionEnded { id: ExecutionId::from_raw(1), exit_code: Some(0) },
        T0,
    );
    engine.handle_event(
        EngineEvent::ExecutionEnded { id: ExecutionId::from_raw(2), exit_code: None },
        T0 + 10,
    );
    assert_eq!(sink.play_count(), 0);
}

#[test]
fn exit_code_fallback_never_double_plays_an_execution() {
    let (mut engine, sink, _) = test_engine(StoredSettings::default());
    let exec = ExecutionId::from_raw(1);

    engine.handle_event(chunk(exec, "error: build failed\n"), T0);
    engine.handle_event(EngineEvent::ExecutionEnded { id: exec, exit_code: Some(1) }, T0 + 50);
    assert_eq!(sink.play_count(), 1);
}

#[test]
fn cross_scope_shared_window_defers_then_retries_diagnostics() {
    let (mut engine, sink, provider) = test_engine(StoredSettings::default());

    engine.handle_event(chunk(ExecutionId::from_raw(1), "error: broken\n"), T0);
    assert_eq!(sink.play_count(), 1);

    provider.set(URI, vec![error_diag("mismatched types")]);
    engine.handle_event(EngineEvent::EditorActivated { uri: Some(URI.to_string()) }, T0 + 200);
    // Inside the shared window: suppressed, but a retry is now pending.
    assert_eq!(sink.play_count(), 1);
    assert_eq!(engine.retries.len(), 1);

    let generation = *engine.retries.get(URI).expect("pending retry");
    engine.handle_event(
        EngineEvent::RetryDue { uri: URI.to_string(), generation },
        T0 + 280,
    );
    assert_eq!(sink.play_count(), 2);
    assert!(engine.retries.is_empty());
}

#[test]
fn retry_scheduling_is_idempotent_per_uri() {
    let (mut engine, sink, provider) = test_engine(StoredSettings::default());

    engine.handle_event(chunk(ExecutionId::from_raw(1), "error: broken\n"), T0);
    provider.set(URI, vec![error_diag("mismatched types")]);
    engine.handle_event(EngineEvent::EditorActivated { uri: Some(URI.to_string()) }, T0 + 100);
    let generation = *engine.retries.get(URI).expect("pending retry");

    engine.handle_event(
        EngineEvent::DiagnosticsChanged { uris: vec![URI.to_string()] },
        T0 + 120,
    );
    assert_eq!(engine.retries.len(), 1);
    assert_eq!(engine.retries.get(URI), Some(&generation));
    assert_eq!(sink.play_count(), 1);
}

#[test]
fn stale_retry_generations_are_ignored() {
    let (mut engine, sink, provider) = test_engine(StoredSettings::default());

    engine.handle_event(chunk(ExecutionId::from_raw(1), "error: broken\n"), T0);
    provider.set(URI, vec![error_diag("mismatched types")]);
    engine.handle_event(EngineEvent::EditorActivated { uri: Some(URI.to_string()) }, T0 + 100);
    let generation = *engine.retries.get(URI).expect("pending retry");

    // Switching away cancels the pending retry for the old document.
    engine.handle_event(
        EngineEvent::EditorActivated { uri: Some(OTHER_URI.to_string()) },
        T0 + 150,
    );
    assert!(engine.retries.is_empty());

    engine.handle_event(
        EngineEvent::RetryDue { uri: URI.to_string(), generation },
        T0 + 300,
    );
    assert_eq!(sink.play_count(), 1);
}

#[test]
fn diagnostics_events_for_other_documents_are_ignored() {
    let (mut engine, sink, provider) = test_engine(StoredSettings::default());
    provider.set(URI, vec![error_diag("mismatched types")]);
    provider.set(OTHER_URI, vec![error_diag("other problem")]);

    engine.handle_event(EngineEvent::EditorActivated { uri: Some(URI.to_string()) }, T0);
    assert_eq!(sink.play_count(), 1);

    engine.handle_event(
        EngineEvent::DiagnosticsChanged { uris: vec![OTHER_URI.to_string()] },
        T0 + 5_000,
    );
    assert_eq!(sink.play_count(), 1);
}

#[test]
fn unchanged_diagnostics_cancel_the_pending_retry() {
    let (mut engine, sink, provider) = test_engine(StoredSettings::default());

    engine.handle_event(chunk(ExecutionId::from_raw(1), "error: broken\n"), T0);
    provider.set(URI, vec![error_diag("mismatched types")]);
    engine.handle_event(EngineEvent::EditorActivated { uri: Some(URI.to_string()) }, T0 + 100);
    assert_eq!(engine.retries.len(), 1);

    // The failure alerts once the window opens, and the retry entry goes away.
    engine.handle_event(
        EngineEvent::DiagnosticsChanged { uris: vec![URI.to_string()] },
        T0 + 2_000,
    );
    assert_eq!(sink.play_count(), 2);
    assert!(engine.retries.is_empty());

    // Re-reported identical diagnostics keep it clear without re-alerting.
    engine.handle_event(
        EngineEvent::DiagnosticsChanged { uris: vec![URI.to_string()] },
        T0 + 4_000,
    );
    assert_eq!(sink.play_count(), 2);
    assert!(engine.retries.is_empty());
}

#[test]
fn snooze_blocks_alerts_until_cleared() {
    let (mut engine, sink, _) = test_engine(StoredSettings::default());
    let exec = ExecutionId::from_raw(1);

    engine.handle_event(
        EngineEvent::Command(EngineCommand::Snooze { duration_ms: 60_000 }),
        T0,
    );
    engine.handle_event(chunk(exec, "error: broken\n"), T0 + 100);
    assert_eq!(sink.play_count(), 0);

    engine.handle_event(EngineEvent::Command(EngineCommand::ClearSnooze), T0 + 200);
    // The suppressed attempt never set the played flag, so the same
    // execution may still alert.
    engine.handle_event(chunk(exec, "error: still broken\n"), T0 + 300);
    assert_eq!(sink.play_count(), 1);
}

#[test]
fn snooze_expiry_restores_alerts_without_a_command() {
    let (mut engine, sink, _) = test_engine(StoredSettings::default());
    engine.handle_event(
        EngineEvent::Command(EngineCommand::Snooze { duration_ms: 1_000 }),
        T0,
    );
    engine.handle_event(chunk(ExecutionId::from_raw(1), "error: broken\n"), T0 + 999);
    assert_eq!(sink.play_count(), 0);
    engine.handle_event(chunk(ExecutionId::from_raw(1), "error: broken\n"), T0 + 1_000);
    assert_eq!(sink.play_count(), 1);
}

#[test]
fn quiet_hours_suppress_and_release_alerts() {
    let (mut engine, sink, _) = test_engine(StoredSettings::default());
    let exec = ExecutionId::from_raw(1);

    // start == end covers the whole day, so this holds at any wall clock.
    engine.handle_event(
        EngineEvent::Command(EngineCommand::SetQuietHours {
            enabled: true,
            start: "00:00".to_string(),
            end: "00:00".to_string(),
        }),
        T0,
    );
    engine.handle_event(chunk(exec, "error: broken\n"), T0 + 100);
    assert_eq!(sink.play_count(), 0);

    engine.handle_event(
        EngineEvent::Command(EngineCommand::SetQuietHours {
            enabled: false,
            start: "00:00".to_string(),
            end: "00:00".to_string(),
        }),
        T0 + 200,
    );
    engine.handle_event(chunk(exec, "error: still broken\n"), T0 + 300);
    assert_eq!(sink.play_count(), 1);
}

#[test]
fn invalid_quiet_hours_times_keep_previous_values() {
    let (mut engine, _, _) = test_engine(StoredSettings::default());
    engine.handle_event(
        EngineEvent::Command(EngineCommand::SetQuietHours {
            enabled: true,
            start: "25:00".to_string(),
            end: "late".to_string(),
        }),
        T0,
    );
    assert_eq!(engine.stored.quiet_hours_start, "22:00");
    assert_eq!(engine.stored.quiet_hours_end, "07:00");
    assert!(engine.stored.quiet_hours_enabled);
}

#[test]
fn test_sound_bypasses_the_gate_entirely() {
    let (mut engine, sink, _) = test_engine(StoredSettings::default());
    engine.handle_event(EngineEvent::Command(EngineCommand::PlayTestSound), T0);
    engine.handle_event(EngineEvent::Command(EngineCommand::PlayTestSound), T0);
    assert_eq!(sink.play_count(), 2);
}

#[test]
fn edit_debounce_honors_only_the_latest_generation() {
    let (mut engine, sink, provider) = test_engine(StoredSettings::default());
    engine.handle_event(EngineEvent::EditorActivated { uri: Some(URI.to_string()) }, T0);
    assert_eq!(sink.play_count(), 0);

    provider.set(URI, vec![error_diag("mismatched types")]);
    engine.handle_event(EngineEvent::DocumentEdited { uri: URI.to_string() }, T0 + 100);
    let stale = engine.debounce_generation;
    engine.handle_event(EngineEvent::DocumentEdited { uri: URI.to_string() }, T0 + 150);
    let current = engine.debounce_generation;
    assert_ne!(stale, current);

    engine.handle_event(EngineEvent::EditDebounceDue { generation: stale }, T0 + 400);
    assert_eq!(sink.play_count(), 0);
    engine.handle_event(EngineEvent::EditDebounceDue { generation: current }, T0 + 450);
    assert_eq!(sink.play_count(), 1);
}

#[test]
fn edits_in_non_active_documents_are_ignored() {
    let (mut engine, _, _) = test_engine(StoredSettings::default());
    engine.handle_event(EngineEvent::EditorActivated { uri: Some(URI.to_string()) }, T0);
    let generation = engine.debounce_generation;
    engine.handle_event(
        EngineEvent::DocumentEdited { uri: OTHER_URI.to_string() },
        T0 + 100,
    );
    assert_eq!(engine.debounce_generation, generation);
}

#[test]
fn disabling_the_engine_silences_both_sources() {
    let (mut engine, sink, provider) = test_engine(StoredSettings::default());
    engine.handle_event(EngineEvent::Command(EngineCommand::SetEnabled(false)), T0);

    engine.handle_event(chunk(ExecutionId::from_raw(1), "error: broken\n"), T0 + 100);
    provider.set(URI, vec![error_diag("mismatched types")]);
    engine.handle_event(EngineEvent::EditorActivated { uri: Some(URI.to_string()) }, T0 + 200);
    assert_eq!(sink.play_count(), 0);
    assert!(engine.retries.is_empty());
}

#[test]
fn monitor_toggles_silence_their_own_source_only() {
    let (mut engine, sink, provider) = test_engine(StoredSettings::default());
    engine.handle_event(
        EngineEvent::Command(EngineCommand::SetMonitorDiagnostics(false)),
        T0,
    );
    provider.set(URI, vec![error_diag("mismatched types")]);
    engine.handle_event(EngineEvent::EditorActivated { uri: Some(URI.to_string()) }, T0 + 100);
    assert_eq!(sink.play_count(), 0);

    engine.handle_event(chunk(ExecutionId::from_raw(1), "error: broken\n"), T0 + 200);
    assert_eq!(sink.play_count(), 1);
}

#[test]
fn warning_severity_mode_alerts_on_warnings() {
    let (mut engine, sink, provider) = test_engine(StoredSettings::default());
    provider.set(URI, vec![Diagnostic::new(Severity::Warning, "unused variable")]);

    engine.handle_event(EngineEvent::EditorActivated { uri: Some(URI.to_string()) }, T0);
    assert_eq!(sink.play_count(), 0);

    engine.handle_event(
        EngineEvent::Command(EngineCommand::SetDiagnosticsSeverity(
            DiagnosticsSeverityMode::WarningAndError,
        )),
        T0 + 100,
    );
    engine.handle_event(
        EngineEvent::DiagnosticsChanged { uris: vec![URI.to_string()] },
        T0 + 200,
    );
    assert_eq!(sink.play_count(), 1);
}

#[test]
fn replacing_settings_swaps_the_compiled_patterns() {
    let (mut engine, sink, _) = test_engine(StoredSettings::default());
    let custom = StoredSettings {
        patterns: vec!["kaboom".to_string()],
        pattern_mode: PatternMode::Override,
        ..StoredSettings::default()
    };
    engine.handle_event(EngineEvent::SettingsUpdated(custom), T0);

    engine.handle_event(chunk(ExecutionId::from_raw(1), "KABOOM!\n"), T0 + 100);
    assert_eq!(sink.play_count(), 1);
    // The built-in vocabulary no longer applies under the override.
    engine.handle_event(chunk(ExecutionId::from_raw(2), "error: broken\n"), T0 + 10_000);
    assert_eq!(sink.play_count(), 1);
}

#[test]
fn shutdown_clears_all_detector_state_and_stops_the_loop() {
    let (mut engine, _, provider) = test_engine(StoredSettings::default());
    let exec = ExecutionId::from_raw(1);
    engine.handle_event(chunk(exec, "partial tail without newline"), T0);
    engine.handle_event(chunk(ExecutionId::from_raw(2), "error: broken\n"), T0 + 10);
    provider.set(URI, vec![error_diag("mismatched types")]);
    engine.handle_event(EngineEvent::EditorActivated { uri: Some(URI.to_string()) }, T0 + 100);
    assert!(!engine.retries.is_empty());

    assert!(!engine.handle_event(EngineEvent::Shutdown, T0 + 200));
    assert!(engine.retries.is_empty());
    assert_eq!(engine.tracker.live_executions(), 0);
}
