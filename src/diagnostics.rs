//! Diagnostics change detection: fingerprints the active document's
//! qualifying diagnostics and decides when a changed failure state should
//! reach the gate.
//!
//! Providers may re-report the same failures in a different order on every
//! pass, so the fingerprint sorts its entries before joining; an unchanged
//! failure state must never read as new.

use std::collections::HashMap;

use crate::gate::{AlertGate, AlertScope};
use crate::settings::{DiagnosticsSeverityMode, RuntimeSettings};

const FINGERPRINT_LINE_SEPARATOR: &str = "\n";

/// Margin added to the remaining cooldown when scheduling a retry, so the
/// retry lands just after the window opens.
pub const RETRY_MARGIN_MS: u64 = 30;
/// Retry delay when the acquire itself loses the window to a racing scope.
pub const RETRY_RACE_DELAY_MS: u64 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Information,
    Hint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub fn new(start_line: u32, start_character: u32, end_line: u32, end_character: u32) -> Self {
        Self {
            start: Position { line: start_line, character: start_character },
            end: Position { line: end_line, character: end_character },
        }
    }
}

/// One reported problem in a document, as delivered by the editor runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub source: Option<String>,
    pub code: Option<String>,
    pub range: Range,
    pub message: String,
}

impl Diagnostic {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            source: None,
            code: None,
            range: Range::default(),
            message: message.into(),
        }
    }

    fn serialize(&self) -> String {
        let source = self.source.as_deref().unwrap_or("");
        let code = self.code.as_deref().unwrap_or("");
        format!(
            "{source}|{code}|{}:{}-{}:{}|{}",
            self.range.start.line,
            self.range.start.character,
            self.range.end.line,
            self.range.end.character,
            self.message,
        )
    }
}

fn severity_qualifies(severity: Severity, mode: DiagnosticsSeverityMode) -> bool {
    match severity {
        Severity::Error => true,
        Severity::Warning => mode == DiagnosticsSeverityMode::WarningAndError,
        _ => false,
    }
}

fn is_excluded(diagnostic: &Diagnostic, settings: &RuntimeSettings) -> bool {
    settings
        .exclude_patterns
        .iter()
        .any(|pattern| pattern.is_match(&diagnostic.message))
}

/// Stable fingerprint of a document's qualifying diagnostics, or `None` when
/// nothing qualifies.
pub fn fingerprint(diagnostics: &[Diagnostic], settings: &RuntimeSettings) -> Option<String> {
    let mut entries: Vec<String> = diagnostics
        .iter()
        .filter(|diagnostic| severity_qualifies(diagnostic.severity, settings.diagnostics_severity))
        .filter(|diagnostic| !is_excluded(diagnostic, settings))
        .map(Diagnostic::serialize)
        .collect();
    if entries.is_empty() {
        return None;
    }
    entries.sort();
    Some(entries.join(FINGERPRINT_LINE_SEPARATOR))
}

/// What the engine should do after a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDecision {
    /// Monitoring disabled or alerts suppressed; state untouched.
    Skip,
    /// No qualifying diagnostics remain; clearing a failure is silent.
    Cleared,
    /// Same failure state as last time; never re-alert.
    Unchanged,
    /// New failure state and the gate granted playback.
    Alert,
    /// New failure state but the gate is closed; re-scan after the delay.
    Retry { delay_ms: u64 },
}

/// Per-document failure-state tracker.
///
/// Each URI is either absent (no known failures) or mapped to the
/// fingerprint of its last alerted failure state. The fingerprint is only
/// stored when an alert actually wins the gate, so a candidate that lost
/// still reads as new when the retry re-runs the scan.
#[derive(Debug, Default)]
pub struct DiagnosticsWatcher {
    fingerprints: HashMap<String, String>,
}

impl DiagnosticsWatcher {
    #[must_use = "a watcher only tracks documents it is asked to scan"]
    pub fn new() -> Self {
        Self::default()
    }

    /// Full scan of one document's diagnostics against its recorded state.
    pub fn scan(
        &mut self,
        uri: &str,
        diagnostics: &[Diagnostic],
        settings: &RuntimeSettings,
        gate: &AlertGate,
        now_ms: u64,
    ) -> ScanDecision {
        if !settings.enabled || !settings.monitor_diagnostics {
            return ScanDecision::Skip;
        }
        if gate.suppression_reason(settings, now_ms).is_some() {
            return ScanDecision::Skip;
        }

        let Some(candidate) = fingerprint(diagnostics, settings) else {
            self.fingerprints.remove(uri);
            return ScanDecision::Cleared;
        };

        if self.fingerprints.get(uri) == Some(&candidate) {
            return ScanDecision::Unchanged;
        }

        let remaining_ms = gate.remaining_cooldown_ms(
            settings.diagnostics_cooldown_ms,
            AlertScope::Diagnostics,
            now_ms,
        );
        if remaining_ms > 0 {
            return ScanDecision::Retry { delay_ms: remaining_ms + RETRY_MARGIN_MS };
        }
        if !gate.try_acquire(settings.diagnostics_cooldown_ms, AlertScope::Diagnostics, now_ms) {
            return ScanDecision::Retry { delay_ms: RETRY_RACE_DELAY_MS };
        }

        self.fingerprints.insert(uri.to_string(), candidate);
        ScanDecision::Alert
    }

    /// Drop a single document's recorded state.
    pub fn forget(&mut self, uri: &str) {
        self.fingerprints.remove(uri);
    }

    /// Drop all recorded state (teardown).
    pub fn clear(&mut self) {
        self.fingerprints.clear();
    }
}
