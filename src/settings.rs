//! Stored and runtime settings: schema defaults, normalization, pattern
//! compilation, and persistent TOML config.
//!
//! Persisted values live in `~/.config/errbell/config.toml` (override the
//! directory via `ERRBELL_CONFIG_DIR`). Loading is permissive: a missing or
//! unreadable file yields defaults, out-of-range values are clamped, and
//! malformed entries fall back field by field.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const CONFIG_FILE: &str = "config.toml";
const CONFIG_DIR_ENV: &str = "ERRBELL_CONFIG_DIR";

pub const MIN_COOLDOWN_MS: u64 = 500;

/// Built-in terminal/diagnostic failure indicators, compiled case-insensitive.
pub const DEFAULT_PATTERNS: &[&str] = &[
    r"\berror\b",
    r"\bfailed\b",
    r"\bfailure\b",
    r"\bfatal\b",
    r"\bexception\b",
    r"\bcritical\b",
    r"\berr(or)?[:!\]]",
    r"\buncaught\b",
    r"UnhandledPromiseRejection",
    r"Traceback \(most recent call last\):",
    r"\bsyntaxerror\b",
    r"\btypeerror\b",
    r"\breferenceerror\b",
    r"\brangeerror\b",
    r"\bmodule\s+not\s+found\b",
    r"\bcannot\s+find\s+module\b",
    r"\bno\s+module\s+named\b",
    r"\bsegmentation\s+fault\b",
    r"\bcore\s+dumped\b",
    r"\bpanic:|\bpanicked\s+at\b",
    r"^\s*caused\s+by:",
    r"\bpermission\s+denied\b",
    r"\baccess\s+denied\b",
    r"\bcommand\s+not\s+found\b",
    r"\btimeout(?:\s+exceeded)?\b",
    r"\bconnection\s+(?:refused|reset|timed\s*out)\b",
    r"\bhttp\s+5\d\d\b",
];

/// Lines that contain a failure word without indicating a failure, e.g. VCS
/// commit summaries echoing a conventional-commit subject.
pub const DEFAULT_EXCLUDE_PATTERNS: &[&str] = &[
    r"^\[[^\]]+\s[0-9a-f]{7,40}\]\s(?:feat|fix|docs|style|refactor|perf|test|build|ci|chore|revert)(?:\([^)]+\))?!?:\s.+$",
    r"^(?:feat|fix|docs|style|refactor|perf|test|build|ci|chore|revert)(?:\([^)]+\))?!?:\s.+$",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiagnosticsSeverityMode {
    Error,
    WarningAndError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternMode {
    /// User patterns replace the built-ins (falling back to the built-ins
    /// when none of the user's entries compile).
    Override,
    /// User patterns extend the built-ins.
    Append,
}

/// Settings as persisted: plain strings and numbers, normalized on load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredSettings {
    pub enabled: bool,
    pub monitor_terminal: bool,
    pub monitor_diagnostics: bool,
    pub diagnostics_severity: DiagnosticsSeverityMode,
    /// Legacy shared cooldown; the per-source values default from it.
    pub cooldown_ms: u64,
    pub terminal_cooldown_ms: u64,
    pub diagnostics_cooldown_ms: u64,
    pub pattern_mode: PatternMode,
    pub volume_percent: u8,
    pub custom_sound_path: String,
    pub quiet_hours_enabled: bool,
    pub quiet_hours_start: String,
    pub quiet_hours_end: String,
    pub patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
}

impl Default for StoredSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            monitor_terminal: true,
            monitor_diagnostics: true,
            diagnostics_severity: DiagnosticsSeverityMode::Error,
            cooldown_ms: 1_500,
            terminal_cooldown_ms: 1_500,
            diagnostics_cooldown_ms: 1_500,
            pattern_mode: PatternMode::Override,
            volume_percent: 70,
            custom_sound_path: String::new(),
            quiet_hours_enabled: false,
            quiet_hours_start: "22:00".to_string(),
            quiet_hours_end: "07:00".to_string(),
            patterns: DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect(),
            exclude_patterns: DEFAULT_EXCLUDE_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

/// On-disk shape: every field optional so partial configs merge over defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PartialSettings {
    pub enabled: Option<bool>,
    pub monitor_terminal: Option<bool>,
    pub monitor_diagnostics: Option<bool>,
    pub diagnostics_severity: Option<DiagnosticsSeverityMode>,
    pub cooldown_ms: Option<u64>,
    pub terminal_cooldown_ms: Option<u64>,
    pub diagnostics_cooldown_ms: Option<u64>,
    pub pattern_mode: Option<PatternMode>,
    pub volume_percent: Option<i64>,
    pub custom_sound_path: Option<String>,
    pub quiet_hours_enabled: Option<bool>,
    pub quiet_hours_start: Option<String>,
    pub quiet_hours_end: Option<String>,
    pub patterns: Option<Vec<String>>,
    pub exclude_patterns: Option<Vec<String>>,
}

fn quiet_hours_time_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([01]\d|2[0-3]):([0-5]\d)$").expect("static pattern"))
}

/// True when `value` is a well-formed `HH:mm` 24-hour time.
pub fn is_valid_quiet_hours_time(value: &str) -> bool {
    quiet_hours_time_regex().is_match(value)
}

fn normalize_quiet_hours_time(value: Option<String>, fallback: &str) -> String {
    match value {
        Some(raw) => {
            let trimmed = raw.trim();
            if is_valid_quiet_hours_time(trimmed) {
                trimmed.to_string()
            } else {
                fallback.to_string()
            }
        }
        None => fallback.to_string(),
    }
}

fn normalize_pattern_list(raw: Option<Vec<String>>, defaults: &[&str]) -> Vec<String> {
    raw.unwrap_or_else(|| defaults.iter().map(|p| p.to_string()).collect())
        .into_iter()
        .map(|pattern| pattern.trim().to_string())
        .filter(|pattern| !pattern.is_empty())
        .collect()
}

impl StoredSettings {
    /// Merge a partial (possibly hostile) source over the defaults, clamping
    /// every value into its valid range.
    pub fn from_partial(source: PartialSettings) -> Self {
        let defaults = Self::default();
        let fallback_cooldown_ms = source
            .cooldown_ms
            .unwrap_or(defaults.cooldown_ms)
            .max(MIN_COOLDOWN_MS);

        Self {
            enabled: source.enabled.unwrap_or(defaults.enabled),
            monitor_terminal: source.monitor_terminal.unwrap_or(defaults.monitor_terminal),
            monitor_diagnostics: source
                .monitor_diagnostics
                .unwrap_or(defaults.monitor_diagnostics),
            diagnostics_severity: source
                .diagnostics_severity
                .unwrap_or(defaults.diagnostics_severity),
            cooldown_ms: fallback_cooldown_ms,
            terminal_cooldown_ms: source
                .terminal_cooldown_ms
                .unwrap_or(fallback_cooldown_ms)
                .max(MIN_COOLDOWN_MS),
            diagnostics_cooldown_ms: source
                .diagnostics_cooldown_ms
                .unwrap_or(fallback_cooldown_ms)
                .max(MIN_COOLDOWN_MS),
            pattern_mode: source.pattern_mode.unwrap_or(defaults.pattern_mode),
            volume_percent: source
                .volume_percent
                .unwrap_or(i64::from(defaults.volume_percent))
                .clamp(0, 100) as u8,
            custom_sound_path: source
                .custom_sound_path
                .map(|path| path.trim().to_string())
                .unwrap_or(defaults.custom_sound_path),
            quiet_hours_enabled: source
                .quiet_hours_enabled
                .unwrap_or(defaults.quiet_hours_enabled),
            quiet_hours_start: normalize_quiet_hours_time(
                source.quiet_hours_start,
                &defaults.quiet_hours_start,
            ),
            quiet_hours_end: normalize_quiet_hours_time(
                source.quiet_hours_end,
                &defaults.quiet_hours_end,
            ),
            patterns: normalize_pattern_list(source.patterns, DEFAULT_PATTERNS),
            exclude_patterns: normalize_pattern_list(
                source.exclude_patterns,
                DEFAULT_EXCLUDE_PATTERNS,
            ),
        }
    }

    /// Compile the stored pattern strings into runtime form.
    #[must_use = "compiled settings are what the detectors consume"]
    pub fn compile(&self) -> RuntimeSettings {
        let user_patterns = compile_pattern_list(&self.patterns, "pattern");
        let exclude_patterns = compile_pattern_list(&self.exclude_patterns, "exclude");
        let patterns = match self.pattern_mode {
            PatternMode::Append => {
                let mut combined = default_compiled_patterns();
                combined.extend(user_patterns);
                combined
            }
            PatternMode::Override => {
                if user_patterns.is_empty() {
                    default_compiled_patterns()
                } else {
                    user_patterns
                }
            }
        };

        RuntimeSettings {
            enabled: self.enabled,
            monitor_terminal: self.monitor_terminal,
            monitor_diagnostics: self.monitor_diagnostics,
            diagnostics_severity: self.diagnostics_severity,
            terminal_cooldown_ms: self.terminal_cooldown_ms,
            diagnostics_cooldown_ms: self.diagnostics_cooldown_ms,
            volume_percent: self.volume_percent,
            custom_sound_path: self.custom_sound_path.clone(),
            quiet_hours_enabled: self.quiet_hours_enabled,
            quiet_hours_start: self.quiet_hours_start.clone(),
            quiet_hours_end: self.quiet_hours_end.clone(),
            patterns,
            exclude_patterns,
        }
    }
}

/// Settings as the detectors consume them: regexes compiled, clamps applied.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub enabled: bool,
    pub monitor_terminal: bool,
    pub monitor_diagnostics: bool,
    pub diagnostics_severity: DiagnosticsSeverityMode,
    pub terminal_cooldown_ms: u64,
    pub diagnostics_cooldown_ms: u64,
    pub volume_percent: u8,
    pub custom_sound_path: String,
    pub quiet_hours_enabled: bool,
    pub quiet_hours_start: String,
    pub quiet_hours_end: String,
    pub patterns: Vec<Regex>,
    pub exclude_patterns: Vec<Regex>,
}

fn default_compiled_patterns() -> Vec<Regex> {
    DEFAULT_PATTERNS
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .expect("built-in patterns compile")
        })
        .collect()
}

/// Compile user pattern strings case-insensitively, dropping entries that do
/// not parse. Detection proceeds with whatever survives.
fn compile_pattern_list(raw_patterns: &[String], kind: &str) -> Vec<Regex> {
    raw_patterns
        .iter()
        .filter_map(|pattern| {
            match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(regex) => Some(regex),
                Err(err) => {
                    warn!(kind, pattern = %pattern, %err, "ignoring invalid regex");
                    None
                }
            }
        })
        .collect()
}

fn config_dir() -> Option<PathBuf> {
    if let Ok(dir) = env::var(CONFIG_DIR_ENV) {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    dirs::config_dir().map(|dir| dir.join("errbell"))
}

/// Resolve the full config file path.
pub fn config_file_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(CONFIG_FILE))
}

/// Load persisted settings, falling back to defaults when the file is
/// missing or unreadable.
pub fn load_stored_settings() -> StoredSettings {
    let Some(path) = config_file_path() else {
        return StoredSettings::default();
    };
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(_) => return StoredSettings::default(),
    };
    match toml::from_str::<PartialSettings>(&contents) {
        Ok(partial) => StoredSettings::from_partial(partial),
        Err(err) => {
            warn!(path = %path.display(), %err, "ignoring unparsable config");
            StoredSettings::default()
        }
    }
}

/// Persist settings to the config file, creating the directory if needed.
pub fn save_stored_settings(settings: &StoredSettings) {
    let Some(path) = config_file_path() else {
        debug!("config: cannot resolve config file path");
        return;
    };
    if let Some(parent) = path.parent() {
        if let Err(err) = fs::create_dir_all(parent) {
            debug!(dir = %parent.display(), %err, "config: failed to create directory");
            return;
        }
    }
    let body = match toml::to_string_pretty(settings) {
        Ok(body) => body,
        Err(err) => {
            debug!(%err, "config: failed to serialize settings");
            return;
        }
    };
    if let Err(err) = fs::write(&path, body) {
        debug!(path = %path.display(), %err, "config: failed to write");
    }
}

#[cfg(test)]
pub(crate) fn test_runtime_settings() -> RuntimeSettings {
    StoredSettings::default().compile()
}
