//! Terminal stream matching: per-execution chunk reassembly, error line
//! classification, and the one-alert-per-execution guarantee.
//!
//! Output arrives as arbitrary chunks that can split lines (and even escape
//! sequences or error words) anywhere, so every chunk is prepended with the
//! execution's carried-over tail before line splitting. The final,
//! possibly-incomplete segment becomes the next tail.

use std::collections::HashMap;
use std::io::{ErrorKind, Read};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use tracing::warn;

use crate::engine::EngineEvent;
use crate::gate::{AlertGate, AlertScope};
use crate::sanitize::clean_terminal_line;
use crate::settings::RuntimeSettings;

/// Upper bound on the carried-over tail, so pathological output with no
/// newlines cannot grow the buffer without limit.
pub const MAX_TAIL_LEN: usize = 500;

const READ_BUFFER_LEN: usize = 4096;
/// A UTF-8 sequence is at most 4 bytes; a longer undecodable remainder is
/// corrupt rather than split.
const MAX_UTF8_CARRY: usize = 3;

/// Opaque handle for one shell command run. Allocated by the engine handle,
/// resolved against the tracker's table, deleted when the execution ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutionId(u64);

impl ExecutionId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Default)]
struct ExecutionState {
    tail: String,
    played: bool,
}

/// Table of live executions and their matcher state.
#[derive(Debug, Default)]
pub struct ExecutionTracker {
    executions: HashMap<ExecutionId, ExecutionState>,
}

impl ExecutionTracker {
    #[must_use = "a tracker only matters while executions feed it"]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one chunk into the execution's stream and report whether any
    /// complete line in it qualifies as an error.
    pub fn chunk_has_error(
        &mut self,
        id: ExecutionId,
        chunk: &str,
        settings: &RuntimeSettings,
    ) -> bool {
        let state = self.executions.entry(id).or_default();
        let combined = format!("{}{}", state.tail, chunk);
        let mut segments: Vec<&str> = combined.split('\n').collect();
        let tail = segments.pop().unwrap_or("");
        state.tail = clamp_tail(tail).to_string();

        segments
            .iter()
            .map(|segment| segment.strip_suffix('\r').unwrap_or(segment))
            .any(|line| line_is_error(line, settings))
    }

    /// Attempt to play for this execution: at most one alert per execution,
    /// and only when nothing suppresses playback and the gate grants the
    /// terminal scope.
    pub fn try_alert(
        &mut self,
        id: ExecutionId,
        settings: &RuntimeSettings,
        gate: &AlertGate,
        now_ms: u64,
    ) -> bool {
        if !settings.monitor_terminal {
            return false;
        }
        if gate.suppression_reason(settings, now_ms).is_some() {
            return false;
        }
        let state = self.executions.entry(id).or_default();
        if state.played {
            return false;
        }
        if !gate.try_acquire(settings.terminal_cooldown_ms, AlertScope::Terminal, now_ms) {
            return false;
        }
        state.played = true;
        true
    }

    /// Delete the execution's entry once it has ended.
    pub fn finish(&mut self, id: ExecutionId) {
        self.executions.remove(&id);
    }

    /// Drop all per-execution state (teardown).
    pub fn clear(&mut self) {
        self.executions.clear();
    }

    pub fn live_executions(&self) -> usize {
        self.executions.len()
    }
}

/// A line qualifies when it survives normalization, matches at least one
/// error pattern, and matches no exclude pattern.
pub(crate) fn line_is_error(raw_line: &str, settings: &RuntimeSettings) -> bool {
    let line = clean_terminal_line(raw_line);
    if line.is_empty() {
        return false;
    }
    if !settings.patterns.iter().any(|pattern| pattern.is_match(&line)) {
        return false;
    }
    if settings
        .exclude_patterns
        .iter()
        .any(|pattern| pattern.is_match(&line))
    {
        return false;
    }
    true
}

fn clamp_tail(tail: &str) -> &str {
    if tail.len() <= MAX_TAIL_LEN {
        return tail;
    }
    let mut start = tail.len() - MAX_TAIL_LEN;
    while !tail.is_char_boundary(start) {
        start += 1;
    }
    &tail[start..]
}

/// Split raw bytes into the longest decodable prefix and a carried remainder
/// when the read boundary lands inside a multi-byte character.
fn split_utf8_boundary(data: Vec<u8>) -> (String, Vec<u8>) {
    match String::from_utf8(data) {
        Ok(text) => (text, Vec::new()),
        Err(err) => {
            let valid_up_to = err.utf8_error().valid_up_to();
            let data = err.into_bytes();
            if data.len() - valid_up_to > MAX_UTF8_CARRY {
                // Genuinely invalid bytes; forward lossily rather than stall.
                return (String::from_utf8_lossy(&data).into_owned(), Vec::new());
            }
            let carry = data[valid_up_to..].to_vec();
            let text = String::from_utf8_lossy(&data[..valid_up_to]).into_owned();
            (text, carry)
        }
    }
}

/// Own one execution's output stream end to end: read chunks, carry split
/// UTF-8 across reads, and forward text to the engine. A read error stops
/// monitoring this execution only.
pub fn spawn_output_reader(
    id: ExecutionId,
    mut reader: impl Read + Send + 'static,
    events: Sender<EngineEvent>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buffer = [0u8; READ_BUFFER_LEN];
        let mut pending: Vec<u8> = Vec::new();
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    let mut data = std::mem::take(&mut pending);
                    data.extend_from_slice(&buffer[..n]);
                    let (text, carry) = split_utf8_boundary(data);
                    pending = carry;
                    if text.is_empty() {
                        continue;
                    }
                    if events.send(EngineEvent::ExecutionChunk { id, chunk: text }).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(%err, "failed to read execution output stream");
                    break;
                }
            }
        }
    })
}
