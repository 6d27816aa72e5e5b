//! Playback arbitration: cooldown windows, snooze deadlines, and quiet hours.
//!
//! Both detectors funnel through one [`AlertGate`] so two sources reacting to
//! the same underlying failure cannot each claim the audible channel within
//! the same instant.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{Local, TimeZone, Timelike};

use crate::settings::RuntimeSettings;

/// Fixed cross-scope suppression interval. Applies only when the most recent
/// winner was a different scope, and is intentionally much shorter than any
/// per-source cooldown.
pub const SHARED_WINDOW_MS: u64 = 250;

/// Named alert source with its own cooldown timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertScope {
    Terminal,
    Diagnostics,
}

/// Why an otherwise-qualifying alert is currently not allowed to play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressionReason {
    Snoozed,
    QuietHours,
}

#[derive(Debug, Default)]
struct GateState {
    last_playback_ms: HashMap<AlertScope, u64>,
    last_global_ms: u64,
    last_scope: Option<AlertScope>,
    /// Absolute deadline; 0 means not snoozed.
    snooze_until_ms: u64,
}

impl GateState {
    fn remaining_cooldown_ms(&self, cooldown_ms: u64, scope: AlertScope, now_ms: u64) -> u64 {
        let scoped_elapsed =
            now_ms.saturating_sub(self.last_playback_ms.get(&scope).copied().unwrap_or(0));
        let scoped_remaining = cooldown_ms.saturating_sub(scoped_elapsed);
        let shared_remaining = match self.last_scope {
            Some(last) if last != scope => {
                let shared_elapsed = now_ms.saturating_sub(self.last_global_ms);
                SHARED_WINDOW_MS.saturating_sub(shared_elapsed)
            }
            _ => 0,
        };
        scoped_remaining.max(shared_remaining)
    }
}

/// Process-wide arbiter of "may an alert play right now".
///
/// Explicitly constructed and passed by reference to every caller; tests can
/// hold several independent gates side by side.
#[derive(Debug, Default)]
pub struct AlertGate {
    state: Mutex<GateState>,
}

impl AlertGate {
    #[must_use = "a gate only arbitrates playback for callers that hold it"]
    pub fn new() -> Self {
        Self::default()
    }

    /// Time left before `scope` may acquire the playback window again: the
    /// larger of the scope's own cooldown remainder and, when the most recent
    /// winner was a *different* scope, the remainder of the shared window.
    pub fn remaining_cooldown_ms(&self, cooldown_ms: u64, scope: AlertScope, now_ms: u64) -> u64 {
        self.lock().remaining_cooldown_ms(cooldown_ms, scope, now_ms)
    }

    /// Attempt to claim the playback window for `scope`.
    ///
    /// Check and record happen under one lock hold; two sources arriving in
    /// the same instant cannot both win.
    pub fn try_acquire(&self, cooldown_ms: u64, scope: AlertScope, now_ms: u64) -> bool {
        let mut state = self.lock();
        if state.remaining_cooldown_ms(cooldown_ms, scope, now_ms) > 0 {
            return false;
        }
        state.last_playback_ms.insert(scope, now_ms);
        state.last_global_ms = now_ms;
        state.last_scope = Some(scope);
        true
    }

    /// Suppress all alerts until `now + duration`. Negative durations clamp
    /// to zero. Returns the absolute deadline for display.
    pub fn snooze_for_ms(&self, duration_ms: i64, now_ms: u64) -> u64 {
        let deadline = now_ms + duration_ms.max(0) as u64;
        self.lock().snooze_until_ms = deadline;
        deadline
    }

    pub fn clear_snooze(&self) {
        self.lock().snooze_until_ms = 0;
    }

    pub fn snooze_remaining_ms(&self, now_ms: u64) -> u64 {
        self.lock().snooze_until_ms.saturating_sub(now_ms)
    }

    /// Evaluate the current suppression state. Snooze takes precedence over
    /// quiet hours; both are time-dependent, so nothing here is cached.
    pub fn suppression_reason(
        &self,
        settings: &RuntimeSettings,
        now_ms: u64,
    ) -> Option<SuppressionReason> {
        if self.snooze_remaining_ms(now_ms) > 0 {
            return Some(SuppressionReason::Snoozed);
        }
        if is_within_quiet_hours(settings, local_minute_of_day(now_ms)) {
            return Some(SuppressionReason::QuietHours);
        }
        None
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Parse `"HH:mm"` into minutes since midnight. Malformed components degrade
/// to minute 0 rather than erroring.
pub(crate) fn minutes_since_midnight(time: &str) -> u32 {
    let Some((hours_text, minutes_text)) = time.split_once(':') else {
        return 0;
    };
    match (hours_text.parse::<u32>(), minutes_text.parse::<u32>()) {
        (Ok(hours), Ok(minutes)) => hours * 60 + minutes,
        _ => 0,
    }
}

/// Quiet-hours window check on a minute-of-day value.
///
/// start == end covers the full day; start < end is a same-day window;
/// start > end wraps past midnight.
pub(crate) fn is_within_quiet_hours(settings: &RuntimeSettings, now_minutes: u32) -> bool {
    if !settings.quiet_hours_enabled {
        return false;
    }
    let start = minutes_since_midnight(&settings.quiet_hours_start);
    let end = minutes_since_midnight(&settings.quiet_hours_end);
    if start == end {
        return true;
    }
    if start < end {
        return now_minutes >= start && now_minutes < end;
    }
    now_minutes >= start || now_minutes < end
}

fn local_minute_of_day(now_ms: u64) -> u32 {
    Local
        .timestamp_millis_opt(now_ms as i64)
        .single()
        .map(|time| time.hour() * 60 + time.minute())
        .unwrap_or(0)
}
