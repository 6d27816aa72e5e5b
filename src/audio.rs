//! Playback collaborator: OS player discovery, volume shaping, and the
//! fire-and-forget alert sound.
//!
//! Nothing here feeds back into the gating engine. A failed or skipped
//! playback degrades to "this alert does not play".

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use tracing::warn;

use crate::settings::RuntimeSettings;

const SOUND_PATH_ENV: &str = "ERRBELL_SOUND";
const DEFAULT_SOUND_FILE: &str = "alert.wav";

/// The single contract the engine dispatches through. Implementations must
/// not block the caller; the engine never awaits playback completion.
pub trait AlertSink: Send {
    fn play(&self, settings: &RuntimeSettings, sound_path: &Path);
}

/// Resolve which file to play for one dispatch. The engine re-resolves on
/// every dispatch and never caches the result.
pub fn resolve_sound_path(custom_sound_path: &str) -> PathBuf {
    if !custom_sound_path.is_empty() {
        return PathBuf::from(custom_sound_path);
    }
    if let Ok(path) = env::var(SOUND_PATH_ENV) {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    dirs::data_dir()
        .map(|dir| dir.join("errbell").join(DEFAULT_SOUND_FILE))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOUND_FILE))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlayerKind {
    Afplay,
    Mpg123,
    Mplayer,
    SoxPlay,
    Ffplay,
    Cvlc,
    Aplay,
    PowerShell,
}

impl PlayerKind {
    fn binary(self) -> &'static str {
        match self {
            PlayerKind::Afplay => "afplay",
            PlayerKind::Mpg123 => "mpg123",
            PlayerKind::Mplayer => "mplayer",
            PlayerKind::SoxPlay => "play",
            PlayerKind::Ffplay => "ffplay",
            PlayerKind::Cvlc => "cvlc",
            PlayerKind::Aplay => "aplay",
            PlayerKind::PowerShell => "powershell",
        }
    }

    /// Build the invocation for `sound_path`, shaping volume where the
    /// player supports it. A volume of 100 always plays unmodified.
    fn command(self, sound_path: &Path, volume_percent: u8) -> Command {
        let ratio = f64::from(volume_percent.min(100)) / 100.0;
        let shape_volume = volume_percent != 100;
        let mut command = Command::new(self.binary());
        match self {
            PlayerKind::Afplay => {
                if shape_volume {
                    command.arg("-v").arg(format!("{ratio}"));
                }
                command.arg(sound_path);
            }
            PlayerKind::Mpg123 => {
                command.arg("-q");
                if shape_volume {
                    command.arg("-f").arg(format!("{}", (ratio * 32_768.0).round() as i64));
                }
                command.arg(sound_path);
            }
            PlayerKind::Mplayer => {
                command.arg("-really-quiet");
                if shape_volume {
                    command.arg("-volume").arg(format!("{volume_percent}"));
                }
                command.arg(sound_path);
            }
            PlayerKind::SoxPlay => {
                command.arg("-q").arg(sound_path);
                if shape_volume {
                    command.arg("vol").arg(format!("{ratio}"));
                }
            }
            PlayerKind::Ffplay => {
                command.args(["-nodisp", "-autoexit", "-loglevel", "quiet"]);
                command.arg(sound_path);
            }
            PlayerKind::Cvlc => {
                command.args(["--play-and-exit", "--quiet"]);
                if shape_volume {
                    command.arg(format!("--gain={ratio}"));
                }
                command.arg(sound_path);
            }
            PlayerKind::Aplay => {
                command.arg("-q").arg(sound_path);
            }
            PlayerKind::PowerShell => {
                command.args(["-NoProfile", "-Command"]);
                command.arg(format!(
                    "(New-Object Media.SoundPlayer '{}').PlaySync();",
                    sound_path.display()
                ));
            }
        }
        command.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        command
    }

    fn supports_volume(self) -> bool {
        matches!(
            self,
            PlayerKind::Afplay
                | PlayerKind::Mpg123
                | PlayerKind::Mplayer
                | PlayerKind::SoxPlay
                | PlayerKind::Cvlc
        )
    }
}

fn binary_exists_in_path(binary: &str) -> bool {
    let Some(path_var) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&path_var).any(|dir| {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            return true;
        }
        if cfg!(windows) {
            return dir.join(format!("{binary}.exe")).is_file();
        }
        false
    })
}

fn discover_player() -> Option<PlayerKind> {
    if cfg!(target_os = "macos") && binary_exists_in_path(PlayerKind::Afplay.binary()) {
        return Some(PlayerKind::Afplay);
    }
    if cfg!(windows) {
        return Some(PlayerKind::PowerShell);
    }
    const PROBE_ORDER: &[PlayerKind] = &[
        PlayerKind::Mpg123,
        PlayerKind::Mplayer,
        PlayerKind::SoxPlay,
        PlayerKind::Ffplay,
        PlayerKind::Cvlc,
        PlayerKind::Aplay,
        PlayerKind::Afplay,
    ];
    PROBE_ORDER
        .iter()
        .copied()
        .find(|player| binary_exists_in_path(player.binary()))
}

/// Plays alerts through whatever audio player the host system offers.
pub struct SystemPlayer {
    player: OnceLock<Option<PlayerKind>>,
    warned_missing_paths: Mutex<HashSet<PathBuf>>,
    warned_volume_fallback: Arc<AtomicBool>,
}

impl SystemPlayer {
    #[must_use = "a player only makes noise when handed to the engine"]
    pub fn new() -> Self {
        Self {
            player: OnceLock::new(),
            warned_missing_paths: Mutex::new(HashSet::new()),
            warned_volume_fallback: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Name of the resolved player binary, for the doctor report.
    pub fn resolved_player(&self) -> Option<&'static str> {
        self.resolve().map(PlayerKind::binary)
    }

    fn resolve(&self) -> Option<PlayerKind> {
        *self.player.get_or_init(discover_player)
    }

    fn warn_missing_once(&self, sound_path: &Path) {
        let mut warned = self
            .warned_missing_paths
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if warned.insert(sound_path.to_path_buf()) {
            warn!(path = %sound_path.display(), "alert sound file not found; skipping playback");
        }
    }
}

impl Default for SystemPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertSink for SystemPlayer {
    fn play(&self, settings: &RuntimeSettings, sound_path: &Path) {
        if !sound_path.exists() {
            self.warn_missing_once(sound_path);
            return;
        }
        let Some(player) = self.resolve() else {
            warn!("no audio player found on this system; skipping playback");
            return;
        };

        let path = sound_path.to_path_buf();
        let volume = settings.volume_percent;
        let warned_fallback = Arc::clone(&self.warned_volume_fallback);
        // Fire and forget: spawn, reap, and optionally retry at default
        // volume, all off the caller's thread.
        thread::spawn(move || {
            if run_player(player, &path, volume) {
                return;
            }
            if player.supports_volume() && volume != 100 {
                if !warned_fallback.swap(true, Ordering::Relaxed) {
                    warn!(
                        player = player.binary(),
                        "volume-shaped playback failed; falling back to default volume"
                    );
                }
                run_player(player, &path, 100);
            }
        });
    }
}

fn run_player(player: PlayerKind, sound_path: &Path, volume_percent: u8) -> bool {
    match player.command(sound_path, volume_percent).status() {
        Ok(status) => status.success(),
        Err(err) => {
            warn!(player = player.binary(), %err, "failed to launch audio player");
            false
        }
    }
}
