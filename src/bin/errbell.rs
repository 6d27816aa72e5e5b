//! errbell CLI: wrap a shell command and ring the bell when it fails.

use std::env;
use std::fmt::Display;
use std::io::{self, Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use errbell::audio::{resolve_sound_path, AlertSink, SystemPlayer};
use errbell::diagnostics::Diagnostic;
use errbell::engine::{spawn_engine, DiagnosticsProvider, EngineEvent};
use errbell::execution::spawn_output_reader;
use errbell::init_tracing;
use errbell::settings::{
    config_file_path, is_valid_quiet_hours_time, load_stored_settings, StoredSettings,
};

/// Grace period so a fire-and-forget playback can launch its player process
/// before this process exits.
const PLAYBACK_SPAWN_GRACE_MS: u64 = 300;

#[derive(Parser)]
#[command(
    name = "errbell",
    version,
    about = "Audible error bell for terminal commands and editor diagnostics"
)]
struct Cli {
    /// Write JSON trace logs (destination: ERRBELL_TRACE_LOG).
    #[arg(long, env = "ERRBELL_LOGS", global = true)]
    logs: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run a command, stream its output through, and alert on failure.
    Run(RunArgs),
    /// Play the alert sound once, bypassing every suppression rule.
    TestSound,
    /// Print an environment and configuration report.
    Doctor,
}

#[derive(Args)]
struct RunArgs {
    /// Playback volume in percent (overrides the configured value).
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    volume: Option<u8>,

    /// Alert sound file (overrides the configured value).
    #[arg(long, value_name = "PATH")]
    sound: Option<String>,

    /// Minimum gap between terminal alerts, in milliseconds.
    #[arg(long, value_name = "MS")]
    cooldown_ms: Option<u64>,

    /// Extra error pattern (repeatable); added on top of the configured set.
    #[arg(long = "pattern", value_name = "REGEX")]
    patterns: Vec<String>,

    /// Suppress alerts inside this window, e.g. "22:00-07:00".
    #[arg(long, value_name = "HH:MM-HH:MM")]
    quiet_hours: Option<String>,

    /// The command to run. A single quoted argument is split shell-style.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

/// The CLI has no editor attached; diagnostics monitoring idles.
struct NoDiagnostics;

impl DiagnosticsProvider for NoDiagnostics {
    fn diagnostics_for(&self, _uri: &str) -> Vec<Diagnostic> {
        Vec::new()
    }
}

/// Mirror everything read from the child to the parent's own stream.
struct TeeReader<R, W> {
    inner: R,
    mirror: W,
}

impl<R: Read, W: Write> Read for TeeReader<R, W> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            // The wrapped command's output must keep flowing even if our
            // own stream is broken.
            let _ = self.mirror.write_all(&buf[..n]);
            let _ = self.mirror.flush();
        }
        Ok(n)
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.logs);

    let exit_code = match cli.command {
        CliCommand::Run(args) => run_command(args),
        CliCommand::TestSound => play_test_sound().map(|()| 0),
        CliCommand::Doctor => print_doctor_report().map(|()| 0),
    };

    match exit_code {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("errbell: {err:#}");
            std::process::exit(1);
        }
    }
}

fn apply_run_overrides(mut stored: StoredSettings, args: &RunArgs) -> Result<StoredSettings> {
    if let Some(volume) = args.volume {
        stored.volume_percent = volume;
    }
    if let Some(sound) = &args.sound {
        stored.custom_sound_path = sound.trim().to_string();
    }
    if let Some(cooldown_ms) = args.cooldown_ms {
        stored.terminal_cooldown_ms = cooldown_ms.max(errbell::settings::MIN_COOLDOWN_MS);
    }
    stored
        .patterns
        .extend(args.patterns.iter().map(|pattern| pattern.trim().to_string()));
    if let Some(window) = &args.quiet_hours {
        let Some((start, end)) = window.split_once('-') else {
            bail!("quiet hours must look like 22:00-07:00, got {window:?}");
        };
        let (start, end) = (start.trim(), end.trim());
        if !is_valid_quiet_hours_time(start) || !is_valid_quiet_hours_time(end) {
            bail!("quiet hours must look like 22:00-07:00, got {window:?}");
        }
        stored.quiet_hours_enabled = true;
        stored.quiet_hours_start = start.to_string();
        stored.quiet_hours_end = end.to_string();
    }
    Ok(stored)
}

fn resolve_argv(command: &[String]) -> Result<Vec<String>> {
    let argv = if command.len() == 1 {
        shell_words::split(&command[0]).context("failed to parse command line")?
    } else {
        command.to_vec()
    };
    if argv.is_empty() {
        bail!("no command given");
    }
    Ok(argv)
}

fn run_command(args: RunArgs) -> Result<i32> {
    let stored = apply_run_overrides(load_stored_settings(), &args)?;
    let argv = resolve_argv(&args.command)?;

    let handle = spawn_engine(stored, Box::new(NoDiagnostics), Box::new(SystemPlayer::new()));
    let id = handle.begin_execution();

    let mut child = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {:?}", argv[0]))?;

    let stdout = child.stdout.take().context("child stdout missing")?;
    let stderr = child.stderr.take().context("child stderr missing")?;
    let stdout_reader = spawn_output_reader(
        id,
        TeeReader { inner: stdout, mirror: io::stdout() },
        handle.events(),
    );
    let stderr_reader = spawn_output_reader(
        id,
        TeeReader { inner: stderr, mirror: io::stderr() },
        handle.events(),
    );

    let status = child.wait().context("failed to wait for child")?;
    let _ = stdout_reader.join();
    let _ = stderr_reader.join();
    handle.send(EngineEvent::ExecutionEnded { id, exit_code: status.code() });
    handle.shutdown();

    if status.code() == Some(0) {
        Ok(0)
    } else {
        // Let a just-dispatched alert start before the process ends.
        thread::sleep(Duration::from_millis(PLAYBACK_SPAWN_GRACE_MS));
        Ok(status.code().unwrap_or(1))
    }
}

fn play_test_sound() -> Result<()> {
    let settings = load_stored_settings().compile();
    let sound_path = resolve_sound_path(&settings.custom_sound_path);
    let player = SystemPlayer::new();
    player.play(&settings, &sound_path);
    thread::sleep(Duration::from_millis(PLAYBACK_SPAWN_GRACE_MS));
    Ok(())
}

/// Structured text report builder for `errbell doctor`.
struct DoctorReport {
    lines: Vec<String>,
}

impl DoctorReport {
    fn new(title: &str) -> Self {
        Self { lines: vec![title.to_string()] }
    }

    fn section(&mut self, title: &str) {
        self.lines.push(String::new());
        self.lines.push(format!("{title}:"));
    }

    fn push_kv(&mut self, key: &str, value: impl Display) {
        self.lines.push(format!("  {key}: {value}"));
    }

    fn render(&self) -> String {
        self.lines.join("\n")
    }
}

fn print_doctor_report() -> Result<()> {
    let stored = load_stored_settings();
    let settings = stored.compile();
    let player = SystemPlayer::new();
    let sound_path = resolve_sound_path(&settings.custom_sound_path);

    let mut report = DoctorReport::new("errbell doctor");
    report.push_kv("version", env!("CARGO_PKG_VERSION"));
    report.push_kv("os", format!("{}/{}", env::consts::OS, env::consts::ARCH));

    report.section("Config");
    match config_file_path() {
        Some(path) => report.push_kv("path", path.display()),
        None => report.push_kv("path", "unresolvable"),
    }
    report.push_kv("enabled", stored.enabled);
    report.push_kv("monitor_terminal", stored.monitor_terminal);
    report.push_kv("monitor_diagnostics", stored.monitor_diagnostics);
    report.push_kv("terminal_cooldown_ms", stored.terminal_cooldown_ms);
    report.push_kv("diagnostics_cooldown_ms", stored.diagnostics_cooldown_ms);
    report.push_kv(
        "quiet_hours",
        if stored.quiet_hours_enabled {
            format!("{}-{}", stored.quiet_hours_start, stored.quiet_hours_end)
        } else {
            "disabled".to_string()
        },
    );
    report.push_kv("patterns", settings.patterns.len());
    report.push_kv("exclude_patterns", settings.exclude_patterns.len());

    report.section("Audio");
    report.push_kv("player", player.resolved_player().unwrap_or("none found"));
    report.push_kv("sound", sound_path.display());
    report.push_kv("sound_exists", sound_path.exists());

    println!("{}", report.render());
    Ok(())
}
