//! Optional local trace logging used for debugging alert decisions.

use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_subscriber::fmt::time::UtcTime;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

pub(crate) fn trace_log_path() -> PathBuf {
    env::var("ERRBELL_TRACE_LOG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| env::temp_dir().join("errbell_trace.jsonl"))
}

fn init_tracing_once(enabled: bool, once: &OnceLock<()>) {
    if !enabled {
        return;
    }

    let _ = once.get_or_init(|| {
        let path = trace_log_path();
        let file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => file,
            Err(_) => return,
        };
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_timer(UtcTime::rfc_3339())
            .with_writer(file)
            .with_current_span(false)
            .with_span_list(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Initialize trace logging once per process. A disabled flag or an
/// unopenable sink leaves tracing inert rather than failing.
pub fn init_tracing(enabled: bool) {
    init_tracing_once(enabled, &TRACING_INIT);
}
