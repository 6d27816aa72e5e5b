//! Terminal line normalization for the pattern matcher.

use strip_ansi_escapes::strip;

/// Strip ANSI escape sequences and surrounding whitespace from one line.
///
/// Pattern matching runs on what a human would read in the terminal, not on
/// the styled byte stream.
pub fn clean_terminal_line(raw: &str) -> String {
    let stripped = strip(raw.as_bytes());
    String::from_utf8_lossy(&stripped).trim().to_string()
}
