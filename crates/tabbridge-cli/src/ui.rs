//! Terminal output helpers.
//!
//! Results go to stdout; status lines and failures go to stderr so piped
//! output stays clean JSON.

use colored::Colorize;

/// Print a success message.
pub fn success(msg: &str) {
    eprintln!("  {} {}", "\u{2714}".bright_green(), msg);
}

/// One-line failure message.
pub fn error(msg: &str) {
    eprintln!("{} {}", "error:".bright_red().bold(), msg);
}

/// Section header: ">> Title" in cyan.
pub fn section(title: &str) {
    eprintln!("  {} {}", ">>".bright_cyan().bold(), title.bold());
}

/// Key-value display: "  Label:       value".
pub fn kv(label: &str, value: &str) {
    eprintln!("  {:<13}{}", format!("{label}:"), value);
}

/// Key-value with yellow value.
pub fn kv_warn(label: &str, value: &str) {
    eprintln!("  {:<13}{}", format!("{label}:"), value.bright_yellow());
}

/// Hint line: "  hint: message" in dimmed text.
pub fn hint(msg: &str) {
    eprintln!("  {} {}", "hint:".dimmed(), msg.dimmed());
}

pub fn blank() {
    eprintln!();
}

/// Print a JSON result on stdout.
pub fn json(value: &serde_json::Value, compact: bool) {
    let text = if compact {
        serde_json::to_string(value)
    } else {
        serde_json::to_string_pretty(value)
    };
    println!("{}", text.unwrap_or_else(|_| value.to_string()));
}
