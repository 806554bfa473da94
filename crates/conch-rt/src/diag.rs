// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime diagnostics.
//!
//! Everything goes to stderr in gcc/clang locus form so editors and build
//! tools can navigate: `file:line:col: kind: message`, or
//! `conch: kind: message` when no source location applies.

use colored::Colorize;

/// Non-fatal runtime diagnostic without a source location.
pub fn warning(msg: &str) {
    eprintln!("conch: {}: {}", "warning".yellow().bold(), msg);
}

/// Non-fatal diagnostic anchored to generated-code coordinates.
pub fn warning_at(file: &str, line: u32, col: u32, msg: &str) {
    eprintln!("{}:{}:{}: {}: {}", file, line, col, "warning".yellow().bold(), msg);
}

/// Informational note (spawn-timing dumps and similar).
pub fn note(msg: &str) {
    eprintln!("conch: {}: {}", "note".cyan().bold(), msg);
}

/// Unrecoverable runtime fault. Prints and aborts the process.
pub fn fatal(msg: &str) -> ! {
    eprintln!("conch: {}: {}", "fatal error".red().bold(), msg);
    std::process::abort()
}
