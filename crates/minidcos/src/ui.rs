//! Console output helpers.

use colored::Colorize;

/// Print a step indicator with message.
pub fn print_step(message: &str) {
    eprintln!("{} {}", "▶".cyan(), message.bold());
}

/// Print a success message.
pub fn print_success(message: &str) {
    eprintln!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    eprintln!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}
