//! Output helpers shared by the commands.

use colored::Colorize;
use serde::Serialize;

use crate::OutputFormat;

/// Print a result as pretty JSON; text mode is handled by each command.
pub fn print<T: Serialize>(value: &T, format: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    if let OutputFormat::Json = format {
        match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("{}: failed to serialize output: {}", "Error".red().bold(), e),
        }
    }
}

/// Status line on stderr so JSON on stdout stays parseable.
pub fn info(message: &str, format: OutputFormat, quiet: bool) {
    if quiet || matches!(format, OutputFormat::Json) {
        return;
    }
    eprintln!("{} {}", "→".blue().bold(), message);
}

pub fn success(message: &str, format: OutputFormat, quiet: bool) {
    if quiet || matches!(format, OutputFormat::Json) {
        return;
    }
    println!("{} {}", "✓".green().bold(), message);
}

pub fn warning(message: &str, format: OutputFormat, quiet: bool) {
    if quiet || matches!(format, OutputFormat::Json) {
        return;
    }
    eprintln!("{} {}", "!".yellow().bold(), message);
}

/// `0.812` as a coloured percentage: green above 0.7, yellow above 0.4.
pub fn score(value: f64) -> String {
    let text = format!("{:.1}%", value * 100.0);
    if value >= 0.7 {
        text.green().to_string()
    } else if value >= 0.4 {
        text.yellow().to_string()
    } else {
        text.red().to_string()
    }
}
