use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;

/// Pretty JSON on stdout
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render result")?;
    println!("{}", rendered);
    Ok(())
}

/// Status line on stderr, keeping stdout parseable
pub fn success(message: &str) {
    eprintln!("{} {}", "✓".green().bold(), message);
}

pub fn warning(message: &str) {
    eprintln!("{} {}", "⚠".yellow().bold(), message);
}
