//! Output formatting utilities

use console::{style, Style};

use kptn_cache::Decision;

/// Print a success message
pub fn success(message: &str) {
    println!("{} {}", style("✓").green().bold(), message);
}

/// Print an error message
pub fn error(message: &str) {
    eprintln!("{} {}", style("✗").red().bold(), message);
}

/// Print a warning message
pub fn warning(message: &str) {
    println!("{} {}", style("!").yellow().bold(), message);
}

/// Print an info message
pub fn info(message: &str) {
    println!("{} {}", style("→").blue(), message);
}

/// Create a styled header
pub fn header(text: &str) -> String {
    style(text).bold().to_string()
}

/// Create a styled key-value line
pub fn key_value(key: &str, value: &str) -> String {
    format!("  {}: {}", style(key).dim(), value)
}

/// Style for version numbers
pub fn version_style() -> Style {
    Style::new().green().bold()
}

/// Style for task names
pub fn task_style() -> Style {
    Style::new().cyan()
}

/// Style for paths
pub fn path_style() -> Style {
    Style::new().cyan()
}

/// One-line rendering of a decision
pub fn decision_line(task: &str, decision: &Decision) -> String {
    let verdict = match decision {
        Decision::Skip(_) => style("skip").dim().to_string(),
        Decision::Run(_) => style("run").green().bold().to_string(),
        Decision::RunArray { array_size, .. } => style(format!("run x{}", array_size))
            .green()
            .bold()
            .to_string(),
    };
    format!(
        "{} {} ({})",
        task_style().apply_to(task),
        verdict,
        decision.reason()
    )
}

/// Shorten a hex digest for display
pub fn short_hash(hash: Option<&str>) -> String {
    match hash {
        Some(h) => h.chars().take(12).collect(),
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_hash() {
        assert_eq!(short_hash(Some("0123456789abcdef")), "0123456789ab");
        assert_eq!(short_hash(None), "-");
    }
}
