//! Terminal output helpers.

use colored::Colorize;
use serde::Serialize;

/// Section header: ">> Title" in cyan.
pub fn section(title: &str) {
    println!("  {} {}", ">>".bright_cyan().bold(), title.bold());
}

/// Key-value display: "  Label:       value".
pub fn kv(label: &str, value: &str) {
    println!("  {:<13}{}", format!("{label}:"), value);
}

/// Print a success message.
pub fn success(msg: &str) {
    println!("  {} {}", "\u{2714}".bright_green(), msg);
}

/// Print an error message.
pub fn error(msg: &str) {
    eprintln!("  {} {}", "\u{2718}".bright_red(), msg.bright_red());
}

/// Hint line: "  hint: message" in dimmed text.
pub fn hint(msg: &str) {
    println!("  {} {}", "hint:".dimmed(), msg.dimmed());
}

/// Pretty-print any serializable value as JSON.
pub fn json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => error(&format!("cannot render JSON: {e}")),
    }
}

/// The serde label of a unit enum variant (`rolled_back`, `success`, ...).
pub fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => "?".to_string(),
    }
}

/// Render rows under bold headers with columns padded to the widest cell.
pub fn render_rows(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }
    let line = |cells: Vec<String>| -> String {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut out = vec![line(headers.iter().map(|h| h.bold().to_string()).collect())];
    out.extend(rows.iter().map(|row| line(row.clone())));
    out.join("\n")
}

/// Print rows, or a dimmed note when there are none.
pub fn rows(headers: &[&str], rows: &[Vec<String>]) {
    if rows.is_empty() {
        println!("  {}", "(none)".dimmed());
    } else {
        println!("{}", render_rows(headers, rows));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_columns_align_to_widest_cell() {
        colored::control::set_override(false);
        let rendered = render_rows(
            &["ID", "STATUS"],
            &[
                vec!["a".into(), "pending".into()],
                vec!["abcdef".into(), "applied".into()],
            ],
        );
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "a       pending");
        assert_eq!(lines[2], "abcdef  applied");
    }

    #[test]
    fn test_label_uses_serde_name() {
        assert_eq!(label(&sicc_types::niche::NicheVersionStatus::RolledBack), "rolled_back");
    }
}
