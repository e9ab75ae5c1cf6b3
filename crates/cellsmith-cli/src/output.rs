//! Formatted output helpers for CLI commands.
//!
//! Provides the instances table, colored markers, and human-readable
//! durations.

use cellsmith_deps::render::InstanceRow;

pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";
pub const GREEN: &str = "\x1b[32m";
pub const CYAN: &str = "\x1b[36m";
pub const YELLOW: &str = "\x1b[33m";
pub const RESET: &str = "\x1b[0m";

const HEADERS: [&str; 4] = ["INSTANCE NAME", "CELL IMAGE", "USED INSTANCE", "SHARED"];

/// Lays out instance rows as a left-aligned table with a header line.
#[must_use]
pub fn instance_table(rows: &[InstanceRow]) -> Vec<String> {
    let cells: Vec<[String; 4]> = rows
        .iter()
        .map(|row| {
            [
                row.instance.clone(),
                row.image.clone(),
                row.used.to_string(),
                if row.shared { "Shared" } else { "-" }.to_string(),
            ]
        })
        .collect();

    let mut widths = HEADERS.map(str::len);
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let format_line = |values: [&str; 4]| {
        let line = values
            .iter()
            .zip(widths)
            .map(|(value, width)| format!("{value:<width$}"))
            .collect::<Vec<_>>()
            .join("   ");
        line.trim_end().to_string()
    };

    let mut lines = vec![format_line(HEADERS)];
    for row in &cells {
        lines.push(format_line([&row[0], &row[1], &row[2], &row[3]]));
    }
    lines
}

/// Formats a duration in milliseconds (e.g., "850ms", "12.4s", "3m 05s").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_millis(millis: i64) -> String {
    let millis = millis.max(0);
    if millis < 1_000 {
        format!("{millis}ms")
    } else if millis < 60_000 {
        format!("{:.1}s", millis as f64 / 1_000.0)
    } else {
        let seconds = millis / 1_000;
        format!("{}m {:02}s", seconds / 60, seconds % 60)
    }
}
