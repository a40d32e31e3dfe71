//! Table and age formatting for terminal output

use chrono::{DateTime, Utc};

/// Format a timestamp as a human-readable age (e.g. "2d", "5h", "30m",
/// "15s").
pub fn format_age(timestamp: &DateTime<Utc>) -> String {
    let elapsed = Utc::now().signed_duration_since(*timestamp);

    if elapsed.num_seconds() < 0 {
        return "0s".to_string();
    }

    if elapsed.num_days() > 0 {
        return format!("{}d", elapsed.num_days());
    }

    if elapsed.num_hours() > 0 {
        return format!("{}h", elapsed.num_hours());
    }

    if elapsed.num_minutes() > 0 {
        return format!("{}m", elapsed.num_minutes());
    }

    format!("{}s", elapsed.num_seconds())
}

/// Print rows as a column-aligned table under the given headers.
pub fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();

    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let header: Vec<String> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| format!("{h:<width$}", width = widths[i]))
        .collect();
    println!("{}", header.join("  ").trim_end());

    for row in rows {
        let line: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let width = widths.get(i).copied().unwrap_or(0);
                format!("{cell:<width$}")
            })
            .collect();
        println!("{}", line.join("  ").trim_end());
    }
}
