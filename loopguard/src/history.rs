//! Plain-text views of mission history for `loopguard history` and
//! `loopguard lessons`.

use std::fmt::Write as _;

use crate::core::lessons::Lesson;
use crate::io::memory::MissionRecord;

const HEADERS: [&str; 7] = ["TIMESTAMP", "TASK", "ATTEMPT", "MODEL", "STATUS", "CLASS", "COST"];

fn row(record: &MissionRecord) -> [String; 7] {
    let mut status = record.status.to_string();
    if let Some(reason) = record.stop_reason {
        status.push_str(&format!(" ({reason})"));
    }
    [
        record.timestamp.clone(),
        record.task_id.clone(),
        record.attempt.to_string(),
        record.model.clone(),
        status,
        record
            .classification
            .map_or_else(|| "-".to_string(), |class| class.to_string()),
        format!("${:.4}", record.cost),
    ]
}

/// Render `records` as a left-aligned table, one row per record.
pub fn render_history(records: &[MissionRecord]) -> String {
    if records.is_empty() {
        return "no missions recorded\n".to_string();
    }
    let rows: Vec<[String; 7]> = records.iter().map(row).collect();
    let mut widths = HEADERS.map(str::len);
    for cells in &rows {
        for (width, cell) in widths.iter_mut().zip(cells) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let headers = HEADERS.map(str::to_string);
    for cells in std::iter::once(&headers).chain(&rows) {
        let line = cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ");
        let _ = writeln!(out, "{}", line.trim_end());
    }
    out
}

/// Render ranked lessons, best first.
pub fn render_lessons(lessons: &[Lesson]) -> String {
    if lessons.is_empty() {
        return "no lessons recorded\n".to_string();
    }
    let mut out = String::new();
    for (rank, lesson) in lessons.iter().enumerate() {
        let _ = writeln!(out, "{}. [{}] {}", rank + 1, lesson.class, lesson.mistake);
        let _ = writeln!(out, "   fix: {}", lesson.remediation);
        if !lesson.signature.signals.is_empty() {
            let signals: Vec<&str> = lesson.signature.signals.iter().map(|s| s.as_str()).collect();
            let _ = writeln!(out, "   signals: {}", signals.join(", "));
        }
    }
    out
}
