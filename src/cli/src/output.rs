//! Formatting helpers for CLI output.

use comfy_table::{ContentArrangement, Table};
use stemcell_core::{StageEvent, StageEventKind};

/// Create a borderless table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Render a stage event as one progress line.
pub fn format_event(event: &StageEvent) -> String {
    match &event.kind {
        StageEventKind::Started => format!("Started {}", event.stage.to_lowercase()),
        StageEventKind::Advanced { index, label } => match label {
            Some(label) if !label.is_empty() => {
                format!("  [{}/{}] {}", index, event.total, label)
            }
            _ => format!("  [{}/{}]", index, event.total),
        },
    }
}

/// Show `-` for missing values.
pub fn or_dash(value: Option<&str>) -> String {
    match value {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => "-".to_string(),
    }
}

/// Format a timestamp relative to now.
pub fn format_ago(dt: &chrono::DateTime<chrono::Utc>) -> String {
    let duration = chrono::Utc::now().signed_duration_since(*dt);

    let secs = duration.num_seconds();
    if secs < 60 {
        return "just now".to_string();
    }
    let mins = duration.num_minutes();
    if mins < 60 {
        return format!("{mins} minutes ago");
    }
    let hours = duration.num_hours();
    if hours < 24 {
        return format!("{hours} hours ago");
    }
    format!("{} days ago", duration.num_days())
}
