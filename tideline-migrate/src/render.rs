//! Terminal rendering of lifecycle events

use colored::Colorize;
use crossbeam_channel::Receiver;
use serde_json::Value;
use std::thread::JoinHandle;
use tideline::migration::{Event, EventKind};

fn field<'a>(event: &'a Event, key: &str) -> &'a str {
    event.data.get(key).and_then(Value::as_str).unwrap_or("?")
}

/// One line for an event, `None` for events not worth printing
#[must_use]
pub fn format_event(event: &Event) -> Option<String> {
    let label = || format!("{}_{}", field(event, "version"), field(event, "name"));
    let line = match event.kind {
        EventKind::Started => {
            let steps = event.data.get("steps").and_then(Value::as_u64).unwrap_or(0);
            format!("{} {} step(s)", event.event_type.bold(), steps)
        }
        EventKind::StepStarted => format!("  {} {}", "→".cyan(), label()),
        EventKind::StepSucceeded => {
            let ms = event.data.get("duration_ms").and_then(Value::as_i64).unwrap_or(0);
            format!("  {} {} ({}ms)", "✓".green(), label(), ms)
        }
        EventKind::StepFailed => format!(
            "  {} {}: {}",
            "✗".red(),
            label(),
            field(event, "error").red()
        ),
        EventKind::Done => format!("{}", event.event_type.green().bold()),
        EventKind::Aborted => format!("{}", event.event_type.yellow().bold()),
        EventKind::SafetyFinding => {
            let severity = field(event, "severity");
            let message = field(event, "message");
            let tag = match severity {
                "blocking" => severity.red().bold(),
                "warning" => severity.yellow(),
                _ => severity.dimmed(),
            };
            format!("  [{}] {}", tag, message)
        }
        EventKind::SafetyCheck | EventKind::SafetyVerdict => return None,
    };
    Some(line)
}

/// Print events on a background thread until every sender is gone
pub fn spawn_renderer(events: Receiver<Event>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for event in events.iter() {
            if let Some(line) = format_event(&event) {
                println!("{line}");
            }
        }
    })
}
