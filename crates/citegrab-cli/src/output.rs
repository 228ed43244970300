use std::sync::Arc;

use citegrab_core::{FailureReason, FlowEvent, FlowSource, Notifier};
use indicatif::ProgressBar;
use owo_colors::OwoColorize;

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

/// One terminal line for a flow event. State changes and wiring are left to
/// the log.
pub fn format_event(event: &FlowEvent, color: ColorMode) -> Option<String> {
    match event {
        FlowEvent::Succeeded {
            source,
            summary,
            delivered_via,
        } => {
            let via = match delivered_via {
                Some(name) => format!("copied via {name}"),
                None => "not copied: no clipboard accepted it".to_string(),
            };
            let line = format!("{} {source}: {} ({via})", tick(color), summary.label());
            Some(line)
        }
        FlowEvent::Failed { source, reason } => {
            let detail = describe(reason);
            if color.enabled() {
                Some(format!("{} {source}: {}", "✗".red(), detail.red()))
            } else {
                Some(format!("✗ {source}: {detail}"))
            }
        }
        FlowEvent::StateChanged { .. } | FlowEvent::ItemWired { .. } => None,
    }
}

fn tick(color: ColorMode) -> String {
    if color.enabled() {
        "✓".green().to_string()
    } else {
        "✓".to_string()
    }
}

/// User-facing wording for a failure.
pub fn describe(reason: &FailureReason) -> String {
    match reason {
        FailureReason::TimedOut => "BibTeX link did not appear in time".to_string(),
        FailureReason::NoTriggerFound => "no Cite button on this result".to_string(),
        other => other.to_string(),
    }
}

/// Print events to stderr, above `bar` when one is shown. Terminal events
/// for queries advance the bar.
pub fn notifier(color: ColorMode, bar: Option<ProgressBar>) -> Notifier {
    Arc::new(move |event: FlowEvent| {
        let terminal_query = matches!(
            &event,
            FlowEvent::Succeeded { source: FlowSource::Query(_), .. }
                | FlowEvent::Failed { source: FlowSource::Query(_), .. }
        );
        if let Some(line) = format_event(&event, color) {
            match &bar {
                Some(bar) => bar.println(line),
                None => eprintln!("{line}"),
            }
        }
        if terminal_query && let Some(bar) = &bar {
            bar.inc(1);
        }
    })
}

/// Final one-line tally.
pub fn print_tally(succeeded: usize, total: usize, color: ColorMode) {
    let failed = total - succeeded;
    let line = format!("{succeeded} of {total} citations copied");
    if !color.enabled() {
        eprintln!("{line}");
    } else if failed == 0 {
        eprintln!("{}", line.green());
    } else {
        eprintln!("{}", line.yellow());
    }
}
