//! Markdown summaries of a profile.
//!
//! Functions are ranked by **self** value (samples where the function is the
//! leaf) and by **total** value (samples where it appears anywhere on the
//! stack, counted once per stack even under recursion).
//!
//! # Formats
//!
//! ```text
//! summary   top 15 by self
//! detailed  top 50 by self, top 50 by total, 10 hottest stacks
//! adaptive  detailed up to 40 distinct functions, else summary + 5 stacks
//! ```

// Percentage calculations convert i64 to f64
#![allow(clippy::cast_precision_loss)]

use std::collections::{HashMap, HashSet};
use std::fmt::Write;

use proftoggle_common::MarkdownFormat;

use super::classification::{classify_frame, FrameOrigin};
use super::stacks::{Frame, ProfileView, WeightedStack};

const SUMMARY_TOP: usize = 15;
const DETAILED_TOP: usize = 50;
const DETAILED_STACKS: usize = 10;
const ADAPTIVE_MAX_FUNCTIONS: usize = 40;
const ADAPTIVE_STACKS: usize = 5;

/// A function with its aggregated self and total values.
#[derive(Debug, Clone)]
pub struct FunctionHotspot {
    pub name: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub self_value: i64,
    pub total_value: i64,
    pub origin: FrameOrigin,
}

impl FunctionHotspot {
    fn location(&self) -> String {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => format!("{file}:{line}"),
            (Some(file), None) => file.clone(),
            _ => String::new(),
        }
    }
}

/// Aggregate per-function self and total values, heaviest self first.
#[must_use]
pub fn analyze_hotspots(view: &ProfileView) -> Vec<FunctionHotspot> {
    let mut functions: HashMap<&str, FunctionHotspot> = HashMap::new();

    for stack in &view.stacks {
        let mut seen: HashSet<&str> = HashSet::new();
        for frame in &stack.frames {
            let entry = functions.entry(frame.name.as_str()).or_insert_with(|| hotspot_for(frame));
            if seen.insert(frame.name.as_str()) {
                entry.total_value += stack.value;
            }
        }
        if let Some(leaf) = stack.frames.last() {
            if let Some(entry) = functions.get_mut(leaf.name.as_str()) {
                entry.self_value += stack.value;
            }
        }
    }

    let mut hotspots: Vec<FunctionHotspot> = functions.into_values().collect();
    hotspots.sort_unstable_by(|a, b| {
        b.self_value.cmp(&a.self_value).then_with(|| b.total_value.cmp(&a.total_value)).then_with(|| a.name.cmp(&b.name))
    });
    hotspots
}

fn hotspot_for(frame: &Frame) -> FunctionHotspot {
    FunctionHotspot {
        name: frame.name.clone(),
        file: frame.file.clone(),
        line: frame.line,
        self_value: 0,
        total_value: 0,
        origin: classify_frame(&frame.name, frame.file.as_deref()),
    }
}

/// Render `view` as markdown titled `title`.
#[must_use]
pub fn render_markdown(view: &ProfileView, title: &str, format: MarkdownFormat) -> String {
    let hotspots = analyze_hotspots(view);
    let function_count = hotspots.len();
    let mut out = String::new();

    let _ = writeln!(out, "# {title}\n");
    let _ = writeln!(out, "- Sample type: `{}` ({})", view.sample_type, view.unit);
    let _ = writeln!(out, "- Total: {}", format_value(view.total, &view.unit));
    let _ = writeln!(out, "- Distinct stacks: {}", view.stacks.len());
    let _ = writeln!(out, "- Distinct functions: {function_count}");
    let _ = writeln!(out, "- Format: {format}\n");

    if view.is_empty() {
        out.push_str("_No samples were captured._\n");
        return out;
    }

    let detailed = match format {
        MarkdownFormat::Summary => false,
        MarkdownFormat::Detailed => true,
        MarkdownFormat::Adaptive => function_count <= ADAPTIVE_MAX_FUNCTIONS,
    };

    if detailed {
        write_self_table(&mut out, view, &hotspots, DETAILED_TOP);
        write_total_table(&mut out, view, &hotspots, DETAILED_TOP);
        write_stacks(&mut out, view, DETAILED_STACKS);
    } else {
        write_self_table(&mut out, view, &hotspots, SUMMARY_TOP);
        if format == MarkdownFormat::Adaptive {
            write_stacks(&mut out, view, ADAPTIVE_STACKS);
        }
    }

    out
}

fn write_self_table(out: &mut String, view: &ProfileView, hotspots: &[FunctionHotspot], top: usize) {
    let _ = writeln!(out, "## Top {} functions by self\n", top.min(hotspots.len()));
    let _ = writeln!(out, "| # | Function | Self | Self % | Total % | Origin | Location |");
    let _ = writeln!(out, "|---|----------|------|--------|---------|--------|----------|");
    for (rank, h) in hotspots.iter().filter(|h| h.self_value > 0).take(top).enumerate() {
        let _ = writeln!(
            out,
            "| {} | `{}` | {} | {:.1}% | {:.1}% | {} | {} |",
            rank + 1,
            escape(&h.name),
            format_value(h.self_value, &view.unit),
            percent(h.self_value, view.total),
            percent(h.total_value, view.total),
            h.origin.label(),
            escape(&h.location()),
        );
    }
    out.push('\n');
}

fn write_total_table(out: &mut String, view: &ProfileView, hotspots: &[FunctionHotspot], top: usize) {
    let mut by_total: Vec<&FunctionHotspot> = hotspots.iter().collect();
    by_total.sort_by(|a, b| b.total_value.cmp(&a.total_value).then_with(|| a.name.cmp(&b.name)));

    let _ = writeln!(out, "## Top {} functions by total\n", top.min(by_total.len()));
    let _ = writeln!(out, "| # | Function | Total | Total % | Self % | Origin |");
    let _ = writeln!(out, "|---|----------|-------|---------|--------|--------|");
    for (rank, h) in by_total.into_iter().take(top).enumerate() {
        let _ = writeln!(
            out,
            "| {} | `{}` | {} | {:.1}% | {:.1}% | {} |",
            rank + 1,
            escape(&h.name),
            format_value(h.total_value, &view.unit),
            percent(h.total_value, view.total),
            percent(h.self_value, view.total),
            h.origin.label(),
        );
    }
    out.push('\n');
}

fn write_stacks(out: &mut String, view: &ProfileView, top: usize) {
    let _ = writeln!(out, "## Hottest stacks\n");
    for (rank, stack) in view.stacks.iter().take(top).enumerate() {
        let _ = writeln!(
            out,
            "### {}. {:.1}% ({})\n",
            rank + 1,
            percent(stack.value, view.total),
            format_value(stack.value, &view.unit)
        );
        write_stack(out, stack);
    }
}

fn write_stack(out: &mut String, stack: &WeightedStack) {
    out.push_str("```text\n");
    for (depth, frame) in stack.frames.iter().enumerate() {
        let marker = if classify_frame(&frame.name, frame.file.as_deref()).is_user_code() { "*" } else { " " };
        let _ = writeln!(out, "{marker} {:indent$}{}", "", frame.name, indent = depth * 2);
    }
    out.push_str("```\n\n");
}

fn percent(value: i64, total: i64) -> f64 {
    if total > 0 {
        value as f64 / total as f64 * 100.0
    } else {
        0.0
    }
}

fn format_value(value: i64, unit: &str) -> String {
    let v = value as f64;
    match unit {
        "bytes" if v >= 1024.0 * 1024.0 * 1024.0 => format!("{:.2} GiB", v / (1024.0 * 1024.0 * 1024.0)),
        "bytes" if v >= 1024.0 * 1024.0 => format!("{:.2} MiB", v / (1024.0 * 1024.0)),
        "bytes" if v >= 1024.0 => format!("{:.1} KiB", v / 1024.0),
        "bytes" => format!("{value} B"),
        "nanoseconds" if v >= 1e9 => format!("{:.2} s", v / 1e9),
        "nanoseconds" if v >= 1e6 => format!("{:.1} ms", v / 1e6),
        "nanoseconds" if v >= 1e3 => format!("{:.1} µs", v / 1e3),
        "nanoseconds" => format!("{value} ns"),
        _ => value.to_string(),
    }
}

/// Keep function names from breaking table cells.
fn escape(s: &str) -> String {
    s.replace('|', "\\|").replace('`', "'")
}
