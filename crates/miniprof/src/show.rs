//! Plain-text rendering of stored profiles for the terminal.

use std::fmt::Write;

use anyhow::Result;
use miniprof_core::{ListOptions, RequestInfo, Storage};
use miniprof_schemas::{Profile, Timing};

/// Renders the header, timing tree and custom-timing totals of `profile`.
///
/// Columns are total ms, self ms and offset from the start of the request.
/// Trivial steps are marked with `~`, steps with duplicate SQL with `!`.
pub fn render_tree(profile: &Profile) -> String {
    let mut out = String::new();
    let machine = if profile.machine_name.is_empty() {
        "?"
    } else {
        &profile.machine_name
    };
    let _ = writeln!(
        out,
        "{profile} on {machine}, started {}",
        profile.started.format("%Y-%m-%d %H:%M:%S%.3f UTC")
    );
    if let Some(user) = &profile.user {
        let _ = writeln!(out, "user: {user}");
    }
    let _ = writeln!(out, "{:>9} {:>9} {:>9}  step", "total", "self", "start");
    write_timing(&mut out, &profile.root);

    if profile.has_sql_timings {
        let _ = writeln!(
            out,
            "sql: {:.1} ms ({} readers, {} scalars, {} non-queries)",
            profile.duration_milliseconds_in_sql,
            profile.executed_readers,
            profile.executed_scalars,
            profile.executed_non_queries
        );
    }
    for name in &profile.custom_timing_names {
        if let Some(stat) = profile.custom_timing_stats.get(name) {
            let _ = writeln!(out, "{name}: {:.1} ms ({})", stat.duration, stat.count);
        }
    }
    out
}

fn write_timing(out: &mut String, timing: &Timing) {
    let mark = if timing.has_duplicate_sql_timings {
        '!'
    } else if timing.is_trivial {
        '~'
    } else {
        ' '
    };
    let indent = "  ".repeat(timing.depth as usize);
    let _ = writeln!(
        out,
        "{:>9.1} {:>9.1} {:>9.1} {mark}{indent}{}",
        timing.duration_milliseconds,
        timing.duration_without_children_milliseconds,
        timing.start_milliseconds,
        timing.name
    );
    for child in &timing.children {
        write_timing(out, child);
    }
}

/// Renders one line per stored profile selected by `options`.
pub fn render_listing(storage: &dyn Storage, options: &ListOptions) -> Result<String> {
    let request = RequestInfo::default();
    let mut out = String::new();
    for id in storage.list(options)? {
        // A profile deleted between list and load is simply skipped.
        let Some(profile) = storage.load(&request, id)? else {
            continue;
        };
        let _ = writeln!(
            out,
            "{id}  {}  {profile}",
            profile.started.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(out)
}
