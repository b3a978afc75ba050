//! Ingestion of browser navigation timings.
//!
//! The viewer posts the page's `performance.timing` values back as form
//! pairs named `clientPerformance[timing][<phase>Start]` /
//! `clientPerformance[timing][<phase>End]`, all absolute epoch milliseconds,
//! plus `clientPerformance[navigation][redirectCount]`.

use std::collections::HashMap;

use miniprof_schemas::{ClientTiming, ClientTimings};

const TIMING_PREFIX: &str = "clientPerformance[timing][";
const NAVIGATION_START: &str = "clientPerformance[timing][navigationStart]";
const REDIRECT_COUNT: &str = "clientPerformance[navigation][redirectCount]";

/// Parsing of posted client timings into [`ClientTimings`].
pub trait ClientTimingsExt: Sized {
    /// Builds client timings from form or query pairs.
    ///
    /// Offsets are made relative to `navigationStart`; values at or before
    /// it are ignored. A phase with only a start gets duration `-1`; a phase
    /// with only an end starts at 0. Names are sentence-cased
    /// (`domContentLoadedEvent` becomes `Dom Content Loaded Event`) and the
    /// result is sorted by start.
    ///
    /// Returns `None` if `navigationStart` is missing or not an integer.
    fn from_form<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Option<Self>
    where
        K: AsRef<str>,
        V: AsRef<str>;
}

impl ClientTimingsExt for ClientTimings {
    fn from_form<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Option<Self>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        // First value wins for repeated keys, as with HTTP form lookups.
        let mut form: Vec<(String, i64)> = Vec::new();
        let mut navigation_start = None;
        let mut redirect_count = None;
        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref());
            let Ok(value) = value.trim().parse::<i64>() else {
                continue;
            };
            match key {
                NAVIGATION_START => {
                    navigation_start.get_or_insert(value);
                }
                REDIRECT_COUNT => {
                    redirect_count.get_or_insert(value);
                }
                _ if key.starts_with(TIMING_PREFIX) => {
                    if !form.iter().any(|(k, _)| k == key) {
                        form.push((key.to_string(), value));
                    }
                }
                _ => {}
            }
        }
        let navigation_start = navigation_start?;

        let mut phases: HashMap<String, ClientTiming> = HashMap::new();
        for (key, value) in form {
            // Out-of-range input has no meaningful offset.
            let Some(offset) = value
                .checked_sub(navigation_start)
                .filter(|&offset| offset > 0)
            else {
                continue;
            };
            let Some(name) = key
                .strip_prefix(TIMING_PREFIX)
                .and_then(|rest| rest.strip_suffix(']'))
            else {
                continue;
            };

            if let Some(phase) = name.strip_suffix("Start") {
                let entry = phases.entry(phase.to_string());
                entry
                    .and_modify(|timing| {
                        // The end was seen first and is parked in `duration`.
                        timing.start = offset;
                        timing.duration = timing.duration.saturating_sub(offset);
                    })
                    .or_insert_with(|| ClientTiming {
                        name: phase.to_string(),
                        start: offset,
                        duration: -1,
                    });
            } else if let Some(phase) = name.strip_suffix("End") {
                phases
                    .entry(phase.to_string())
                    .and_modify(|timing| timing.duration = offset.saturating_sub(timing.start))
                    .or_insert_with(|| ClientTiming {
                        name: phase.to_string(),
                        start: 0,
                        duration: offset,
                    });
            }
        }

        let mut timings: Vec<ClientTiming> = phases
            .into_values()
            .map(|timing| ClientTiming {
                name: sentence_case(&timing.name),
                ..timing
            })
            .collect();
        timings.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.name.cmp(&b.name)));

        Some(ClientTimings {
            redirect_count: redirect_count.unwrap_or(0),
            timings,
        })
    }
}

/// `fetchStart` -> `Fetch Start`.
fn sentence_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if i == 0 {
            out.extend(c.to_uppercase());
            continue;
        }
        if c.is_uppercase() {
            out.push(' ');
        }
        out.push(c);
    }
    out
}
