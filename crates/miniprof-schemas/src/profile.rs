//! Profile schema: the root aggregate for one profiled request.
//!
//! A `Profile` carries request identity and metadata, the timing tree, and
//! the rollups computed at finalization. It is the unit that persistence
//! adapters store (keyed by `id`) and that the viewer fetches.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use uuid::Uuid;

use crate::timing::{CustomTimingStat, Timing};

/// Browser-side navigation timings reported back by the viewer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientTimings {
    /// Number of redirects before the page loaded.
    #[serde(default)]
    pub redirect_count: i64,
    /// Individual phases, sorted by start offset.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timings: Vec<ClientTiming>,
}

/// One browser navigation phase.
///
/// `start` is relative to `navigationStart`. `duration` is `-1` for phases
/// that reported a start but no end.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientTiming {
    /// Human-readable phase name (e.g. `"Dom Content Loaded Event"`).
    pub name: String,
    /// Offset from navigation start (ms).
    pub start: i64,
    /// Phase length (ms).
    pub duration: i64,
}

/// A finalized (or decoded) profile of one request.
///
/// Built by the finalizer in `miniprof-core`; after that it is plain data,
/// except for `has_user_viewed` and `client_timings`, which the results
/// endpoint may fill in on first retrieval.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Profile {
    /// Unique identifier; the storage key.
    pub id: Uuid,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Wall-clock creation time, encoded as `"/Date(ms)/"`.
    #[serde(with = "crate::serde_date")]
    pub started: DateTime<Utc>,
    /// Label of the serving host.
    #[serde(default)]
    pub machine_name: String,
    /// The timing tree.
    pub root: Timing,
    /// Identity of the requesting user, if the host supplied one.
    pub user: Option<String>,
    /// Whether the results page has been fetched at least once.
    #[serde(default)]
    pub has_user_viewed: bool,
    /// Browser navigation timings, once reported.
    pub client_timings: Option<ClientTimings>,
    /// Total request duration (ms); equals the root timing's duration.
    #[serde(default)]
    pub duration_milliseconds: f64,
    /// Whether any timing is trivial.
    #[serde(default)]
    pub has_trivial_timings: bool,
    /// Whether every timing is trivial.
    #[serde(default)]
    pub has_all_trivial_timings: bool,
    /// Self-time threshold (ms) at or below which a timing is trivial.
    #[serde(default)]
    pub trivial_duration_threshold_milliseconds: f64,
    /// Sum of all SQL record durations in the tree (ms).
    #[serde(default)]
    pub duration_milliseconds_in_sql: f64,
    /// Non-query executions across the tree.
    #[serde(default)]
    pub executed_non_queries: u32,
    /// Reader executions across the tree.
    #[serde(default)]
    pub executed_readers: u32,
    /// Scalar executions across the tree.
    #[serde(default)]
    pub executed_scalars: u32,
    /// Whether any SQL record in the tree is a duplicate.
    #[serde(default)]
    pub has_duplicate_sql_timings: bool,
    /// Whether any timing recorded SQL records.
    #[serde(default)]
    pub has_sql_timings: bool,
    /// Custom-timing statistics merged across the tree, by category.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_timing_stats: BTreeMap<String, CustomTimingStat>,
    /// Distinct custom-timing category names seen anywhere, sorted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_timing_names: Vec<String>,
    /// Link to an external view of the same request.
    pub custom_link: Option<String>,
    /// Label for `custom_link`.
    pub custom_link_name: Option<String>,
}

impl Profile {
    /// Encodes the profile as compact JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Encodes the profile as indented JSON.
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Decodes a profile from JSON text.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Decodes a profile from JSON bytes.
    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Returns every timing in the tree, parents before children.
    pub fn timings(&self) -> Vec<&Timing> {
        let mut out = Vec::with_capacity(self.root.count());
        let mut stack = vec![&self.root];
        while let Some(timing) = stack.pop() {
            out.push(timing);
            stack.extend(timing.children.iter().rev());
        }
        out
    }

    /// Re-derives parent ids and depths throughout the tree.
    ///
    /// The root is marked as such and loses any parent id.
    pub fn rebuild_parent_ids(&mut self) {
        self.root.is_root = true;
        self.root.depth = 0;
        self.root.parent_timing_id = None;
        self.root.rebuild_parent_ids();
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} ms)", self.root.name, self.duration_milliseconds)
    }
}
