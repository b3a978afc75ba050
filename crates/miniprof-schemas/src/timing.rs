//! Timing tree schema: steps, SQL-style records and custom timings.
//!
//! A `Timing` is one named, timed unit of work. Timings nest: each owns its
//! `children` in the order they were opened, so a pre-order walk of the tree
//! visits steps in start order. SQL-style records and custom timings hang
//! off the timing that was current when they were recorded.
//!
//! All durations and offsets are floating-point milliseconds relative to the
//! owning profile's start. Derived fields (`duration_without_children_*`,
//! `executed_*`, `has_*`, `is_trivial`) are filled in once by the finalizer
//! and are plain data afterwards.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use uuid::Uuid;

/// Classification of a SQL-style command execution.
///
/// Serialized as an integer (0 none, 1 non-query, 2 scalar, 3 reader) to
/// match the viewer's expectations.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(into = "u8", try_from = "u8")]
pub enum ExecuteType {
    /// Unclassified execution.
    #[default]
    None,
    /// A statement that returns no rows (insert/update/delete/DDL).
    NonQuery,
    /// A statement returning a single value.
    Scalar,
    /// A statement returning a row set.
    Reader,
}

impl From<ExecuteType> for u8 {
    fn from(value: ExecuteType) -> Self {
        match value {
            ExecuteType::None => 0,
            ExecuteType::NonQuery => 1,
            ExecuteType::Scalar => 2,
            ExecuteType::Reader => 3,
        }
    }
}

impl TryFrom<u8> for ExecuteType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ExecuteType::None),
            1 => Ok(ExecuteType::NonQuery),
            2 => Ok(ExecuteType::Scalar),
            3 => Ok(ExecuteType::Reader),
            other => Err(format!("unknown execute type {other}")),
        }
    }
}

/// Running statistic for one custom-timing category.
///
/// Lives both on each `Timing` (its own records only) and on the `Profile`
/// (merged across the whole tree).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CustomTimingStat {
    /// Sum of record durations (ms).
    pub duration: f64,
    /// Number of records.
    pub count: u32,
}

impl CustomTimingStat {
    /// Accounts for one more record of the given duration.
    pub fn record(&mut self, duration_ms: f64) {
        self.count += 1;
        self.duration += duration_ms;
    }

    /// Adds another statistic into this one.
    pub fn merge(&mut self, other: &CustomTimingStat) {
        self.count += other.count;
        self.duration += other.duration;
    }
}

/// An application-defined timed event, e.g. one RPC or cache call.
///
/// Custom timings are grouped by category name on their owning `Timing`.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CustomTiming {
    /// Unique identifier for this record.
    pub id: Uuid,
    /// Command text shown in the viewer (e.g. the RPC method).
    pub command_string: Option<String>,
    /// Free-form execution kind label.
    pub execute_type: Option<String>,
    /// Offset from profile start (ms).
    #[serde(default)]
    pub start_milliseconds: f64,
    /// How long the call took (ms).
    #[serde(default)]
    pub duration_milliseconds: f64,
    /// Id of the timing this record is attached to; set when recorded.
    pub parent_timing_id: Option<Uuid>,
}

impl CustomTiming {
    /// Creates a record with a fresh id at `start_ms` lasting `duration_ms`.
    pub fn new(start_ms: f64, duration_ms: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            start_milliseconds: start_ms,
            duration_milliseconds: duration_ms,
            ..Self::default()
        }
    }

    /// Sets the command text.
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command_string = Some(command.into());
        self
    }

    /// Sets the execution kind label.
    #[must_use]
    pub fn with_execute_type(mut self, execute_type: impl Into<String>) -> Self {
        self.execute_type = Some(execute_type.into());
        self
    }
}

/// A bound parameter of a SQL-style command.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SqlTimingParameter {
    /// Id of the owning `SqlTiming`.
    pub parent_sql_timing_id: Option<Uuid>,
    /// Parameter name as written in the command.
    #[serde(default)]
    pub name: String,
    /// Rendered parameter value.
    pub value: Option<String>,
    /// Database type name.
    pub db_type: Option<String>,
    /// Declared size, 0 if not applicable.
    #[serde(default)]
    pub size: i32,
}

/// One SQL-style command execution recorded under a timing.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SqlTiming {
    /// Unique identifier for this record.
    pub id: Uuid,
    /// Execution classification, counted per type during finalization.
    #[serde(default)]
    pub execute_type: ExecuteType,
    /// The command text as executed.
    #[serde(default)]
    pub command_string: String,
    /// Pretty-printed command text, if the producer formatted it.
    pub formatted_command_string: Option<String>,
    /// Short call-site description.
    pub stack_trace_snippet: Option<String>,
    /// Offset from profile start (ms).
    #[serde(default)]
    pub start_milliseconds: f64,
    /// Total execution time (ms).
    #[serde(default)]
    pub duration_milliseconds: f64,
    /// Time until the first row was available (ms), readers only.
    pub first_fetch_duration_milliseconds: Option<f64>,
    /// Bound parameters. Omitted if empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<SqlTimingParameter>,
    /// Id of the timing this record is attached to; set when recorded.
    pub parent_timing_id: Option<Uuid>,
    /// Whether the same command text ran more than once in the profile.
    #[serde(default)]
    pub is_duplicate: bool,
}

impl SqlTiming {
    /// Creates a record with a fresh id.
    pub fn new(
        execute_type: ExecuteType,
        command: impl Into<String>,
        start_ms: f64,
        duration_ms: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            execute_type,
            command_string: command.into(),
            start_milliseconds: start_ms,
            duration_milliseconds: duration_ms,
            ..Self::default()
        }
    }
}

/// A node of the timing tree.
///
/// The root timing covers the whole request; every other timing is a step
/// opened while its parent was current.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Timing {
    /// Unique identifier for this timing.
    pub id: Uuid,
    /// Label shown in the viewer.
    #[serde(default)]
    pub name: String,
    /// Total duration including children (ms).
    #[serde(default)]
    pub duration_milliseconds: f64,
    /// Offset from profile start (ms).
    #[serde(default)]
    pub start_milliseconds: f64,
    /// Nested steps in the order they were opened. Omitted if empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Timing>,
    /// Arbitrary annotations. Omitted if empty.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub key_values: BTreeMap<String, String>,
    /// SQL-style records executed while this timing was current.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sql_timings: Vec<SqlTiming>,
    /// Id of the parent timing; absent on the root.
    pub parent_timing_id: Option<Uuid>,
    /// Self-time: duration minus the children's durations. May be negative
    /// if a caller violated temporal nesting.
    #[serde(default)]
    pub duration_without_children_milliseconds: f64,
    /// Sum of this timing's own SQL record durations (ms).
    #[serde(default)]
    pub sql_timings_duration_milliseconds: f64,
    /// Whether self-time is at or below the profile's trivial threshold.
    #[serde(default)]
    pub is_trivial: bool,
    /// Whether any step was opened under this timing.
    #[serde(default)]
    pub has_children: bool,
    /// Whether this timing or any descendant recorded SQL-style records.
    #[serde(default)]
    pub has_sql_timings: bool,
    /// Whether any of this timing's own SQL records is a duplicate.
    #[serde(default)]
    pub has_duplicate_sql_timings: bool,
    /// Whether this is the profile's root timing.
    #[serde(default)]
    pub is_root: bool,
    /// Distance from the root (root = 0).
    #[serde(default)]
    pub depth: u32,
    /// Own reader executions.
    #[serde(default)]
    pub executed_readers: u32,
    /// Own scalar executions.
    #[serde(default)]
    pub executed_scalars: u32,
    /// Own non-query executions.
    #[serde(default)]
    pub executed_non_queries: u32,
    /// Per-category statistics of this timing's own custom timings.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_timing_stats: BTreeMap<String, CustomTimingStat>,
    /// Custom timings by category, each in recording order.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_timings: BTreeMap<String, Vec<CustomTiming>>,
}

impl Timing {
    /// Creates an empty timing with a fresh id.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Calls `f` for this timing and every descendant, parents before
    /// children, siblings in order.
    pub fn for_each(&self, f: &mut impl FnMut(&Timing)) {
        f(self);
        for child in &self.children {
            child.for_each(f);
        }
    }

    /// Counts this timing and all its descendants.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(Timing::count).sum::<usize>()
    }

    /// Finds a timing by id in this subtree.
    pub fn find(&self, id: Uuid) -> Option<&Timing> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    /// Re-derives parent linkage below this timing from the tree shape.
    ///
    /// Sets `parent_timing_id` and `depth` on every descendant, and the
    /// parent id on every SQL and custom record. Used for trees assembled by
    /// hand or decoded from producers that omit the ids.
    pub fn rebuild_parent_ids(&mut self) {
        let id = self.id;
        for sql in &mut self.sql_timings {
            sql.parent_timing_id = Some(id);
        }
        for custom in self.custom_timings.values_mut().flatten() {
            custom.parent_timing_id = Some(id);
        }
        for child in &mut self.children {
            child.parent_timing_id = Some(id);
            child.depth = self.depth + 1;
            child.rebuild_parent_ids();
        }
    }
}
