//! Live instrumentation: the timing arena and its step cursor.
//!
//! A [`Profiler`] owns every timing of one request in a flat arena. Node 0
//! is the root; every other node records the index of its parent and the
//! indices of its children in opening order. The cursor is a stack of arena
//! indices whose bottom is always the root, so the current node is simply
//! the top of the stack and closing a step pops it.
//!
//! Steps must close in reverse opening order. [`Profiler::end_step`] rejects
//! anything else without touching the tree, and the scoped forms
//! ([`Profiler::enter`], [`Profiler::step`]) make the order a borrow-checker
//! fact: while a [`StepGuard`] is alive the profiler is only reachable
//! through it.
//!
//! A profiler is single-writer. Hosts that instrument concurrent work for
//! one request must put it behind a lock (see
//! [`ProfileHandle`](crate::ProfileHandle)).

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use miniprof_schemas::{
    CustomTiming, ExecuteType, Profile, SqlTiming, Timing, serde_date,
};
use tracing::warn;
use uuid::Uuid;

use crate::clock::{SharedClock, SystemClock};
use crate::error::{ProfileError, ProfileErrorKind};

/// Self-time (ms) at or below which a timing is reported as trivial.
pub const DEFAULT_TRIVIAL_DURATION_THRESHOLD_MS: f64 = 2.0;

/// Distinguishes profilers so that handles cannot cross between them, even
/// between two profilers resumed from the same profile.
static NEXT_PROFILER_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Settings a profiler is created with.
#[derive(Debug, Clone)]
pub struct ProfilerOptions {
    /// Label of the serving host, copied onto the profile.
    pub machine_name: String,
    /// Self-time threshold (ms) for [`Timing::is_trivial`].
    pub trivial_duration_threshold_ms: f64,
    /// Source of all start offsets and durations.
    pub clock: SharedClock,
}

impl Default for ProfilerOptions {
    fn default() -> Self {
        Self {
            machine_name: String::new(),
            trivial_duration_threshold_ms: DEFAULT_TRIVIAL_DURATION_THRESHOLD_MS,
            clock: Arc::new(SystemClock::new()),
        }
    }
}

/// One timing in the arena.
///
/// `timing.children` stays empty while live; the tree is assembled from
/// `children` at finalization.
#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) timing: Timing,
    pub(crate) parent: Option<usize>,
    pub(crate) children: Vec<usize>,
    pub(crate) open: bool,
}

/// Proof that a step was opened, required to close it.
#[derive(Debug)]
#[must_use = "a step stays open until its handle is passed to `end_step`"]
pub struct StepHandle {
    owner: u64,
    index: usize,
}

/// The live state of one profiled request.
#[derive(Debug)]
pub struct Profiler {
    token: u64,
    /// Request metadata. Its `root` is a placeholder; the real tree lives in
    /// `nodes` until finalization.
    pub(crate) profile: Profile,
    pub(crate) nodes: Vec<Node>,
    pub(crate) cursor: Vec<usize>,
    clock: SharedClock,
    origin_ms: f64,
    pub(crate) trivial_threshold_ms: f64,
}

impl Profiler {
    /// Starts profiling with default options.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_options(name, ProfilerOptions::default())
    }

    /// Starts profiling with the given options.
    ///
    /// The root timing is open from this instant until finalization.
    pub fn with_options(name: impl Into<String>, options: ProfilerOptions) -> Self {
        let name = name.into();
        let mut root = Timing::new(name.clone());
        root.is_root = true;
        let profile = Profile {
            id: Uuid::new_v4(),
            name,
            started: serde_date::truncate_to_millis(Utc::now()),
            machine_name: options.machine_name,
            ..Profile::default()
        };
        let origin_ms = options.clock.now_ms();
        Self {
            token: NEXT_PROFILER_TOKEN.fetch_add(1, Ordering::Relaxed),
            profile,
            nodes: vec![Node {
                timing: root,
                parent: None,
                children: Vec::new(),
                open: true,
            }],
            cursor: vec![0],
            clock: options.clock,
            origin_ms,
            trivial_threshold_ms: options.trivial_duration_threshold_ms,
        }
    }

    /// Rebuilds a live profiler from a decoded profile.
    ///
    /// Parent links and depths are re-derived from the tree shape, every
    /// step is closed, and the cursor sits at the root. The elapsed time
    /// continues from the profile's recorded duration, so steps opened after
    /// resuming start where the original request left off.
    pub fn resume(mut profile: Profile, options: ProfilerOptions) -> Self {
        let root = std::mem::take(&mut profile.root);
        let mut nodes = Vec::with_capacity(root.count());
        push_subtree(&mut nodes, root, None);
        nodes[0].timing.is_root = true;
        nodes[0].open = true;

        let origin_ms = options.clock.now_ms() - profile.duration_milliseconds;
        Self {
            token: NEXT_PROFILER_TOKEN.fetch_add(1, Ordering::Relaxed),
            profile,
            nodes,
            cursor: vec![0],
            clock: options.clock,
            origin_ms,
            trivial_threshold_ms: options.trivial_duration_threshold_ms,
        }
    }

    /// The profile's id; the key it will be stored under.
    pub fn id(&self) -> Uuid {
        self.profile.id
    }

    /// The profile's display name.
    pub fn name(&self) -> &str {
        &self.profile.name
    }

    /// Replaces the display name. The finalizer keeps a non-empty name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.profile.name = name.into();
    }

    /// Records who made the request.
    pub fn set_user(&mut self, user: impl Into<String>) {
        self.profile.user = Some(user.into());
    }

    /// Attaches a link to an external view of this request.
    pub fn set_custom_link(&mut self, url: impl Into<String>, name: impl Into<String>) {
        self.profile.custom_link = Some(url.into());
        self.profile.custom_link_name = Some(name.into());
    }

    /// Milliseconds since the profile started.
    pub fn elapsed_ms(&self) -> f64 {
        self.clock.now_ms() - self.origin_ms
    }

    /// Name of the node new steps and records attach to.
    pub fn current_name(&self) -> &str {
        &self.nodes[self.current()].timing.name
    }

    /// Depth of the current node (root = 0).
    pub fn current_depth(&self) -> u32 {
        self.nodes[self.current()].timing.depth
    }

    /// Number of steps opened and not yet closed.
    pub fn open_steps(&self) -> usize {
        self.cursor.len() - 1
    }

    pub(crate) fn current(&self) -> usize {
        // The root never leaves the cursor.
        self.cursor.last().copied().unwrap_or(0)
    }

    /// Opens a step under the current node and makes it current.
    pub fn begin_step(&mut self, name: impl Into<String>) -> StepHandle {
        let start = self.elapsed_ms();
        let parent = self.current();
        let index = self.nodes.len();

        let parent_node = &mut self.nodes[parent];
        parent_node.timing.has_children = true;
        parent_node.children.push(index);

        let mut timing = Timing::new(name);
        timing.start_milliseconds = start;
        timing.depth = parent_node.timing.depth + 1;
        timing.parent_timing_id = Some(parent_node.timing.id);

        self.nodes.push(Node {
            timing,
            parent: Some(parent),
            children: Vec::new(),
            open: true,
        });
        self.cursor.push(index);
        StepHandle {
            owner: self.token,
            index,
        }
    }

    /// Closes a step and makes its parent current again.
    ///
    /// Returns the step's duration in milliseconds. Fails, leaving the tree
    /// and cursor untouched, if the step is not the current node, was
    /// already closed, or belongs to another profiler.
    pub fn end_step(&mut self, handle: &StepHandle) -> Result<f64, ProfileError> {
        if handle.owner != self.token {
            return Err(ProfileError::new(ProfileErrorKind::ForeignStep));
        }
        let node = &self.nodes[handle.index];
        if !node.open {
            return Err(ProfileError::new(ProfileErrorKind::StepClosed {
                step: node.timing.name.clone(),
            }));
        }
        let current = self.current();
        if current != handle.index {
            return Err(ProfileError::new(ProfileErrorKind::StepOutOfOrder {
                step: node.timing.name.clone(),
                current: self.nodes[current].timing.name.clone(),
            }));
        }

        let now = self.elapsed_ms();
        let node = &mut self.nodes[handle.index];
        let duration = now - node.timing.start_milliseconds;
        node.timing.duration_milliseconds = duration;
        node.open = false;
        self.cursor.pop();
        Ok(duration)
    }

    /// Opens a step that closes when the returned guard is dropped.
    ///
    /// The guard dereferences to the profiler, so nested instrumentation
    /// goes through it.
    pub fn enter(&mut self, name: impl Into<String>) -> StepGuard<'_> {
        let handle = self.begin_step(name);
        StepGuard {
            profiler: self,
            handle: Some(handle),
        }
    }

    /// Runs `f` inside a step named `name`.
    ///
    /// The step is closed on every exit path, including unwinding.
    pub fn step<R>(
        &mut self,
        name: impl Into<String>,
        f: impl FnOnce(&mut Profiler) -> R,
    ) -> R {
        let mut guard = self.enter(name);
        f(&mut guard)
    }

    /// Attaches a SQL-style record to the current node.
    ///
    /// Parameters without an owner are linked to the record.
    pub fn add_sql_timing(&mut self, mut sql: SqlTiming) {
        let current = self.current();
        let node = &mut self.nodes[current];
        sql.parent_timing_id = Some(node.timing.id);
        for parameter in &mut sql.parameters {
            parameter.parent_sql_timing_id.get_or_insert(sql.id);
        }
        node.timing.sql_timings.push(sql);
    }

    /// Attaches a custom timing under `category` to the current node.
    ///
    /// The node's per-category statistic is updated in the same call.
    pub fn add_custom_timing(
        &mut self,
        category: impl Into<String>,
        mut custom: CustomTiming,
    ) {
        let category = category.into();
        let current = self.current();
        let timing = &mut self.nodes[current].timing;
        custom.parent_timing_id = Some(timing.id);
        timing
            .custom_timing_stats
            .entry(category.clone())
            .or_default()
            .record(custom.duration_milliseconds);
        timing.custom_timings.entry(category).or_default().push(custom);
    }

    /// Annotates the current node.
    pub fn add_key_value(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let current = self.current();
        self.nodes[current]
            .timing
            .key_values
            .insert(key.into(), value.into());
    }

    /// Times `f` and records it as a SQL-style record on the current node.
    pub fn time_sql<R>(
        &mut self,
        execute_type: ExecuteType,
        command: impl Into<String>,
        f: impl FnOnce() -> R,
    ) -> R {
        let start = self.elapsed_ms();
        let result = f();
        let duration = self.elapsed_ms() - start;
        self.add_sql_timing(SqlTiming::new(execute_type, command, start, duration));
        result
    }

    /// Times `f` and records it as a custom timing on the current node.
    pub fn time_custom<R>(
        &mut self,
        category: impl Into<String>,
        command: impl Into<String>,
        f: impl FnOnce() -> R,
    ) -> R {
        let start = self.elapsed_ms();
        let result = f();
        let duration = self.elapsed_ms() - start;
        self.add_custom_timing(
            category,
            CustomTiming::new(start, duration).with_command(command),
        );
        result
    }
}

/// Appends `timing` and its subtree to the arena, returning its index.
fn push_subtree(nodes: &mut Vec<Node>, mut timing: Timing, parent: Option<usize>) -> usize {
    let children = std::mem::take(&mut timing.children);
    let index = nodes.len();
    match parent {
        Some(p) => {
            timing.parent_timing_id = Some(nodes[p].timing.id);
            timing.depth = nodes[p].timing.depth + 1;
            timing.is_root = false;
        }
        None => {
            timing.parent_timing_id = None;
            timing.depth = 0;
        }
    }
    let id = timing.id;
    for sql in &mut timing.sql_timings {
        sql.parent_timing_id = Some(id);
    }
    for custom in timing.custom_timings.values_mut().flatten() {
        custom.parent_timing_id = Some(id);
    }
    timing.has_children = !children.is_empty();
    nodes.push(Node {
        timing,
        parent,
        children: Vec::with_capacity(children.len()),
        open: false,
    });
    for child in children {
        let child_index = push_subtree(nodes, child, Some(index));
        nodes[index].children.push(child_index);
    }
    index
}

/// An open step that closes when dropped.
///
/// Obtained from [`Profiler::enter`]. Dereferences to the profiler for
/// nested instrumentation.
#[derive(Debug)]
pub struct StepGuard<'p> {
    profiler: &'p mut Profiler,
    handle: Option<StepHandle>,
}

impl StepGuard<'_> {
    /// Closes the step now and returns its duration.
    ///
    /// Fails if a step opened through this guard with
    /// [`Profiler::begin_step`] is still open; the step then stays open
    /// until finalization.
    pub fn finish(mut self) -> Result<f64, ProfileError> {
        match self.handle.take() {
            Some(handle) => self.profiler.end_step(&handle),
            None => Ok(0.0),
        }
    }
}

impl Deref for StepGuard<'_> {
    type Target = Profiler;

    fn deref(&self) -> &Profiler {
        self.profiler
    }
}

impl DerefMut for StepGuard<'_> {
    fn deref_mut(&mut self) -> &mut Profiler {
        self.profiler
    }
}

impl Drop for StepGuard<'_> {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Err(err) = self.profiler.end_step(&handle) {
            warn!(
                profile = %self.profiler.id(),
                error = %err,
                "step guard could not close its step"
            );
        }
    }
}
