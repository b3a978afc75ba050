//! The finalizer: turns a live profiler into a finished [`Profile`].
//!
//! Finalization runs exactly once per profile. `Profiler::finalize` consumes
//! the profiler, so a second pass over the same tree cannot be expressed;
//! shared handles get a one-shot guard on top (see
//! [`ProfileHandle::finalize`](crate::ProfileHandle::finalize)).
//!
//! The arena stores children after their parents, so one walk in reverse
//! index order sees every node after all of its descendants. That single
//! walk computes self-time, the upward `has_sql_timings` flag, SQL and
//! custom-timing rollups, and assembles the owned tree.

use std::collections::BTreeMap;

use itertools::Itertools;
use miniprof_schemas::{CustomTimingStat, ExecuteType, Profile, Timing};
use tracing::{debug, instrument, warn};

use crate::host::RequestInfo;
use crate::profiler::Profiler;

impl Profiler {
    /// Completes the profile and computes every derived statistic.
    ///
    /// Steps still open are closed at this instant (and logged). The root
    /// timing and the profile get the total elapsed time. When `request` is
    /// given the root is renamed to `"<METHOD> <URL>"`, the profile name
    /// takes the same value if it is empty, and the request's user is
    /// recorded if none was set.
    ///
    /// Self-time is never clamped: a step that outlived its parent yields a
    /// negative value, which is kept and logged at debug level.
    #[instrument(level = "debug", skip_all, fields(profile = %self.id()))]
    pub fn finalize(mut self, request: Option<&RequestInfo>) -> Profile {
        let now = self.elapsed_ms();
        self.close_open_steps(now);

        let root = &mut self.nodes[0];
        root.open = false;
        root.timing.start_milliseconds = 0.0;
        root.timing.duration_milliseconds = now;
        root.timing.is_root = true;
        if let Some(request) = request {
            root.timing.name = request.display_name();
            if self.profile.user.is_none() {
                self.profile.user.clone_from(&request.user);
            }
        }
        if self.profile.name.is_empty() {
            self.profile.name.clone_from(&root.timing.name);
        }

        // Command text that occurs more than once anywhere in the profile.
        let command_counts = self
            .nodes
            .iter()
            .flat_map(|node| &node.timing.sql_timings)
            .map(|sql| sql.command_string.clone())
            .counts();

        let count = self.nodes.len();
        let mut children_total = vec![0.0_f64; count];
        let mut subtree_has_sql = vec![false; count];
        let mut built: Vec<Option<Timing>> = (0..count).map(|_| None).collect();

        let threshold = self.trivial_threshold_ms;
        let mut stats: BTreeMap<String, CustomTimingStat> = BTreeMap::new();
        let mut any_trivial = false;
        let mut all_trivial = true;
        let mut any_duplicate = false;
        let profile = &mut self.profile;
        profile.duration_milliseconds_in_sql = 0.0;
        profile.executed_non_queries = 0;
        profile.executed_readers = 0;
        profile.executed_scalars = 0;

        for index in (0..count).rev() {
            let node = &mut self.nodes[index];
            let mut timing = std::mem::take(&mut node.timing);

            let self_time = timing.duration_milliseconds - children_total[index];
            if self_time < 0.0 {
                debug!(
                    step = %timing.name,
                    duration_ms = timing.duration_milliseconds,
                    children_ms = children_total[index],
                    "step is shorter than its children"
                );
            }
            timing.duration_without_children_milliseconds = self_time;
            timing.is_trivial = self_time <= threshold;
            any_trivial |= timing.is_trivial;
            all_trivial &= timing.is_trivial;

            timing.sql_timings_duration_milliseconds = 0.0;
            timing.executed_non_queries = 0;
            timing.executed_readers = 0;
            timing.executed_scalars = 0;
            timing.has_duplicate_sql_timings = false;
            for sql in &mut timing.sql_timings {
                sql.is_duplicate = command_counts
                    .get(&sql.command_string)
                    .is_some_and(|&n| n > 1);
                timing.has_duplicate_sql_timings |= sql.is_duplicate;

                timing.sql_timings_duration_milliseconds += sql.duration_milliseconds;
                profile.duration_milliseconds_in_sql += sql.duration_milliseconds;
                match sql.execute_type {
                    ExecuteType::NonQuery => {
                        timing.executed_non_queries += 1;
                        profile.executed_non_queries += 1;
                    }
                    ExecuteType::Scalar => {
                        timing.executed_scalars += 1;
                        profile.executed_scalars += 1;
                    }
                    ExecuteType::Reader => {
                        timing.executed_readers += 1;
                        profile.executed_readers += 1;
                    }
                    ExecuteType::None => {}
                }
            }
            any_duplicate |= timing.has_duplicate_sql_timings;
            timing.has_sql_timings =
                !timing.sql_timings.is_empty() || subtree_has_sql[index];

            for (category, stat) in &timing.custom_timing_stats {
                stats.entry(category.clone()).or_default().merge(stat);
            }

            timing.children = node
                .children
                .iter()
                .filter_map(|&child| built[child].take())
                .collect();
            timing.has_children = !timing.children.is_empty();

            if let Some(parent) = node.parent {
                children_total[parent] += timing.duration_milliseconds;
                subtree_has_sql[parent] |= timing.has_sql_timings;
            }
            built[index] = Some(timing);
        }

        let root = built[0].take().unwrap_or_default();
        profile.duration_milliseconds = root.duration_milliseconds;
        profile.has_sql_timings = root.has_sql_timings;
        profile.has_duplicate_sql_timings = any_duplicate;
        profile.has_trivial_timings = any_trivial;
        profile.has_all_trivial_timings = all_trivial;
        profile.trivial_duration_threshold_milliseconds = threshold;
        profile.custom_timing_names = stats.keys().cloned().collect();
        profile.custom_timing_stats = stats;
        profile.root = root;

        debug!(
            duration_ms = profile.duration_milliseconds,
            timings = count,
            sql_ms = profile.duration_milliseconds_in_sql,
            "finalized profile"
        );
        std::mem::take(profile)
    }

    /// Closes every step left open, innermost first.
    fn close_open_steps(&mut self, now: f64) {
        while self.cursor.len() > 1 {
            let Some(index) = self.cursor.pop() else {
                break;
            };
            let node = &mut self.nodes[index];
            node.timing.duration_milliseconds = now - node.timing.start_milliseconds;
            node.open = false;
            warn!(
                profile = %self.profile.id,
                step = %node.timing.name,
                "step was still open at finalization"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use miniprof_schemas::{CustomTiming, SqlTiming};

    use super::*;
    use crate::clock::ManualClock;
    use crate::profiler::ProfilerOptions;

    fn manual() -> (Profiler, ManualClock) {
        let clock = ManualClock::new();
        let options = ProfilerOptions {
            clock: Arc::new(clock.clone()),
            machine_name: "box".into(),
            ..ProfilerOptions::default()
        };
        (Profiler::with_options("", options), clock)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn single_step_self_time() {
        let (mut p, clock) = manual();
        clock.set(1.0);
        p.step("something", |_| clock.advance(5.2));
        clock.advance(0.5);

        let profile = p.finalize(None);
        assert!(profile.duration_milliseconds >= 6.2);
        assert!(close(profile.root.duration_milliseconds, profile.duration_milliseconds));
        assert!(close(
            profile.root.duration_without_children_milliseconds,
            profile.duration_milliseconds - 5.2
        ));
        assert!(profile.custom_timing_names.is_empty());
        assert_eq!(profile.machine_name, "box");
    }

    #[test]
    fn sibling_steps_self_time() {
        let (mut p, clock) = manual();
        p.step("a", |_| clock.advance(2.0));
        p.step("b", |_| clock.advance(5.0));
        clock.advance(1.0);

        let profile = p.finalize(None);
        let root = &profile.root;
        assert!(close(
            root.duration_without_children_milliseconds,
            root.duration_milliseconds - 7.0
        ));
        for leaf in &root.children {
            assert!(close(
                leaf.duration_without_children_milliseconds,
                leaf.duration_milliseconds
            ));
            assert!(!leaf.has_children);
            assert_eq!(leaf.depth, 1);
        }
        assert_eq!(root.children[0].name, "a");
        assert_eq!(root.children[1].name, "b");
        assert!(close(root.children[1].start_milliseconds, 2.0));
    }

    #[test]
    fn custom_timing_rolls_up() {
        let (mut p, _clock) = manual();
        p.step("call", |p| {
            p.add_custom_timing("RPC", CustomTiming::new(1.0, 5.2));
        });

        let profile = p.finalize(None);
        let stat = profile.custom_timing_stats["RPC"];
        assert_eq!(stat.count, 1);
        assert!(close(stat.duration, 5.2));
        assert_eq!(profile.custom_timing_names, ["RPC"]);
    }

    #[test]
    fn sql_rollups_and_upward_flag() {
        let (mut p, _clock) = manual();
        p.step("outer", |p| {
            p.step("inner", |p| {
                p.add_sql_timing(SqlTiming::new(ExecuteType::Reader, "select *", 0.0, 3.0));
                p.add_sql_timing(SqlTiming::new(ExecuteType::NonQuery, "update t", 3.0, 1.0));
            });
        });
        p.add_sql_timing(SqlTiming::new(ExecuteType::Scalar, "select count(*)", 4.0, 0.5));

        let profile = p.finalize(None);
        assert!(profile.has_sql_timings);
        assert!(close(profile.duration_milliseconds_in_sql, 4.5));
        assert_eq!(profile.executed_readers, 1);
        assert_eq!(profile.executed_non_queries, 1);
        assert_eq!(profile.executed_scalars, 1);

        let outer = &profile.root.children[0];
        let inner = &outer.children[0];
        assert!(outer.has_sql_timings);
        assert!(outer.sql_timings.is_empty());
        assert!(inner.has_sql_timings);
        assert!(close(inner.sql_timings_duration_milliseconds, 4.0));
        assert_eq!(inner.executed_readers, 1);
        assert_eq!(profile.root.executed_scalars, 1);
        assert!(!profile.has_duplicate_sql_timings);
    }

    #[test]
    fn repeated_commands_are_duplicates() {
        let (mut p, _clock) = manual();
        p.step("a", |p| {
            p.add_sql_timing(SqlTiming::new(ExecuteType::Reader, "select 1", 0.0, 1.0));
        });
        p.step("b", |p| {
            p.add_sql_timing(SqlTiming::new(ExecuteType::Reader, "select 1", 1.0, 1.0));
            p.add_sql_timing(SqlTiming::new(ExecuteType::Reader, "select 2", 2.0, 1.0));
        });

        let profile = p.finalize(None);
        assert!(profile.has_duplicate_sql_timings);
        let a = &profile.root.children[0];
        let b = &profile.root.children[1];
        assert!(a.sql_timings[0].is_duplicate);
        assert!(a.has_duplicate_sql_timings);
        assert!(b.sql_timings[0].is_duplicate);
        assert!(!b.sql_timings[1].is_duplicate);
    }

    #[test]
    fn trivial_flags_follow_threshold() {
        let (mut p, clock) = manual();
        p.step("fast", |_| clock.advance(1.0));
        p.step("slow", |_| clock.advance(10.0));

        let profile = p.finalize(None);
        assert!(close(profile.trivial_duration_threshold_milliseconds, 2.0));
        assert!(profile.root.children[0].is_trivial);
        assert!(!profile.root.children[1].is_trivial);
        assert!(profile.root.is_trivial);
        assert!(profile.has_trivial_timings);
        assert!(!profile.has_all_trivial_timings);
    }

    #[test]
    fn open_steps_are_closed_at_finalization() {
        let (mut p, clock) = manual();
        let _outer = p.begin_step("outer");
        clock.advance(1.0);
        let _inner = p.begin_step("inner");
        clock.advance(2.0);

        let profile = p.finalize(None);
        let outer = &profile.root.children[0];
        assert!(close(outer.duration_milliseconds, 3.0));
        assert!(close(outer.children[0].duration_milliseconds, 2.0));
        assert!(close(profile.duration_milliseconds, 3.0));
    }

    #[test]
    fn negative_self_time_is_kept() {
        let (mut p, clock) = manual();
        let outer = p.begin_step("outer");
        p.step("inner", |_| clock.advance(4.0));
        p.end_step(&outer).unwrap();
        // Simulate a caller that recorded a parent shorter than its child.
        p.nodes[1].timing.duration_milliseconds = 1.0;

        let profile = p.finalize(None);
        let outer = &profile.root.children[0];
        assert!(close(outer.duration_without_children_milliseconds, -3.0));
    }

    #[test]
    fn request_names_root_and_empty_profile() {
        let (p, _clock) = manual();
        let request = RequestInfo::new("GET", "http://localhost/home?x=1")
            .with_user("alice");
        let profile = p.finalize(Some(&request));
        assert_eq!(profile.root.name, "GET http://localhost/home?x=1");
        assert_eq!(profile.name, "GET http://localhost/home?x=1");
        assert_eq!(profile.user.as_deref(), Some("alice"));
        assert!(profile.root.is_root);
        assert!(profile.root.parent_timing_id.is_none());
    }

    #[test]
    fn caller_name_is_kept() {
        let (mut p, _clock) = manual();
        p.set_name("checkout");
        let request = RequestInfo::new("POST", "http://localhost/cart");
        let profile = p.finalize(Some(&request));
        assert_eq!(profile.name, "checkout");
        assert_eq!(profile.root.name, "POST http://localhost/cart");
    }

    #[test]
    fn resumed_profile_finalizes_without_double_counting() {
        let (mut p, clock) = manual();
        p.step("a", |p| {
            p.add_custom_timing("RPC", CustomTiming::new(0.0, 2.0));
            p.add_sql_timing(SqlTiming::new(ExecuteType::Scalar, "select 1", 0.0, 1.0));
            clock.advance(3.0);
        });
        let first = p.finalize(None);

        let decoded = Profile::from_json(&first.to_json().unwrap()).unwrap();
        let options = ProfilerOptions {
            clock: Arc::new(clock.clone()),
            ..ProfilerOptions::default()
        };
        let again = Profiler::resume(decoded, options).finalize(None);

        assert_eq!(again.custom_timing_stats["RPC"].count, 1);
        assert_eq!(again.executed_scalars, 1);
        assert!(close(again.duration_milliseconds_in_sql, 1.0));
        assert!(close(again.duration_milliseconds, first.duration_milliseconds));
        assert_eq!(again.root, first.root);
    }
}
