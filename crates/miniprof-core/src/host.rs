//! Host-facing contracts: request description, capability struct, wrapping.
//!
//! Everything the profiler needs from its host (whether to profile, where
//! to store, what to call the machine, how to render) is injected once into
//! a [`MiniProfiler`] and then shared by every request.

use std::fmt;
use std::sync::Arc;

use miniprof_schemas::Profile;
use sysinfo::System;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::profiler::{Profiler, ProfilerOptions};
use crate::storage::{Storage, StorageError};

/// URL prefix under which the viewer's results endpoint and assets live.
pub const RESOURCE_PATH: &str = "/mini-profiler-resources/";

/// Viewer protocol version, appended to asset URLs for cache busting.
pub const VERSION: &str = "0.2";

/// What the profiler knows about an inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestInfo {
    /// HTTP method, e.g. `GET`.
    pub method: String,
    /// Absolute request URL including the query string.
    pub url: String,
    /// Authenticated user, if the host knows one.
    pub user: Option<String>,
}

impl RequestInfo {
    /// Describes a request by method and absolute URL.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            user: None,
        }
    }

    /// Sets the requesting user.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// `"<METHOD> <URL>"`, the name given to a request's root timing.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.method, self.url)
    }
}

/// Where the viewer's popup is docked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Position {
    #[default]
    Left,
    Right,
}

impl Position {
    /// Value used in the embed snippet.
    pub fn as_str(self) -> &'static str {
        match self {
            Position::Left => "left",
            Position::Right => "right",
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Display flags passed to the browser-side viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    pub position: Position,
    /// Show timings below the trivial threshold.
    pub show_trivial: bool,
    /// Show child timings expanded.
    pub show_children: bool,
    /// How many profiles the popup keeps listed.
    pub max_traces: usize,
    /// Show the minimize/clear controls.
    pub show_controls: bool,
    /// Key combination that toggles the popup.
    pub toggle_shortcut: String,
    /// Start with the popup hidden.
    pub start_hidden: bool,
    /// Whether the viewer may show profile details.
    pub authorized: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            position: Position::Left,
            show_trivial: false,
            show_children: false,
            max_traces: 15,
            show_controls: true,
            toggle_shortcut: "Alt+P".to_string(),
            start_hidden: false,
            authorized: true,
        }
    }
}

/// Decides whether a request is profiled.
pub type EnablePredicate = Arc<dyn Fn(&RequestInfo) -> bool + Send + Sync>;

/// Resolves the label shown as the serving machine.
pub type MachineNameResolver = Arc<dyn Fn() -> String + Send + Sync>;

/// The local hostname, or an empty string if it cannot be determined.
pub fn hostname() -> String {
    System::host_name().unwrap_or_default()
}

/// Capabilities a host injects into the profiler.
///
/// Cheap to clone; clones share the store and callbacks.
#[derive(Clone)]
pub struct MiniProfiler {
    storage: Arc<dyn Storage>,
    enable: EnablePredicate,
    machine_name: MachineNameResolver,
    options: ProfilerOptions,
    render: RenderOptions,
}

impl fmt::Debug for MiniProfiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiniProfiler")
            .field("options", &self.options)
            .field("render", &self.render)
            .finish_non_exhaustive()
    }
}

impl MiniProfiler {
    /// Creates a profiler that profiles every request into `storage`.
    pub fn new(storage: impl Storage + 'static) -> Self {
        Self::with_shared_storage(Arc::new(storage))
    }

    /// Like [`MiniProfiler::new`] for a store the host also holds.
    pub fn with_shared_storage(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            enable: Arc::new(|_: &RequestInfo| true),
            machine_name: Arc::new(hostname),
            options: ProfilerOptions::default(),
            render: RenderOptions::default(),
        }
    }

    /// Sets the predicate deciding which requests are profiled.
    #[must_use]
    pub fn with_enable(
        mut self,
        enable: impl Fn(&RequestInfo) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.enable = Arc::new(enable);
        self
    }

    /// Sets how the machine name is resolved.
    #[must_use]
    pub fn with_machine_name(
        mut self,
        machine_name: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        self.machine_name = Arc::new(machine_name);
        self
    }

    /// Sets clock and trivial threshold for new profiles.
    ///
    /// `options.machine_name` is ignored; the resolver supplies it.
    #[must_use]
    pub fn with_options(mut self, options: ProfilerOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the viewer display flags.
    #[must_use]
    pub fn with_render(mut self, render: RenderOptions) -> Self {
        self.render = render;
        self
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn render_options(&self) -> &RenderOptions {
        &self.render
    }

    /// Asks the enable predicate about `request`.
    pub fn is_enabled(&self, request: &RequestInfo) -> bool {
        (self.enable)(request)
    }

    /// Resolves the machine name.
    pub fn machine_name(&self) -> String {
        (self.machine_name)()
    }

    /// Starts a profiler for `request`, or `None` if it is not enabled.
    ///
    /// The profile starts unnamed so that finalization names it after the
    /// request.
    pub fn start(&self, request: &RequestInfo) -> Option<Profiler> {
        if !self.is_enabled(request) {
            return None;
        }
        let options = ProfilerOptions {
            machine_name: self.machine_name(),
            ..self.options.clone()
        };
        let mut profiler = Profiler::with_options("", options);
        if let Some(user) = &request.user {
            profiler.set_user(user.clone());
        }
        debug!(profile = %profiler.id(), url = %request.url, "profiling request");
        Some(profiler)
    }

    /// Stores a finalized profile, logging instead of failing.
    ///
    /// Returns whether the store accepted it.
    pub fn store(&self, request: &RequestInfo, profile: &Profile) -> bool {
        match self.storage.save(request, profile) {
            Ok(()) => true,
            Err(err) => {
                warn!(profile = %profile.id, error = %err, "failed to store profile");
                false
            }
        }
    }

    /// Fetches a stored profile.
    pub fn load(
        &self,
        request: &RequestInfo,
        id: Uuid,
    ) -> Result<Option<Profile>, StorageError> {
        self.storage.load(request, id)
    }

    /// Profiles `f` as the handler for `request`.
    ///
    /// `f` receives the live profiler, or `None` when the request is not
    /// enabled. Once `f` is done (by returning, or by unwinding) the profile
    /// is finalized and stored. Storage failures are logged and never reach
    /// `f`'s result.
    pub fn wrap<R>(
        &self,
        request: &RequestInfo,
        f: impl FnOnce(Option<&mut Profiler>) -> R,
    ) -> R {
        let mut session = Session {
            host: self,
            request,
            profiler: self.start(request),
        };
        f(session.profiler.as_mut())
    }
}

/// Finalizes and stores on drop, so unwinding handlers are covered too.
struct Session<'a> {
    host: &'a MiniProfiler,
    request: &'a RequestInfo,
    profiler: Option<Profiler>,
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        let Some(profiler) = self.profiler.take() else {
            return;
        };
        let profile = profiler.finalize(Some(self.request));
        self.host.store(self.request, &profile);
    }
}
