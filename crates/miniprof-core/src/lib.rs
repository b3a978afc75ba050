//! Request-scoped profiling: live timing tree, finalizer and host contracts.
//!
//! ## Lifecycle
//!
//! ```text
//! MiniProfiler::start -> Profiler (steps, SQL, custom timings) -> finalize -> Profile -> Storage
//! ```
//!
//! A [`Profiler`] is created when a profiled request begins. Application code
//! opens nested steps on it and attaches SQL-style and custom timings to
//! whichever step is current. When the request completes the profiler is
//! consumed by [`Profiler::finalize`], which computes every rollup in one
//! pass and yields an immutable [`Profile`](miniprof_schemas::Profile) for
//! the host's [`Storage`].
//!
//! A profiler is single-writer. Async hosts share it through a
//! [`ProfileHandle`], which serializes access and makes finalization
//! one-shot.
//!
//! ```
//! use miniprof_core::{MemoryStorage, MiniProfiler, RequestInfo, Storage};
//!
//! let storage = std::sync::Arc::new(MemoryStorage::new());
//! let mp = MiniProfiler::with_shared_storage(storage.clone());
//! let request = RequestInfo::new("GET", "http://localhost/");
//!
//! let id = mp.wrap(&request, |profiler| {
//!     let profiler = profiler.expect("every request is enabled by default");
//!     profiler.step("render", |_| { /* ... */ });
//!     profiler.id()
//! });
//!
//! let profile = storage.load(&request, id).unwrap().unwrap();
//! assert_eq!(profile.root.children[0].name, "render");
//! ```

mod client_timings;
mod clock;
mod error;
mod finalize;
mod handle;
mod host;
mod profiler;
mod storage;

pub use client_timings::ClientTimingsExt;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::ProfileError;
pub use handle::ProfileHandle;
pub use host::{
    EnablePredicate, MachineNameResolver, MiniProfiler, Position, RESOURCE_PATH,
    RenderOptions, RequestInfo, VERSION, hostname,
};
pub use profiler::{
    DEFAULT_TRIVIAL_DURATION_THRESHOLD_MS, Profiler, ProfilerOptions, StepGuard,
    StepHandle,
};
pub use storage::{
    FileStorage, ListOptions, ListOrder, MemoryStorage, Storage, StorageError,
};
