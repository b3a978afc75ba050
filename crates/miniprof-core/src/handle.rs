//! Shared access to one request's profiler.
//!
//! Async hosts hand the profiler to code that runs on several tasks of the
//! same request. [`ProfileHandle`] serializes that access behind a mutex and
//! makes finalization one-shot: the first `finalize` takes the profiler out,
//! later calls fail with [`ProfileError::is_already_finalized`] and every
//! other operation becomes a no-op.
//!
//! Steps opened from concurrent tasks still share one cursor. The tree stays
//! consistent because out-of-order closes are rejected, but which parent a
//! step lands under then depends on scheduling.
//!
//! A panic inside [`ProfileHandle::with`] does not disable the handle: the
//! poisoned lock is recovered and the profile, with whatever the panicking
//! closure left behind, can still be finalized.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use miniprof_schemas::{CustomTiming, Profile, SqlTiming};
use tracing::warn;
use uuid::Uuid;

use crate::error::{ProfileError, ProfileErrorKind};
use crate::host::RequestInfo;
use crate::profiler::{Profiler, StepHandle};

/// Cloneable, thread-safe handle to a live profiler.
#[derive(Debug, Clone)]
pub struct ProfileHandle {
    id: Uuid,
    inner: Arc<Mutex<Option<Profiler>>>,
}

impl ProfileHandle {
    pub fn new(profiler: Profiler) -> Self {
        Self {
            id: profiler.id(),
            inner: Arc::new(Mutex::new(Some(profiler))),
        }
    }

    /// Id of the profile, available even after finalization.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether the profile has been finalized.
    pub fn is_finalized(&self) -> bool {
        self.lock().is_none()
    }

    /// Runs `f` with exclusive access to the profiler.
    ///
    /// `f` must not call back into this handle.
    pub fn with<R>(&self, f: impl FnOnce(&mut Profiler) -> R) -> Result<R, ProfileError> {
        let mut guard = self.lock();
        match guard.as_mut() {
            Some(profiler) => Ok(f(profiler)),
            None => Err(ProfileError::new(ProfileErrorKind::AlreadyFinalized)),
        }
    }

    /// Opens a step. See [`Profiler::begin_step`].
    pub fn begin_step(&self, name: impl Into<String>) -> Result<StepHandle, ProfileError> {
        self.with(|p| p.begin_step(name))
    }

    /// Closes a step. See [`Profiler::end_step`].
    pub fn end_step(&self, step: &StepHandle) -> Result<f64, ProfileError> {
        self.with(|p| p.end_step(step))?
    }

    /// Runs `f` inside a step, without holding the lock while it runs.
    ///
    /// Profiling problems are logged; `f` always runs.
    pub fn step<R>(&self, name: impl Into<String>, f: impl FnOnce() -> R) -> R {
        let step = self.begin_step(name).ok();
        let result = f();
        if let Some(step) = step {
            self.close_logged(&step);
        }
        result
    }

    /// Awaits `future` inside a step.
    ///
    /// Profiling problems are logged; the future always runs.
    pub async fn step_async<F: Future>(&self, name: impl Into<String>, future: F) -> F::Output {
        let step = self.begin_step(name).ok();
        let output = future.await;
        if let Some(step) = step {
            self.close_logged(&step);
        }
        output
    }

    fn lock(&self) -> MutexGuard<'_, Option<Profiler>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close_logged(&self, step: &StepHandle) {
        match self.end_step(step) {
            Ok(_) => {}
            // Finalization already closed it.
            Err(err) if err.is_already_finalized() => {}
            Err(err) => warn!(profile = %self.id, error = %err, "could not close step"),
        }
    }

    /// Attaches a SQL-style record to the current node, if still live.
    pub fn add_sql_timing(&self, sql: SqlTiming) {
        let _ = self.with(|p| p.add_sql_timing(sql));
    }

    /// Attaches a custom timing to the current node, if still live.
    pub fn add_custom_timing(&self, category: impl Into<String>, custom: CustomTiming) {
        let _ = self.with(|p| p.add_custom_timing(category, custom));
    }

    /// Annotates the current node, if still live.
    pub fn add_key_value(&self, key: impl Into<String>, value: impl Into<String>) {
        let _ = self.with(|p| p.add_key_value(key, value));
    }

    /// Finalizes the profile. Only the first call succeeds.
    pub fn finalize(&self, request: Option<&RequestInfo>) -> Result<Profile, ProfileError> {
        let profiler = self
            .lock()
            .take()
            .ok_or_else(|| ProfileError::new(ProfileErrorKind::AlreadyFinalized))?;
        Ok(profiler.finalize(request))
    }
}

impl From<Profiler> for ProfileHandle {
    fn from(profiler: Profiler) -> Self {
        Self::new(profiler)
    }
}
