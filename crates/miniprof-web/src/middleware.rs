//! Request-wrapping middleware and the handler-side extractor.
//!
//! [`ProfileLayer`] decides per request whether to profile, puts a
//! [`ProfileHandle`] into the request extensions, runs the inner service,
//! then advertises the profile id in the `X-MiniProfiler-Ids` response
//! header, finalizes the profile and stores it on the blocking pool. The
//! profile is stored whatever the outcome: a response of any status, an
//! error from the inner service, or a handler that panics.
//!
//! Requests for the profiler's own resources are never profiled.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::extract::{FromRequestParts, Request};
use axum::response::Response;
use http::request::Parts;
use http::HeaderValue;
use miniprof_core::{MiniProfiler, ProfileHandle, RESOURCE_PATH, RequestInfo};
use miniprof_schemas::Profile;
use tower::{Layer, Service};
use tracing::{Instrument, info_span, warn};

/// Response header listing the ids of profiles produced by a request.
pub const IDS_HEADER: &str = "x-miniprofiler-ids";

/// Builds the middleware layer for `mp`.
pub fn profile_layer(mp: MiniProfiler) -> ProfileLayer {
    ProfileLayer { mp }
}

/// Tower layer that profiles every enabled request.
#[derive(Debug, Clone)]
pub struct ProfileLayer {
    mp: MiniProfiler,
}

impl<S> Layer<S> for ProfileLayer {
    type Service = ProfileService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ProfileService {
            inner,
            mp: self.mp.clone(),
        }
    }
}

/// Service produced by [`ProfileLayer`].
#[derive(Debug, Clone)]
pub struct ProfileService<S> {
    inner: S,
    mp: MiniProfiler,
}

impl<S> Service<Request> for ProfileService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        // The clone may not be ready; keep the one that was polled.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if req.uri().path().starts_with(RESOURCE_PATH) {
            return Box::pin(inner.call(req));
        }
        let info = request_info(&req);
        let Some(profiler) = self.mp.start(&info) else {
            return Box::pin(inner.call(req));
        };

        let handle = ProfileHandle::new(profiler);
        req.extensions_mut().insert(handle.clone());
        let span = info_span!("profiled_request", profile = %handle.id());
        let pending = PendingProfile {
            mp: self.mp.clone(),
            handle,
            info,
            stored: false,
        };

        Box::pin(
            async move {
                let mut result = inner.call(req).await;
                if let Ok(response) = &mut result {
                    let ids = format!("[\"{}\"]", pending.handle.id());
                    if let Ok(value) = HeaderValue::from_str(&ids) {
                        response.headers_mut().insert(IDS_HEADER, value);
                    }
                }
                pending.store().await;
                result
            }
            .instrument(span),
        )
    }
}

/// A profiled request whose profile has not been stored yet.
///
/// [`PendingProfile::store`] is the normal path, for responses and inner
/// service errors alike. If the request future is dropped first (a handler
/// panic or a cancelled connection), `Drop` finalizes and stores what was
/// recorded so far.
struct PendingProfile {
    mp: MiniProfiler,
    handle: ProfileHandle,
    info: RequestInfo,
    stored: bool,
}

impl PendingProfile {
    async fn store(mut self) {
        self.stored = true;
        let Some(profile) = self.finalize() else {
            return;
        };
        let (mp, info) = (self.mp.clone(), self.info.clone());
        let stored = tokio::task::spawn_blocking(move || mp.store(&info, &profile));
        if let Err(err) = stored.await {
            warn!(error = %err, "profile store task failed");
        }
    }

    fn finalize(&self) -> Option<Profile> {
        match self.handle.finalize(Some(&self.info)) {
            Ok(profile) => Some(profile),
            // A handler finalized it itself.
            Err(err) => {
                warn!(error = %err, "profile not stored by middleware");
                None
            }
        }
    }
}

impl Drop for PendingProfile {
    fn drop(&mut self) {
        if self.stored {
            return;
        }
        warn!(profile = %self.handle.id(), "request ended without completing");
        let Some(profile) = self.finalize() else {
            return;
        };
        let (mp, info) = (self.mp.clone(), self.info.clone());
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || mp.store(&info, &profile));
            }
            Err(_) => {
                mp.store(&info, &profile);
            }
        }
    }
}

/// Describes a request for the enable predicate and the root timing name.
///
/// Relative request URIs (the usual case behind a server) are made absolute
/// from the `Host` header.
pub(crate) fn request_info<B>(req: &http::Request<B>) -> RequestInfo {
    let uri = req.uri();
    let url = if uri.scheme().is_some() {
        uri.to_string()
    } else {
        let host = req
            .headers()
            .get(http::header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("localhost");
        let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
        format!("http://{host}{path}")
    };
    RequestInfo::new(req.method().as_str(), url)
}

/// Extractor giving handlers the current request's profile handle.
///
/// Holds `None` when the request is not being profiled.
#[derive(Debug, Clone)]
pub struct Profiled(pub Option<ProfileHandle>);

impl<S: Send + Sync> FromRequestParts<S> for Profiled {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Infallible> {
        Ok(Profiled(parts.extensions.get::<ProfileHandle>().cloned()))
    }
}

impl Profiled {
    /// Runs `f` inside a step when profiled, or just runs it.
    pub fn step<R>(&self, name: impl Into<String>, f: impl FnOnce() -> R) -> R {
        match &self.0 {
            Some(handle) => handle.step(name, f),
            None => f(),
        }
    }

    /// Awaits `future` inside a step when profiled, or just awaits it.
    pub async fn step_async<F: Future>(&self, name: impl Into<String>, future: F) -> F::Output {
        match &self.0 {
            Some(handle) => handle.step_async(name, future).await,
            None => future.await,
        }
    }
}
