//! axum adapter for request profiling.
//!
//! Two pieces plug into a host application:
//!
//! - [`profile_layer`]: middleware that profiles each enabled request,
//!   exposes the live profile to handlers through the [`Profiled`]
//!   extractor, and stores the finalized profile.
//! - [`resources_router`]: the results endpoint and viewer assets under
//!   [`RESOURCE_PATH`](miniprof_core::RESOURCE_PATH).
//!
//! Pages that want the viewer embed the snippet from [`render_includes`].
//!
//! ```no_run
//! use axum::{Router, routing::get};
//! use miniprof_core::{MemoryStorage, MiniProfiler};
//! use miniprof_web::{Profiled, profile_layer, resources_router};
//!
//! let mp = MiniProfiler::new(MemoryStorage::new());
//! let app: Router = Router::new()
//!     .route("/", get(|p: Profiled| async move { p.step("hello", || "hi") }))
//!     .layer(profile_layer(mp.clone()))
//!     .merge(resources_router(mp));
//! ```

mod error;
mod html;
mod middleware;
mod results;

pub use error::WebError;
pub use html::{render_includes, render_includes_for, render_share};
pub use middleware::{IDS_HEADER, ProfileLayer, ProfileService, Profiled, profile_layer};
pub use results::resources_router;
