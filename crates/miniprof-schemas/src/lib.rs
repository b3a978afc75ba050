//! Schema definitions for the miniprof exchange format.
//!
//! This crate contains the data structures that a finalized request profile
//! is encoded to and decoded from. The JSON shape (PascalCase field names,
//! `"/Date(ms)/"` timestamps, integer execute types) is consumed by the
//! browser-side viewer and by persistence adapters, so it is treated as a
//! stable contract: renaming a field is a breaking change.
//!
//! The schemas are designed to be:
//! - **Tree-shaped**: a `Profile` owns its `Root` timing and every timing owns
//!   its `Children`. Parent linkage is carried as `ParentTimingId` only.
//! - **Deterministic**: all maps are ordered, so encoding the same profile
//!   twice (or a decoded copy) yields identical bytes.
//! - **Compact**: empty collections and absent optionals are omitted rather
//!   than written as `null`.
//!
//! Live instrumentation state (cursor, clocks) does not live here; see
//! `miniprof-core`.

mod profile;
pub mod serde_date;
#[cfg(test)]
mod testutil;
mod timing;

#[doc(inline)]
pub use profile::*;
#[doc(inline)]
pub use timing::*;
