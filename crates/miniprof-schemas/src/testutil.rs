//! Shared proptest strategies for schema tests.

use chrono::{DateTime, Utc};
use proptest::prelude::*;
use uuid::Uuid;

/// Strategy for generating arbitrary step, command and category names.
pub fn arb_name() -> impl Strategy<Value = String> {
    "[a-zA-Z_][a-zA-Z0-9_ ./]{0,19}"
}

/// Strategy for generating finite, non-negative millisecond values.
pub fn arb_millis() -> impl Strategy<Value = f64> {
    0.0..100_000.0f64
}

/// Strategy for generating ids. Random bytes are enough; the version bits
/// do not matter for encoding.
pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
    any::<u128>().prop_map(Uuid::from_u128)
}

/// Strategy for generating start times at whole-millisecond precision.
pub fn arb_started() -> impl Strategy<Value = DateTime<Utc>> {
    (0..4_102_444_800_000i64).prop_map(|millis| {
        DateTime::from_timestamp_millis(millis).unwrap_or_default()
    })
}
