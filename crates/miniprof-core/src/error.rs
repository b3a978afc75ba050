//! Error types for live instrumentation.

use std::backtrace::Backtrace;
use std::fmt;

/// Error type for step-protocol violations and misuse of a profile.
///
/// Uses the canonical struct pattern with backtrace capture and `is_xxx()`
/// helper methods. None of these errors corrupt the tree: a rejected call
/// leaves the profiler exactly as it was.
#[derive(Debug)]
pub struct ProfileError {
    kind: ProfileErrorKind,
    backtrace: Backtrace,
}

/// Internal error variants. Not exposed publicly; use `is_xxx()` methods.
#[derive(Debug)]
pub(crate) enum ProfileErrorKind {
    /// A step was closed while a step opened after it was still open.
    StepOutOfOrder {
        /// Name of the step the caller tried to close.
        step: String,
        /// Name of the step that is actually current.
        current: String,
    },
    /// The step handle was minted by a different profiler.
    ForeignStep,
    /// The step handle refers to a step that was already closed.
    StepClosed {
        /// Name of the closed step.
        step: String,
    },
    /// The profile behind a shared handle was already finalized.
    AlreadyFinalized,
}

impl ProfileError {
    /// Creates an error from an error kind, capturing a backtrace.
    pub(crate) fn new(kind: ProfileErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    /// Returns true if a step was closed before a step nested inside it.
    pub fn is_step_out_of_order(&self) -> bool {
        matches!(self.kind, ProfileErrorKind::StepOutOfOrder { .. })
    }

    /// Returns true if the step handle belongs to another profiler.
    pub fn is_foreign_step(&self) -> bool {
        matches!(self.kind, ProfileErrorKind::ForeignStep)
    }

    /// Returns true if the step was already closed.
    pub fn is_step_closed(&self) -> bool {
        matches!(self.kind, ProfileErrorKind::StepClosed { .. })
    }

    /// Returns true if the profile was already finalized.
    pub fn is_already_finalized(&self) -> bool {
        matches!(self.kind, ProfileErrorKind::AlreadyFinalized)
    }

    /// Returns the backtrace captured when this error was created.
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

impl fmt::Display for ProfileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileErrorKind::StepOutOfOrder { step, current } => write!(
                f,
                "cannot close step {step:?} while step {current:?} is still open"
            ),
            ProfileErrorKind::ForeignStep => {
                write!(f, "step handle belongs to a different profiler")
            }
            ProfileErrorKind::StepClosed { step } => {
                write!(f, "step {step:?} is already closed")
            }
            ProfileErrorKind::AlreadyFinalized => {
                write!(f, "profile has already been finalized")
            }
        }
    }
}

impl fmt::Display for ProfileError {
    /// Formats the error with a summary and captured backtrace.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.kind)?;

        // Backtrace (will be empty unless RUST_BACKTRACE is set).
        write!(f, "{}", self.backtrace)
    }
}

impl std::error::Error for ProfileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_out_of_order() {
        let err = ProfileError::new(ProfileErrorKind::StepOutOfOrder {
            step: "outer".into(),
            current: "inner".into(),
        });

        assert!(err.is_step_out_of_order());
        assert!(!err.is_foreign_step());
        assert!(!err.is_step_closed());
        assert!(!err.is_already_finalized());

        let msg = err.to_string();
        assert!(msg.contains("\"outer\""));
        assert!(msg.contains("\"inner\" is still open"));
    }

    #[test]
    fn test_foreign_step() {
        let err = ProfileError::new(ProfileErrorKind::ForeignStep);
        assert!(err.is_foreign_step());
        assert!(!err.is_step_out_of_order());
        assert!(err.to_string().contains("different profiler"));
    }

    #[test]
    fn test_step_closed() {
        let err = ProfileError::new(ProfileErrorKind::StepClosed {
            step: "db".into(),
        });
        assert!(err.is_step_closed());
        assert!(err.to_string().contains("\"db\" is already closed"));
    }

    #[test]
    fn test_already_finalized() {
        let err = ProfileError::new(ProfileErrorKind::AlreadyFinalized);
        assert!(err.is_already_finalized());
        assert!(err.to_string().contains("already been finalized"));
    }

    /// Verifies that backtraces are captured on construction.
    #[test]
    fn test_backtrace_captured() {
        let err = ProfileError::new(ProfileErrorKind::ForeignStep);
        // Content depends on RUST_BACKTRACE; only check it is reachable.
        let _ = err.backtrace();
    }

    #[test]
    fn test_debug_impl() {
        let err = ProfileError::new(ProfileErrorKind::AlreadyFinalized);
        let debug_str = format!("{err:?}");
        assert!(debug_str.contains("ProfileError"));
    }
}
