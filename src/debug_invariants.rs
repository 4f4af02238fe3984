use crate::dist_error::DistError;

/// Structural self-checks for maps, plans and graphs.
pub trait DebugInvariants {
    /// Panic on a violated invariant in debug builds or when invariant
    /// checking is enabled; no-op otherwise.
    fn debug_assert_invariants(&self);
    /// Validate invariants and return the first violation.
    fn validate_invariants(&self) -> Result<(), DistError>;
}

/// Run a fallible check and panic on error when invariant checking is enabled.
#[macro_export]
macro_rules! debug_invariants {
    ($expr:expr, $($ctx:tt)*) => {
        #[cfg(any(debug_assertions, feature = "strict-invariants", feature = "check-invariants"))]
        if let Err(e) = $expr {
            panic!(concat!("[invariants] ", $($ctx)*, ": {}"), e);
        }
    };
}
