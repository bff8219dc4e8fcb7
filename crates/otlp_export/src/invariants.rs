//! Debug assertion macros for export pipeline invariants.
//!
//! Only active in debug builds, so release builds pay nothing for them.

// =============================================================================
// Identifier width
// =============================================================================

/// Assert that a derived identifier is exactly `width` lower-case hex digits.
///
/// Used in: `ids::fixed_width_hex()`
macro_rules! debug_assert_fixed_width {
    ($hex:expr, $width:expr) => {
        debug_assert!(
            $hex.len() == $width && $hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)),
            "derived identifier {:?} is not {} lower-case hex digits",
            $hex,
            $width
        )
    };
}

// =============================================================================
// Circuit breaker transitions
// =============================================================================

/// Assert that a breaker transition is one of the four legal edges:
/// Closed→Open, Open→HalfOpen, HalfOpen→Closed, HalfOpen→Open.
///
/// Used in: `CircuitBreaker::transition()`
macro_rules! debug_assert_legal_transition {
    ($from:expr, $to:expr) => {
        debug_assert!(
            matches!(
                ($from, $to),
                (CircuitState::Closed, CircuitState::Open)
                    | (CircuitState::Open, CircuitState::HalfOpen)
                    | (CircuitState::HalfOpen, CircuitState::Closed)
                    | (CircuitState::HalfOpen, CircuitState::Open)
            ),
            "illegal circuit breaker transition {:?} -> {:?}",
            $from,
            $to
        )
    };
}

/// Assert that the half-open probe count never exceeds its limit.
///
/// Used in: `CircuitBreaker::try_acquire()`
macro_rules! debug_assert_probe_bound {
    ($probes:expr, $max:expr) => {
        debug_assert!(
            $probes <= $max,
            "half-open probes {} exceed limit {}",
            $probes,
            $max
        )
    };
}

// =============================================================================
// Batch flush
// =============================================================================

/// Assert that a detached flush left the pending list empty.
///
/// Used in: `ExportBatch::take_pending()`
macro_rules! debug_assert_detached {
    ($pending:expr) => {
        debug_assert!(
            $pending.is_empty(),
            "pending list still holds {} spans after detaching a flush",
            $pending.len()
        )
    };
}
