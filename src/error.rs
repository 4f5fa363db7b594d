use std::fmt;

use crate::EventType;

/// Error type returned by this crate.
///
/// Every variant describes a programming error raised synchronously by the
/// call that broke the contract. Transport failures are never returned here;
/// they are dispatched to the configured `error` handler instead.
#[derive(Debug, thiserror::Error)]
pub enum WrapperError {
    /// A required argument was absent or empty.
    #[error("{0} is a required parameter")]
    MissingArgument(&'static str),
    /// An argument or configuration value has the wrong shape.
    #[error("invalid value for {field}: expected {expected}")]
    InvalidArgumentType {
        /// Name of the argument or configuration field.
        field: String,
        /// Human readable description of the accepted values.
        expected: &'static str,
    },
    /// A configuration key outside the recognized field set.
    #[error(
        "{field} is not a config attribute; accepted config attributes: {}",
        .accepted.join(", ")
    )]
    UnknownConfigField {
        /// The rejected key.
        field: String,
        /// Every recognized configuration field name.
        accepted: Vec<&'static str>,
    },
    /// A handler key outside the recognized event name set.
    #[error(
        "invalid handler type: {event}; available handlers: {}",
        .available.join(", ")
    )]
    UnknownHandlerType {
        /// The rejected event name.
        event: String,
        /// Every recognized event name.
        available: Vec<&'static str>,
    },
    /// The timing policy of the resulting configuration is inconsistent.
    #[error("policy violation: {0}")]
    PolicyViolation(PolicyViolation),
    /// The default handler provider could not resolve a handler.
    #[error("no default handler resolvable for '{0}' events")]
    MissingDefaultHandler(EventType),
    /// An operation was called in a state that does not allow it.
    #[error("precondition violated: {0}")]
    PreconditionViolation(&'static str),
}

/// Timing and immutability rules enforced by `configure`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PolicyViolation {
    /// A nonzero timeout below one second.
    TimeoutBelowMinimum,
    /// More than one attempt with a retry interval below one second.
    IntervalBelowMinimum,
    /// A nonzero timeout on a synchronous request.
    TimeoutRequiresAsync,
    /// An attempt to change the request target after construction.
    ImmutableTarget,
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::TimeoutBelowMinimum => "timeout must be at least 1 second when enabled",
            Self::IntervalBelowMinimum => {
                "attemptInterval must be at least 1 second when retrying on timeout"
            }
            Self::TimeoutRequiresAsync => "synchronous requests cannot use a timeout",
            Self::ImmutableTarget => "the request URI cannot change after construction",
        };
        f.write_str(message)
    }
}

impl From<PolicyViolation> for WrapperError {
    fn from(violation: PolicyViolation) -> Self {
        Self::PolicyViolation(violation)
    }
}
