//! Pseudo-coverage derived from what the target answers.
//!
//! The target is a black box, so "new coverage" is approximated by a coarse
//! behavioral [`Signature`]: the status, a size bucket, and a class of error
//! text. Two outcomes with the same signature count as the same behavior.
//! The approximation is lossy on purpose; exact sizes or exact error text
//! would make nearly every response look new.

use crate::executor::{Outcome, ResponseStatus};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

/// Substrings that mark a stack trace or exception dump.
const STACK_TRACE_PATTERNS: [&str; 6] = [
    "traceback",
    "stack trace",
    "stacktrace",
    "exception",
    "panicked at",
    "\n    at ",
];

/// Substrings of a bare, uninformative server failure page.
const GENERIC_500_PATTERNS: [&str; 4] = [
    "internal server error",
    "server error",
    "service unavailable",
    "bad gateway",
];

/// Substrings of an input-validation complaint.
const VALIDATION_PATTERNS: [&str; 9] = [
    "invalid",
    "validation",
    "required",
    "missing",
    "must be",
    "expected",
    "bad request",
    "malformed",
    "not allowed",
];

/// Coarse response-size ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum SizeBucket {
    Empty,
    /// 1 to 99 bytes.
    Tiny,
    /// 100 to 999 bytes.
    Small,
    /// 1000 to 9999 bytes.
    Medium,
    /// 10000 bytes and more.
    Large,
}

impl SizeBucket {
    pub fn of(size: usize) -> Self {
        match size {
            0 => SizeBucket::Empty,
            1..=99 => SizeBucket::Tiny,
            100..=999 => SizeBucket::Small,
            1000..=9999 => SizeBucket::Medium,
            _ => SizeBucket::Large,
        }
    }
}

/// Heuristic class of the error text captured from a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ErrorClass {
    StackTrace,
    Generic500,
    Validation,
    /// Error text was captured but matched no known pattern.
    Other,
    None,
}

impl ErrorClass {
    pub fn of(error_text: Option<&str>) -> Self {
        let Some(text) = error_text else {
            return ErrorClass::None;
        };
        let lowered = text.to_ascii_lowercase();
        let matches_any = |patterns: &[&str]| patterns.iter().any(|p| lowered.contains(p));
        if matches_any(&STACK_TRACE_PATTERNS[..]) {
            ErrorClass::StackTrace
        } else if matches_any(&GENERIC_500_PATTERNS[..]) {
            ErrorClass::Generic500
        } else if matches_any(&VALIDATION_PATTERNS[..]) {
            ErrorClass::Validation
        } else if lowered.trim().is_empty() {
            ErrorClass::None
        } else {
            ErrorClass::Other
        }
    }
}

/// Status part of a signature: the code verbatim or a failure marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum StatusClass {
    Code(u16),
    Timeout,
    ConnectionError,
}

impl From<ResponseStatus> for StatusClass {
    fn from(status: ResponseStatus) -> Self {
        match status {
            ResponseStatus::Http(code) => StatusClass::Code(code),
            ResponseStatus::Timeout => StatusClass::Timeout,
            ResponseStatus::ConnectionError => StatusClass::ConnectionError,
        }
    }
}

/// Behavioral fingerprint of one outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Signature {
    pub status: StatusClass,
    pub size_bucket: SizeBucket,
    pub error_class: ErrorClass,
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            StatusClass::Code(code) => write!(f, "{code}")?,
            StatusClass::Timeout => write!(f, "timeout")?,
            StatusClass::ConnectionError => write!(f, "conn-error")?,
        }
        write!(f, "/{:?}/{:?}", self.size_bucket, self.error_class)
    }
}

pub fn signature_of(outcome: &Outcome) -> Signature {
    Signature {
        status: outcome.status.into(),
        size_bucket: SizeBucket::of(outcome.response_size),
        error_class: ErrorClass::of(outcome.error_text.as_deref()),
    }
}

/// True iff `signature` has not been recorded in this run.
pub fn is_novel(signature: &Signature, seen: &HashSet<Signature>) -> bool {
    !seen.contains(signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ok(size: usize) -> Outcome {
        Outcome::http(200, size, Duration::from_millis(3))
    }

    #[test]
    fn sizes_fall_into_coarse_buckets() {
        assert_eq!(SizeBucket::of(0), SizeBucket::Empty);
        assert_eq!(SizeBucket::of(1), SizeBucket::Tiny);
        assert_eq!(SizeBucket::of(99), SizeBucket::Tiny);
        assert_eq!(SizeBucket::of(100), SizeBucket::Small);
        assert_eq!(SizeBucket::of(999), SizeBucket::Small);
        assert_eq!(SizeBucket::of(1000), SizeBucket::Medium);
        assert_eq!(SizeBucket::of(9999), SizeBucket::Medium);
        assert_eq!(SizeBucket::of(10_000), SizeBucket::Large);
    }

    #[test]
    fn byte_level_noise_does_not_change_the_signature() {
        assert_eq!(signature_of(&ok(120)), signature_of(&ok(180)));
        assert_ne!(signature_of(&ok(80)), signature_of(&ok(180)));
    }

    #[test]
    fn error_text_is_classified_by_pattern() {
        assert_eq!(ErrorClass::of(None), ErrorClass::None);
        assert_eq!(
            ErrorClass::of(Some("Traceback (most recent call last):\n  File \"app.py\"")),
            ErrorClass::StackTrace
        );
        assert_eq!(
            ErrorClass::of(Some("<h1>Internal Server Error</h1>")),
            ErrorClass::Generic500
        );
        assert_eq!(
            ErrorClass::of(Some("{\"msg\": \"field 'a' is required\"}")),
            ErrorClass::Validation
        );
        assert_eq!(ErrorClass::of(Some("nope")), ErrorClass::Other);
    }

    #[test]
    fn failures_keep_their_marker_in_the_signature() {
        let timeout = signature_of(&Outcome::timeout(Duration::from_millis(50)));
        assert_eq!(timeout.status, StatusClass::Timeout);
        assert_eq!(timeout.size_bucket, SizeBucket::Empty);
        assert_eq!(timeout.error_class, ErrorClass::None);

        let refused = signature_of(&Outcome::connection_error(
            Duration::from_millis(1),
            "connection refused",
        ));
        assert_eq!(refused.status, StatusClass::ConnectionError);
        assert_ne!(timeout, refused);
    }

    #[test]
    fn novelty_is_membership_in_the_seen_set() {
        let mut seen = HashSet::new();
        let ok_sig = signature_of(&ok(10));
        let err_sig = signature_of(
            &Outcome::http(500, 30, Duration::ZERO).with_error_text("Internal Server Error"),
        );
        assert!(is_novel(&ok_sig, &seen));
        seen.insert(ok_sig);
        assert!(!is_novel(&ok_sig, &seen));
        assert!(is_novel(&err_sig, &seen));
    }

    #[test]
    fn signature_display_is_compact() {
        let sig = signature_of(&ok(10));
        assert_eq!(sig.to_string(), "200/Tiny/None");
    }
}
