//! Error taxonomy shared by every reconciler component.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How the control loop reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Authoritative absence.
    NotFound,
    /// Retried with backoff, never escalated automatically.
    Transient,
    /// Malformed data written by someone else; retried, never repaired.
    DataCorruption,
    /// Needs operator intervention; not retried with the same credentials.
    Fatal,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("corrupt token metadata (accessor {accessor}): {reason}")]
    DataCorruption { accessor: String, reason: String },

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("{failed} of {attempted} mesh operations failed; first: {first}")]
    Incomplete { failed: usize, attempted: usize, first: Box<Error> },

    #[error("config: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn transient(msg: impl Into<String>) -> Self { Self::Transient(msg.into()) }

    pub fn protocol(msg: impl Into<String>) -> Self { Self::Protocol(msg.into()) }

    pub fn not_found(msg: impl Into<String>) -> Self { Self::NotFound(msg.into()) }

    pub fn permission_denied(msg: impl Into<String>) -> Self { Self::PermissionDenied(msg.into()) }

    pub fn config(msg: impl Into<String>) -> Self { Self::Config(msg.into()) }

    /// Wrap with a description of the key or token being worked on.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context { context: context.into(), source: Box::new(self) }
    }

    /// Innermost error after peeling `Context` layers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self.root() {
            Error::NotFound(_) => ErrorClass::NotFound,
            Error::PermissionDenied(_) | Error::Config(_) => ErrorClass::Fatal,
            Error::DataCorruption { .. } => ErrorClass::DataCorruption,
            Error::Incomplete { first, .. } if first.is_fatal() => ErrorClass::Fatal,
            _ => ErrorClass::Transient,
        }
    }

    pub fn is_fatal(&self) -> bool { self.class() == ErrorClass::Fatal }

    /// Fold the failures of a batch of independent operations into one error.
    /// A fatal failure is reported first; a lone failure is returned as is.
    pub fn incomplete(mut failures: Vec<Error>, attempted: usize) -> Option<Error> {
        if failures.is_empty() {
            return None;
        }
        if attempted <= 1 && failures.len() == 1 {
            return failures.pop();
        }
        let failed = failures.len();
        let idx = failures.iter().position(Error::is_fatal).unwrap_or(0);
        let first = failures.swap_remove(idx);
        Some(Error::Incomplete { failed, attempted, first: Box::new(first) })
    }

    pub fn is_not_found(&self) -> bool { self.class() == ErrorClass::NotFound }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_the_class_of_the_wrapped_error() {
        let err = Error::permission_denied("403 from mesh").context("revoking token abc");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("revoking token abc"));
        assert!(err.to_string().contains("403 from mesh"));

        let err = Error::not_found("pod ns/a").context("fetching workload");
        assert_eq!(err.class(), ErrorClass::NotFound);
    }

    #[test]
    fn corruption_and_protocol_errors_are_retried_not_fatal() {
        let corrupt = Error::DataCorruption { accessor: "a1".into(), reason: "no json".into() };
        assert_eq!(corrupt.class(), ErrorClass::DataCorruption);
        assert!(!corrupt.is_fatal());
        assert_eq!(Error::protocol("bad body").class(), ErrorClass::Transient);
        assert_eq!(Error::transient("timeout").class(), ErrorClass::Transient);
    }

    #[test]
    fn incomplete_pass_escalates_only_when_first_failure_is_fatal() {
        let soft = Error::Incomplete { failed: 2, attempted: 5, first: Box::new(Error::transient("reset")) };
        assert_eq!(soft.class(), ErrorClass::Transient);
        let hard = Error::Incomplete { failed: 1, attempted: 1, first: Box::new(Error::permission_denied("acl")) };
        assert!(hard.is_fatal());
    }

    #[test]
    fn incomplete_prefers_a_fatal_failure() {
        assert!(Error::incomplete(Vec::new(), 3).is_none());
        let lone = Error::incomplete(vec![Error::not_found("x")], 1).unwrap();
        assert!(lone.is_not_found());
        let mixed = Error::incomplete(vec![Error::transient("a"), Error::permission_denied("b")], 4).unwrap();
        assert!(mixed.is_fatal());
        assert!(matches!(mixed, Error::Incomplete { failed: 2, attempted: 4, .. }));
    }
}
