use std::fmt;
use std::time::Duration;

use kiln_build::executionservice::ExecutionError;
use kiln_castore::merge::MergeError;

/// Errors found while compiling a [crate::RuleGraph]. These are fatal, the
/// engine can't be used with such a set of rules.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("{product} is ambiguous with params ({params}), candidates: {}", .candidates.join(", "))]
    Ambiguous {
        product: String,
        params: String,
        candidates: Vec<String>,
    },

    #[error("{requester} needs a {product}, which can't be produced from params ({params})")]
    MissingDependency {
        requester: String,
        product: String,
        params: String,
    },

    #[error("rule {rule} depends on itself with params ({params})")]
    Cyclic { rule: String, params: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureKind {
    /// Raised by a rule body.
    #[error("{0}")]
    Rule(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("dependency cycle through {0}")]
    Cycle(String),

    #[error("cancelled")]
    Cancelled,

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("i/o error: {0}")]
    Io(String),
}

/// A failed computation, along with the chain of nodes it travelled
/// through. `trace[0]` is where it happened, the last frame is the node that
/// was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub trace: Vec<String>,
}

impl Failure {
    pub fn new(kind: FailureKind) -> Self {
        Self {
            kind,
            trace: vec![],
        }
    }

    /// A failure raised by a rule body.
    pub fn rule(msg: impl Into<String>) -> Self {
        Self::new(FailureKind::Rule(msg.into()))
    }

    pub(crate) fn with_frame(mut self, frame: String) -> Self {
        self.trace.push(frame);
        self
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for frame in &self.trace {
            write!(f, "\n  in {}", frame)?;
        }
        Ok(())
    }
}

impl std::error::Error for Failure {}

impl From<ExecutionError> for Failure {
    fn from(value: ExecutionError) -> Self {
        match value {
            ExecutionError::Timeout(after) => Self::new(FailureKind::Timeout(after)),
            e => Self::new(FailureKind::Execution(e.to_string())),
        }
    }
}

impl From<MergeError> for Failure {
    fn from(value: MergeError) -> Self {
        match value {
            MergeError::Conflict { .. } => Self::new(FailureKind::Conflict(value.to_string())),
            MergeError::NotFound(_) => Self::new(FailureKind::NotFound(value.to_string())),
            MergeError::Store(e) => e.into(),
        }
    }
}

impl From<kiln_castore::Error> for Failure {
    fn from(value: kiln_castore::Error) -> Self {
        match value {
            kiln_castore::Error::NotFound(digest) => {
                Self::new(FailureKind::NotFound(digest.to_string()))
            }
            e => Self::new(FailureKind::Io(e.to_string())),
        }
    }
}

impl From<std::io::Error> for Failure {
    fn from(value: std::io::Error) -> Self {
        Self::new(FailureKind::Io(value.to_string()))
    }
}

/// Errors returned for top-level requests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("no query for {product} with params ({params}) was compiled")]
    NoSuchQuery { product: String, params: String },

    #[error("{0}")]
    Failed(#[from] Failure),
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use kiln_build::executionservice::ExecutionError;
    use kiln_castore::merge::MergeError;

    use super::{Failure, FailureKind};

    #[test]
    fn trace_renders_innermost_first() {
        let failure = Failure::rule("boom")
            .with_frame("rule a(X(3))".into())
            .with_frame("rule b(X(3))".into());
        assert_eq!(
            "boom\n  in rule a(X(3))\n  in rule b(X(3))",
            failure.to_string()
        );
    }

    #[test]
    fn conversions() {
        assert_eq!(
            FailureKind::Timeout(Duration::from_secs(1)),
            Failure::from(ExecutionError::Timeout(Duration::from_secs(1))).kind
        );
        assert!(matches!(
            Failure::from(MergeError::Conflict {
                path: PathBuf::from("a/b.txt"),
                first: "file".into(),
                second: "file".into()
            })
            .kind,
            FailureKind::Conflict(_)
        ));
    }
}
