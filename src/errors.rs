use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Errors that can abort a pipeline run. Each variant maps to one of the
/// documented exit codes, so callers can rely on the process status.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The user declined the plan, or the cancellation token fired.
    #[error("aborted")]
    Aborted,

    /// The user asked for something the tool cannot do with the given input.
    #[error("{0}")]
    Usage(String),

    /// Chunk arithmetic or a partition invariant failed. This is a bug, not
    /// a property of the repository.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// A syntax error in a touched file, surfaced only when
    /// `failOnSyntaxErrors` is set.
    #[error("syntax error in {path}")]
    Syntax { path: String },

    /// The model capability failed after all retries were spent and no
    /// fallback could take over.
    #[error("model provider failed: {0}")]
    Model(String),

    /// The destination ref moved underneath us between start and finalize.
    #[error("ref {0} was updated concurrently")]
    RefConflict(String),

    #[error(transparent)]
    Gateway(#[from] git2::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Aborted | Error::Usage(_) | Error::Syntax { .. } => 1,
            Error::Invariant(_) => 2,
            Error::Gateway(_) | Error::Io(_) => 3,
            Error::Model(_) => 4,
            Error::RefConflict(_) => 5,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Cooperative cancellation shared between the Ctrl-C handler and the
/// pipeline stages. Stages poll it at their boundaries and inside
/// per-file/per-request loops.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Bail out with `Error::Aborted` if the token has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Aborted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(Error::Aborted.exit_code(), 1);
        assert_eq!(Error::Invariant("x".into()).exit_code(), 2);
        assert_eq!(
            Error::Gateway(git2::Error::from_str("io")).exit_code(),
            3
        );
        assert_eq!(Error::Model("x".into()).exit_code(), 4);
        assert_eq!(Error::RefConflict("refs/heads/main".into()).exit_code(), 5);
    }

    #[test]
    fn token_trips_once_cancelled() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(matches!(token.check(), Err(Error::Aborted)));
    }
}
