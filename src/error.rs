//! Error types for the test driver

use thiserror::Error;

/// Main error type for test driver operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid command line invocation
    #[error("usage error: {0}")]
    Usage(String),

    /// Malformed input data (documents, parameters, policy files)
    #[error("bad input: {0}")]
    BadInput(String),

    /// A `$apply: fixture` object had no matching fixture
    #[error("no fixture matches {0}")]
    FixtureNotFound(String),

    /// A YAML fragment did not decode to a Kubernetes object
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// Policy module compilation failed
    #[error("policy compilation failed: {0}")]
    PolicyCompile(String),

    /// A Kubernetes API request failed without a server status
    #[error("transport error: {0}")]
    Transport(String),

    /// No candidate object carried the current run ID annotation
    #[error("failed to match object with run ID {0}")]
    NoRunIdMatch(String),

    /// Informer caches did not sync within the timeout
    #[error("informer cache sync timed out")]
    CacheSyncTimeout,

    /// A store path traversal hit a non-mapping intermediate element
    #[error("store conflict at {0}: element is not a mapping")]
    StoreConflict(String),

    /// A store path does not exist
    #[error("store path {0} not found")]
    StoreNotFound(String),

    /// Two policy modules share a name
    #[error("duplicate policy module {0:?}")]
    DuplicateModule(String),

    /// An object cannot be adopted without a server-assigned UID
    #[error("no object UID")]
    MissingUid,

    /// Teardown left objects behind; causes are chained
    #[error("failed to delete all objects")]
    PartialCleanup {
        /// The individual deletion failures, in the order they occurred.
        causes: Vec<Error>,
    },

    /// Recorder documents and steps were opened or closed out of order
    #[error("recorder misuse: {0}")]
    RecorderMisuse(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a usage error with the given message
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    /// Create a bad input error with the given message
    pub fn bad_input(msg: impl Into<String>) -> Self {
        Self::BadInput(msg.into())
    }

    /// Create a transport error with the given message
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Walk this error and every cause reachable from it, one at a time.
    ///
    /// `PartialCleanup` contributes each of its chained causes; other
    /// variants contribute their `source()` chain.
    pub fn chain(&self) -> Chain<'_> {
        Chain {
            queue: vec![self as &(dyn std::error::Error + 'static)],
        }
    }

    /// The process exit code for this error when it reaches `main`.
    ///
    /// Follows the sysexits conventions: 65 for usage or data errors,
    /// 66 for missing input files, 1 for everything else.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Usage(_) => 65,
            Error::BadInput(_) | Error::PolicyCompile(_) | Error::DuplicateModule(_) => 65,
            Error::Io(err) if err.kind() == std::io::ErrorKind::NotFound => 66,
            _ => 1,
        }
    }
}

/// Iterator over an error and its transitive causes.
///
/// Traversal is depth-first: a `PartialCleanup` error yields itself, then
/// each cause (and that cause's own sources) in order.
pub struct Chain<'a> {
    queue: Vec<&'a (dyn std::error::Error + 'static)>,
}

impl<'a> Iterator for Chain<'a> {
    type Item = &'a (dyn std::error::Error + 'static);

    fn next(&mut self) -> Option<Self::Item> {
        let err = self.queue.pop()?;

        // Push children in reverse so iteration stays in declaration order.
        if let Some(Error::PartialCleanup { causes }) = err.downcast_ref::<Error>() {
            for cause in causes.iter().rev() {
                self.queue.push(cause as &(dyn std::error::Error + 'static));
            }
        }

        if let Some(source) = err.source() {
            self.queue.push(source);
        }

        Some(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: teardown failures keep every cause reachable
    ///
    /// When DeleteAll cannot remove every object, the per-object failures
    /// are chained into a single error that reporting code can traverse
    /// one cause at a time.
    #[test]
    fn story_partial_cleanup_chains_every_cause() {
        let err = Error::PartialCleanup {
            causes: vec![Error::transport("connection refused"), Error::MissingUid],
        };

        let messages: Vec<String> = err.chain().map(|e| e.to_string()).collect();

        assert_eq!(messages[0], "failed to delete all objects");
        assert!(messages.iter().any(|m| m.contains("connection refused")));
        assert!(messages.iter().any(|m| m.contains("no object UID")));
    }

    /// Story: chain traversal matches causes by type identity
    #[test]
    fn story_chain_supports_typed_matching() {
        let err = Error::PartialCleanup {
            causes: vec![Error::MissingUid],
        };

        let found = err
            .chain()
            .filter_map(|e| e.downcast_ref::<Error>())
            .any(|e| matches!(e, Error::MissingUid));

        assert!(found);
    }

    #[test]
    fn exit_codes_follow_sysexits() {
        assert_eq!(Error::usage("no test file(s)").exit_code(), 65);
        assert_eq!(Error::bad_input("missing value").exit_code(), 65);
        assert_eq!(Error::PolicyCompile("boom".into()).exit_code(), 65);
        assert_eq!(
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such file"
            ))
            .exit_code(),
            66
        );
        assert_eq!(Error::CacheSyncTimeout.exit_code(), 1);
    }

    #[test]
    fn error_construction_accepts_str_and_string() {
        let err = Error::bad_input(format!("missing value for parameter {:?}", "key"));
        assert!(err.to_string().contains("key"));

        let err = Error::transport("static message");
        assert!(err.to_string().contains("static message"));
    }
}
