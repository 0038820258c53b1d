//! Error taxonomy.
//!
//! Every fallible operation returns [`StoreError`]. A subset of the
//! variants is fatal: once one surfaces, the engine instance deactivates
//! permanently and reports its [`FatalReason`] from then on. The rest
//! (missing records, rejected field changes, identity mismatches) are
//! ordinary outcomes the caller handles and retries at will.

use thiserror::Error;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Why an engine instance shut itself down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalReason {
    /// On-disk or in-flight data failed validation.
    Corruption,
    /// Another instance took the write lock.
    LockLost,
    /// The store was written by a newer build.
    SchemaTooNew,
    /// The storage layer itself failed.
    Substrate,
}

impl std::fmt::Display for FatalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            FatalReason::Corruption => "data corruption",
            FatalReason::LockLost => "write lock lost",
            FatalReason::SchemaTooNew => "schema newer than this build",
            FatalReason::Substrate => "storage failure",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("write lock lost to another instance")]
    LockLost,

    #[error("store schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: u32, supported: u32 },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store is closed")]
    Closed,

    #[error("card identity mismatch: stored {stored:?}, snapshot {snapshot:?}")]
    IdentityMismatch {
        stored: Option<String>,
        snapshot: Option<String>,
    },

    #[error("no {kind} with id {id}")]
    NotFound { kind: &'static str, id: u32 },

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("attempt to change immutable field {0}")]
    ImmutableField(&'static str),

    #[error("engine deactivated: {0}")]
    Deactivated(FatalReason),
}

impl StoreError {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        StoreError::Corrupt(msg.into())
    }

    /// Classifies this error as fatal or recoverable. `Deactivated` maps to
    /// `None`: the instance is already down, reporting it again must not
    /// re-trigger shutdown.
    pub fn fatal_reason(&self) -> Option<FatalReason> {
        match self {
            StoreError::Corrupt(_) => Some(FatalReason::Corruption),
            StoreError::LockLost => Some(FatalReason::LockLost),
            StoreError::SchemaTooNew { .. } => Some(FatalReason::SchemaTooNew),
            StoreError::Io(_) | StoreError::Closed => Some(FatalReason::Substrate),
            StoreError::IdentityMismatch { .. }
            | StoreError::NotFound { .. }
            | StoreError::InvalidImage(_)
            | StoreError::ImmutableField(_)
            | StoreError::Deactivated(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification_matches_taxonomy() {
        assert_eq!(
            StoreError::corrupt("x").fatal_reason(),
            Some(FatalReason::Corruption)
        );
        assert_eq!(
            StoreError::LockLost.fatal_reason(),
            Some(FatalReason::LockLost)
        );
        assert_eq!(
            StoreError::SchemaTooNew {
                found: 7,
                supported: 6
            }
            .fatal_reason(),
            Some(FatalReason::SchemaTooNew)
        );
        assert_eq!(
            StoreError::Closed.fatal_reason(),
            Some(FatalReason::Substrate)
        );

        assert_eq!(
            StoreError::NotFound {
                kind: "session",
                id: 1
            }
            .fatal_reason(),
            None
        );
        assert_eq!(StoreError::ImmutableField("rom").fatal_reason(), None);
        assert_eq!(
            StoreError::InvalidImage("short".to_string()).fatal_reason(),
            None
        );
        assert_eq!(
            StoreError::IdentityMismatch {
                stored: None,
                snapshot: None
            }
            .fatal_reason(),
            None
        );
        assert_eq!(
            StoreError::Deactivated(FatalReason::LockLost).fatal_reason(),
            None
        );
    }
}
