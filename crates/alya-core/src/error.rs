//! Error taxonomy.
//!
//! Domain-significant failures are typed sentinel errors so callers can
//! match them with `anyhow::Error::is::<T>()` / `downcast_ref` after they
//! have travelled through the adapter seams.

use thiserror::Error;

use crate::types::{BatchStatus, ErrorMessage};

/// Error code attached to every configuration-scoped row failure.
pub const ERRCODE_CONFIG: &str = "configerror";
/// Error code attached to per-row processing failures.
pub const ERRCODE_PROCESSING: &str = "processing_error";

pub const MSGID_PROCESSOR_NOT_FOUND: i32 = 101;
pub const MSGID_WRONG_PROCESSOR_KIND: i32 = 102;
pub const MSGID_INITIALIZER_NOT_FOUND: i32 = 103;
pub const MSGID_INIT_FAILED: i32 = 104;
pub const MSGID_PROCESSING_ERROR: i32 = 106;

/// A problem with the deployment, not with the data: missing or mismatched
/// processor registrations, or a failing initializer. These widen to every
/// still-nonterminal row of the affected scope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("no processor registered for app {app} op {op}")]
    ProcessorNotFound { app: String, op: String },

    #[error("processor registered for app {app} op {op} does not handle {expected} rows")]
    WrongProcessorKind {
        app: String,
        op: String,
        expected: &'static str,
    },

    #[error("no initializer registered for app {app}")]
    InitializerNotFound { app: String },

    #[error("initializer for app {app} failed: {reason}")]
    InitFailed { app: String, reason: String },
}

impl ConfigurationError {
    pub fn msgid(&self) -> i32 {
        match self {
            ConfigurationError::ProcessorNotFound { .. } => MSGID_PROCESSOR_NOT_FOUND,
            ConfigurationError::WrongProcessorKind { .. } => MSGID_WRONG_PROCESSOR_KIND,
            ConfigurationError::InitializerNotFound { .. } => MSGID_INITIALIZER_NOT_FOUND,
            ConfigurationError::InitFailed { .. } => MSGID_INIT_FAILED,
        }
    }

    /// Initializer problems affect every op of the app; the rest are scoped
    /// to one `(app, op)` pair.
    pub fn is_app_scoped(&self) -> bool {
        matches!(
            self,
            ConfigurationError::InitializerNotFound { .. } | ConfigurationError::InitFailed { .. }
        )
    }

    pub fn to_message(&self) -> ErrorMessage {
        ErrorMessage::new(self.msgid(), ERRCODE_CONFIG).with_vals(vec![self.to_string()])
    }
}

/// Non-fatal summarization outcomes that warrant a retry with a fresh
/// transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SummarizeError {
    #[error("batch advisory lock not acquired")]
    LockNotAcquired,

    /// The transaction's snapshot still saw rows in `inprog`; a later
    /// snapshot may not.
    #[error("batch still has rows in progress")]
    PendingRows,
}

/// Duplicate registrations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("initializer already registered for app {0}")]
    InitializerRegistered(String),

    #[error("processor already registered for app {app} op {op}")]
    ProcessorRegistered { app: String, op: String },
}

/// Client-facing lifecycle violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("batch {0} not found")]
    BatchNotFound(String),

    #[error("batch {id} is {status}, expected wait")]
    NotWaiting { id: String, status: BatchStatus },

    #[error("batch {id} is already terminal ({status})")]
    AlreadyTerminal { id: String, status: BatchStatus },

    #[error("batch {0} has no pending rows to abort")]
    NothingToAbort(String),

    #[error("appended rows must use line >= 1, got {0}")]
    InvalidLine(i32),

    #[error("duplicate line {0} in submission")]
    DuplicateLine(i32),
}
