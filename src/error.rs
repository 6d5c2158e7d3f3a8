//! The error type shared by every deferred value in a request.

use std::{error::Error as StdError, fmt::Display, sync::Arc};

use thiserror::Error;

/// Errors produced by the executor, by loaders, and by continuations.
///
/// A rejected [`Deferred`][crate::Deferred] hands its error to every
/// continuation registered on it, so this type is `Clone`. Host errors are
/// wrapped with [`Error::failed`] or [`Error::msg`].
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A batch was ended, or a pending value forced, with no executor
    /// assigned as current.
    #[error("cannot end a batch without an executor")]
    NoExecutor,

    /// `end_batch` was called while no loader had queued keys.
    #[error("no loader has queued keys")]
    NoPendingBatch,

    /// A value was forced, but it is still pending and no loader has any
    /// work left that could settle it.
    #[error("{type_name} broken: still pending with no queued batches")]
    BrokenPromise { type_name: &'static str },

    /// A loader's `perform` returned without settling one of its keys.
    #[error("{loader} didn't fulfill promise for key {key}")]
    UnfulfilledKey {
        loader: &'static str,
        key: String,
        #[source]
        cause: Option<Box<Error>>,
    },

    /// `fulfill` or `reject` was called twice for the same key.
    #[error("{loader} already settled key {key}")]
    AlreadySettled { loader: &'static str, key: String },

    /// `fulfill` or `reject` was called for a key that was never loaded.
    #[error("{loader} was never asked for key {key}")]
    UnknownKey { loader: &'static str, key: String },

    /// The executor was cleared while the key was still waiting to be
    /// fetched.
    #[error("{loader} was cleared before key {key} was fetched")]
    Cancelled { loader: &'static str, key: String },

    /// A fetched result held more than one entry for a key, and the loader
    /// asked for duplicates to be treated as errors.
    #[error("{loader} received more than one entry for key {key}")]
    DuplicateEntry { loader: &'static str, key: String },

    #[error(transparent)]
    Failed(Arc<dyn StdError + Send + Sync>),

    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Wrap an arbitrary error so it can reject a deferred value.
    pub fn failed(err: impl StdError + Send + Sync + 'static) -> Self {
        Error::Failed(Arc::new(err))
    }

    pub fn msg(message: impl Display) -> Self {
        Error::Message(message.to_string())
    }

    /// True for the two ways a loader can break its settlement contract.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Error::BrokenPromise { .. } | Error::UnfulfilledKey { .. }
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
