use thiserror::Error;

use crate::object::{ObjectId, Property};

pub type Result<T> = std::result::Result<T, KmsError>;

/// Unified error type for transaction, commit and command-buffer operations.
///
/// Validation errors are reported from `check()` before any hardware is touched. [`TryAgain`] and
/// [`Busy`] are retryable and kept distinct from validation failures so callers can resubmit
/// (for example as a blocking commit) without treating the configuration as illegal.
///
/// [`TryAgain`]: KmsError::TryAgain
/// [`Busy`]: KmsError::Busy
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KmsError {
    #[error("unknown object {0:?}")]
    NotFound(ObjectId),

    #[error("unknown framebuffer {0}")]
    UnknownFramebuffer(u32),

    #[error("property {property:?} is not defined on {object:?}")]
    UnknownProperty { object: ObjectId, property: Property },

    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    #[error("value out of range: {0}")]
    Range(&'static str),

    #[error("no space: {0}")]
    NoSpace(&'static str),

    #[error("bandwidth {required} MB/s exceeds max available {available} MB/s ({active_planes} active planes)")]
    Bandwidth {
        required: u32,
        available: u32,
        active_planes: u32,
    },

    /// A non-blocking transaction would need a full modeset; retry as a blocking commit.
    #[error("non-blocking commit requires a modeset, try again")]
    TryAgain,

    #[error("busy: {0}")]
    Busy(&'static str),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("hardware programming failed: {0}")]
    Hardware(String),

    #[error("device reset")]
    DeviceReset,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl KmsError {
    /// Whether the caller may retry the same request later (or as a blocking commit).
    pub fn is_retryable(&self) -> bool {
        matches!(self, KmsError::TryAgain | KmsError::Busy(_))
    }

    /// Whether the error was produced by validation, i.e. no hardware state was touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            KmsError::NotFound(_)
                | KmsError::UnknownFramebuffer(_)
                | KmsError::UnknownProperty { .. }
                | KmsError::Invalid(_)
                | KmsError::Range(_)
                | KmsError::NoSpace(_)
                | KmsError::Bandwidth { .. }
        )
    }
}
