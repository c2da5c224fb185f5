//! Error types for vexr

use crate::dtype::DType;
use thiserror::Error;

/// Result type alias using vexr's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in vexr operations
///
/// Every error is reported synchronously by the call that triggered it, or,
/// for asynchronous launches, by the next blocking call touching the same
/// device. Nothing is retried automatically.
#[derive(Error, Debug)]
pub enum Error {
    /// No compute device matched the caller's constraints
    #[error("No compute devices available: {reason}")]
    DeviceEnumeration {
        /// Why enumeration produced an empty device list
        reason: String,
    },

    /// A generated kernel could not be compiled by the backend
    #[error("Failed to compile kernel '{kernel}': {diagnostics}")]
    KernelCompile {
        /// Name of the generated kernel
        kernel: String,
        /// Backend compiler diagnostics
        diagnostics: String,
    },

    /// Operands of one expression, reduction or multiply are partitioned differently
    #[error("Partition mismatch: {reason}")]
    PartitionMismatch {
        /// Which operands disagree and how
        reason: String,
    },

    /// Sparse matrix input is inconsistent or references invalid columns
    #[error("Malformed sparse matrix: {reason}")]
    MalformedMatrix {
        /// The first inconsistency found
        reason: String,
    },

    /// An enqueued kernel or copy failed at the device level
    #[error("Device error on {device}: {reason}")]
    DeviceRuntime {
        /// Device name
        device: String,
        /// Driver or backend diagnostic
        reason: String,
    },

    /// Unsupported dtype for an operation
    #[error("Unsupported dtype {dtype:?} for operation '{op}'")]
    UnsupportedDType {
        /// The unsupported dtype
        dtype: DType,
        /// The operation name
        op: &'static str,
    },

    /// Index out of bounds
    #[error("Index {index} out of bounds for vector of size {size}")]
    IndexOutOfBounds {
        /// The invalid index
        index: usize,
        /// Size of the vector
        size: usize,
    },

    /// Invalid argument provided to an operation
    #[error("Invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// The argument name
        arg: &'static str,
        /// Reason for invalidity
        reason: String,
    },

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a partition mismatch error
    pub fn partition_mismatch(reason: impl Into<String>) -> Self {
        Self::PartitionMismatch {
            reason: reason.into(),
        }
    }

    /// Create a malformed matrix error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedMatrix {
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(arg: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            arg,
            reason: reason.into(),
        }
    }

    /// Create an unsupported dtype error
    pub fn unsupported_dtype(dtype: DType, op: &'static str) -> Self {
        Self::UnsupportedDType { dtype, op }
    }

    /// Create a device runtime error
    pub fn device(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DeviceRuntime {
            device: device.into(),
            reason: reason.into(),
        }
    }
}
