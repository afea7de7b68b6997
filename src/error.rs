//! Error types for the state cache
//!
//! Everything in this crate that can go wrong is a contract violation or an
//! unrecoverable backend failure. Validation code returns [`StateCacheError`]
//! so the failing condition carries full context, and the aggregate escalates
//! through [`fatal`] instead of continuing with state that would render garbage.

use std::fmt;
use thiserror::Error;

/// Result type alias for state cache operations
pub type Result<T> = std::result::Result<T, StateCacheError>;

/// Main error type for the state cache
#[derive(Error, Debug)]
pub enum StateCacheError {
    // === Pipeline errors ===
    #[error("Pipeline compilation failed: {label}: {error}")]
    PipelineCompilation {
        label: String,
        error: String,
        /// Debug dump of the descriptor that failed to build
        descriptor: String,
    },

    #[error("No pipeline object set before draw")]
    MissingPipeline,

    #[error("Blend key table exhausted: more than {capacity} distinct color target blend states")]
    BlendKeyExhausted { capacity: usize },

    #[error("Format {format} has no pipeline key encoding")]
    UnsupportedFormat { format: String },

    // === Render target errors ===
    #[error("Sample count mismatch: expected {expected}, {attachment} has {found}")]
    SampleCountMismatch {
        expected: u32,
        found: u32,
        attachment: String,
    },

    #[error("Attachment format mismatch: pipeline '{pipeline}' expects {expected} for {attachment}, bound {found}")]
    AttachmentFormatMismatch {
        pipeline: String,
        attachment: String,
        expected: String,
        found: String,
    },

    #[error("Too many color targets: {count} (max {max})")]
    TooManyColorTargets { count: usize, max: usize },

    #[error("Invalid resolve target for {attachment}: {reason}")]
    InvalidResolveTarget { attachment: String, reason: String },

    #[error("Depth and stencil both in use on {texture} but the device cannot share one attachment and no separate stencil surface was provided")]
    MissingStencilSurface { texture: String },

    // === Capability errors ===
    #[error("Unsupported capability: {feature}")]
    UnsupportedCapability { feature: String },

    // === Parameter errors ===
    #[error("Invalid parameter: {parameter}: {reason}")]
    InvalidParameter { parameter: String, reason: String },
}

// Helper constructors for common error patterns
impl StateCacheError {
    /// Create an unsupported capability error
    pub fn unsupported(feature: impl fmt::Display) -> Self {
        Self::UnsupportedCapability {
            feature: feature.to_string(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(parameter: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::InvalidParameter {
            parameter: parameter.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create an invalid resolve target error
    pub fn invalid_resolve(attachment: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::InvalidResolveTarget {
            attachment: attachment.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Escalate an unrecoverable error.
///
/// Logs the error and panics. Invalid GPU state has no degraded rendering
/// path, so callers never continue past this point.
#[cold]
#[track_caller]
pub fn fatal(error: StateCacheError) -> ! {
    log::error!("Fatal state cache error: {}", error);
    if let StateCacheError::PipelineCompilation { descriptor, .. } = &error {
        log::error!("Failing descriptor: {}", descriptor);
    }
    panic!("{}", error)
}
