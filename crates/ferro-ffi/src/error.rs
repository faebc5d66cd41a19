//! Unified error taxonomy for the FFI engine
//!
//! All errors flow through the single [`FfiError`] type, ensuring consistent
//! formatting across type resolution, layout, marshaling, calls and
//! callbacks. Construction-time failures leave the object unusable;
//! call-time failures are raised before any native code executes.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type FfiResult<T> = Result<T, FfiError>;

/// Errors raised by the FFI engine.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FfiError {
    /// A string type name did not resolve to a known primitive.
    #[error("unknown type: {0}")]
    UnknownType(String),

    /// A raw type tag was outside the valid range of the catalog.
    #[error("type tag {0} out of range")]
    OutOfRangeType(i32),

    /// Too few arguments supplied for a declared signature.
    #[error("expected {expected} arguments, got {got}")]
    ArgumentCountMismatch { expected: usize, got: usize },

    /// A host value had the wrong shape for the declared native type.
    #[error("invalid value for {expected}: got {got}")]
    InvalidArgumentValue { expected: String, got: String },

    /// A composite write destination was smaller than the layout requires.
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// A write to, or a required read from, a null native pointer.
    #[error("null pointer dereference")]
    NullPointerDereference,

    /// An address reconstructed from a host big integer lost bits.
    #[error("address {0} does not fit in a native pointer")]
    PrecisionLoss(i128),

    /// The libffi call interface could not be prepared. Terminal: the
    /// signature is permanently unusable.
    #[error("failed to prepare call interface: {0}")]
    CallInterfacePreparationFailed(String),

    /// An operation was attempted on a released callback registration.
    #[error("callback has been released")]
    CallbackReleased,

    /// Unrecoverable failure while executing the host side of a callback.
    #[error("exception in callback: {0}")]
    NativeExceptionInCallback(String),

    /// A field was added to a layout after its native form was captured by
    /// a call interface.
    #[error("layout is frozen: a call interface already captured its native form")]
    LayoutFrozen,

    /// The async call worker terminated abnormally (panicked native call).
    #[error("native call worker terminated abnormally: {0}")]
    CallWorkerFailed(String),

    /// Library file not found in the search paths.
    #[error("library not found: {0}")]
    LibraryNotFound(String),

    /// The dynamic loader failed to open a library.
    #[error("failed to load library: {0}")]
    LibraryLoadFailed(String),

    /// Symbol not found in a loaded library.
    #[error("symbol '{symbol}' not found in library '{library}'")]
    SymbolNotFound { library: String, symbol: String },
}

impl FfiError {
    /// Shorthand for the common value-shape mismatch.
    pub(crate) fn invalid_value(expected: impl Into<String>, got: impl Into<String>) -> Self {
        FfiError::InvalidArgumentValue {
            expected: expected.into(),
            got: got.into(),
        }
    }
}
